//! Frame format for stream-based transports.
//!
//! Frame format: `[length:4][checksum:4][kind:1][payload:N]`
//!
//! - **length**: Total frame size including header (little-endian u32)
//! - **checksum**: CRC32C of (kind + payload)
//! - **kind**: [`FrameKind`] discriminant
//! - **payload**: codec-encoded handshake, request or response

/// Header size: 4 (length) + 4 (checksum) + 1 (kind) = 9 bytes.
pub const HEADER_SIZE: usize = 9;

/// Maximum payload size (1MB).
///
/// Frames larger than this are rejected before any allocation happens.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Wire format error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the frame.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Checksum verification failed.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum from the header.
        expected: u32,
        /// Checksum computed from the data.
        actual: u32,
    },

    /// Payload exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    FrameTooLarge {
        /// Payload size in bytes.
        size: usize,
    },

    /// Length field has an invalid value.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The invalid length value from the header.
        length: u32,
    },

    /// Kind byte does not name a known frame kind.
    #[error("unknown frame kind: {kind}")]
    UnknownKind {
        /// The rejected kind byte.
        kind: u8,
    },
}

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Node id exchange at connection setup.
    Handshake = 1,
    /// An encoded `NetworkRequest`.
    Request = 2,
    /// An encoded `NetworkResponse`.
    Response = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(kind: u8) -> Result<Self, Self::Error> {
        match kind {
            1 => Ok(FrameKind::Handshake),
            2 => Ok(FrameKind::Request),
            3 => Ok(FrameKind::Response),
            other => Err(WireError::UnknownKind { kind: other }),
        }
    }
}

fn compute_checksum(kind: u8, payload: &[u8]) -> u32 {
    let partial = crc32c::crc32c(&[kind]);
    crc32c::crc32c_append(partial, payload)
}

/// Serialize a frame.
///
/// # Errors
///
/// Returns `FrameTooLarge` if the payload exceeds [`MAX_PAYLOAD_SIZE`].
///
/// # Examples
///
/// ```
/// use nodelink_transport::wire::{FrameKind, deserialize_frame, serialize_frame};
///
/// let frame = serialize_frame(FrameKind::Request, b"hello").expect("serialize");
/// let (kind, payload) = deserialize_frame(&frame).expect("deserialize");
/// assert_eq!(kind, FrameKind::Request);
/// assert_eq!(payload, b"hello");
/// ```
pub fn serialize_frame(kind: FrameKind, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge {
            size: payload.len(),
        });
    }

    let total_length = HEADER_SIZE + payload.len();
    let mut data = Vec::with_capacity(total_length);
    data.extend_from_slice(&(total_length as u32).to_le_bytes());
    data.extend_from_slice(&compute_checksum(kind as u8, payload).to_le_bytes());
    data.push(kind as u8);
    data.extend_from_slice(payload);
    Ok(data)
}

/// Deserialize exactly one frame, validating length, kind and checksum.
///
/// # Errors
///
/// Returns `InsufficientData` if the buffer does not hold a complete frame,
/// and the other variants for malformed data.
pub fn deserialize_frame(data: &[u8]) -> Result<(FrameKind, Vec<u8>), WireError> {
    match try_deserialize_frame(data)? {
        Some((kind, payload, _)) => Ok((kind, payload)),
        None => {
            let needed = if data.len() < HEADER_SIZE {
                HEADER_SIZE
            } else {
                read_u32(data, 0) as usize
            };
            Err(WireError::InsufficientData {
                needed,
                have: data.len(),
            })
        }
    }
}

/// Try to deserialize from a buffer that may contain partial data.
///
/// # Returns
///
/// - `Ok(Some((kind, payload, consumed)))` if a complete frame was parsed
/// - `Ok(None)` if more data is needed
/// - `Err` if data is malformed
pub fn try_deserialize_frame(
    data: &[u8],
) -> Result<Option<(FrameKind, Vec<u8>, usize)>, WireError> {
    if data.len() < HEADER_SIZE {
        return Ok(None);
    }

    let length = read_u32(data, 0);
    if (length as usize) < HEADER_SIZE {
        return Err(WireError::InvalidLength { length });
    }
    if length as usize - HEADER_SIZE > MAX_PAYLOAD_SIZE {
        return Err(WireError::FrameTooLarge {
            size: length as usize - HEADER_SIZE,
        });
    }

    let expected_len = length as usize;
    if data.len() < expected_len {
        return Ok(None);
    }

    let checksum = read_u32(data, 4);
    let kind_byte = data[8];
    let payload = &data[HEADER_SIZE..expected_len];

    let computed = compute_checksum(kind_byte, payload);
    if computed != checksum {
        return Err(WireError::ChecksumMismatch {
            expected: checksum,
            actual: computed,
        });
    }

    let kind = FrameKind::try_from(kind_byte)?;
    Ok(Some((kind, payload.to_vec(), expected_len)))
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}
