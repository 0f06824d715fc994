//! Uplink sessions: several priority-tagged logical channels over one
//! physical connection.
//!
//! Outbound blocks go through a [`BoundedMessageBlockPrioritizer`] before
//! they reach the wire. Each priority class has a fixed capacity and a full
//! class rejects new blocks with [`UplinkError::QueueFull`] instead of
//! blocking or growing.
//!
//! ```text
//!  producers ──submit_or_fail──► ┌──────────────────────────┐
//!                                │ SessionControl   [....]  │
//!                                │ ChannelInitiation[..]    │  take_next
//!                                │ Default          [.....] ├──────────► writer task ──► stream
//!                                │ ...                      │
//!                                │ LowNonBlockable  [.]     │
//!                                └──────────────────────────┘
//!  per-channel receivers ◄── reader task ◄── stream
//! ```

mod codec;
mod config;
mod prioritizer;
mod session;

use serde::{Deserialize, Serialize};

use crate::wire::WireError;

pub use codec::{BLOCK_HEADER_SIZE, encode_block, try_decode_block};
pub use config::{
    UplinkConfigurationProvider, UplinkProtocolConfiguration, UplinkProtocolConfigurationBuilder,
};
pub use prioritizer::BoundedMessageBlockPrioritizer;
pub use session::UplinkSession;

/// Dequeue precedence of a block; earlier variants are sent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageBlockPriority {
    /// Handshake and goodbye of the session itself.
    SessionControl = 0,
    /// Opening and answering logical channels.
    ChannelInitiation = 1,
    /// Regular traffic.
    Default = 2,
    /// Published descriptor lists.
    ToolDescriptorUpdates = 3,
    /// Traffic relayed for another session.
    Forwarding = 4,
    /// Bulk traffic that must never hold up anything else.
    LowNonBlockable = 5,
}

impl MessageBlockPriority {
    /// All priorities in dequeue order.
    pub const ALL: [MessageBlockPriority; 6] = [
        MessageBlockPriority::SessionControl,
        MessageBlockPriority::ChannelInitiation,
        MessageBlockPriority::Default,
        MessageBlockPriority::ToolDescriptorUpdates,
        MessageBlockPriority::Forwarding,
        MessageBlockPriority::LowNonBlockable,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for MessageBlockPriority {
    type Error = UplinkError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(tag as usize)
            .copied()
            .ok_or(UplinkError::UnknownPriority { tag })
    }
}

/// What a block carries. The payload format is up to the block's user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageBlockType {
    /// Session setup.
    Handshake = 1,
    /// Orderly end of the session.
    Goodbye = 2,
    /// Request to open a logical channel.
    ChannelInit = 3,
    /// Answer to a [`MessageBlockType::ChannelInit`].
    ChannelInitResponse = 4,
    /// Announcement of the services available behind the session.
    ToolDescriptorListUpdate = 5,
    /// Request on an open logical channel.
    Request = 6,
    /// Response on an open logical channel.
    Response = 7,
    /// Event notification on an open logical channel.
    Event = 8,
    /// Start of a file transfer section.
    FileHeader = 9,
    /// A chunk of file content.
    FileContent = 10,
    /// The logical channel is finished.
    ChannelClose = 11,
}

impl TryFrom<u8> for MessageBlockType {
    type Error = UplinkError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            1 => Self::Handshake,
            2 => Self::Goodbye,
            3 => Self::ChannelInit,
            4 => Self::ChannelInitResponse,
            5 => Self::ToolDescriptorListUpdate,
            6 => Self::Request,
            7 => Self::Response,
            8 => Self::Event,
            9 => Self::FileHeader,
            10 => Self::FileContent,
            11 => Self::ChannelClose,
            other => return Err(UplinkError::UnknownBlockType { tag: other }),
        })
    }
}

/// A typed opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBlock {
    /// Kind of block.
    pub block_type: MessageBlockType,
    /// Opaque content.
    pub payload: Vec<u8>,
}

impl MessageBlock {
    /// Create a block.
    pub fn new(block_type: MessageBlockType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            block_type,
            payload: payload.into(),
        }
    }
}

/// A [`MessageBlock`] addressed to a logical channel at a priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBlockWithMetadata {
    /// The block itself.
    pub block: MessageBlock,
    /// Logical channel within the session; 0 is the session itself.
    pub channel_id: u64,
    /// Dequeue precedence.
    pub priority: MessageBlockPriority,
}

impl MessageBlockWithMetadata {
    /// Wrap `block` for `channel_id` at `priority`.
    pub fn new(block: MessageBlock, channel_id: u64, priority: MessageBlockPriority) -> Self {
        Self {
            block,
            channel_id,
            priority,
        }
    }
}

/// Errors raised by the prioritizer and uplink sessions.
#[derive(Debug, thiserror::Error)]
pub enum UplinkError {
    /// The priority class is at capacity; the block was not queued.
    #[error("operation failed: queue full for {priority:?} (capacity {capacity})")]
    QueueFull {
        /// The saturated priority class.
        priority: MessageBlockPriority,
        /// Its configured capacity.
        capacity: usize,
    },

    /// The session was closed locally or by the remote side.
    #[error("uplink session is closed")]
    SessionClosed,

    /// The priority byte of a block header is not known.
    #[error("unknown block priority tag: {tag}")]
    UnknownPriority {
        /// The rejected tag.
        tag: u8,
    },

    /// The type byte of a block header is not known.
    #[error("unknown block type tag: {tag}")]
    UnknownBlockType {
        /// The rejected tag.
        tag: u8,
    },

    /// Length or checksum validation of a block failed.
    #[error("malformed block: {0}")]
    Wire(#[from] WireError),

    /// The underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
