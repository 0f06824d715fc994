//! Pluggable message serialization.
//!
//! Every payload that crosses a message channel (network requests, property
//! deltas, service call parameters and return values) goes through a
//! [`MessageCodec`]. [`JsonCodec`] is the default: it is human-readable, which
//! makes captured traffic easy to inspect.
//!
//! # Example
//!
//! ```rust
//! use nodelink_core::{JsonCodec, MessageCodec};
//!
//! let codec = JsonCodec;
//! let bytes = codec.encode(&vec!["a", "b"]).expect("encode");
//! let decoded: Vec<String> = codec.decode(&bytes).expect("decode");
//! assert_eq!(decoded, vec!["a".to_string(), "b".to_string()]);
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Failed to encode a value to bytes.
    #[error("encode error: {0}")]
    Encode(Box<dyn std::error::Error + Send + Sync>),
    /// Failed to decode bytes to a value.
    #[error("decode error: {0}")]
    Decode(Box<dyn std::error::Error + Send + Sync>),
}

/// Pluggable serialization format.
///
/// Codecs are shared between tasks running on different threads, hence the
/// `Send + Sync` bounds.
pub trait MessageCodec: Clone + Send + Sync + 'static {
    /// Encode a serializable value to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable value.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct PropertyDelta {
        node: String,
        entries: BTreeMap<String, Option<String>>,
    }

    #[test]
    fn test_json_codec_preserves_null_values() {
        let codec = JsonCodec;
        let mut entries = BTreeMap::new();
        entries.insert("state".to_string(), Some("online".to_string()));
        entries.insert("removed".to_string(), None);
        let delta = PropertyDelta {
            node: "n1".to_string(),
            entries,
        };

        let bytes = codec.encode(&delta).expect("encode should succeed");
        let decoded: PropertyDelta = codec.decode(&bytes).expect("decode should succeed");

        assert_eq!(decoded, delta);
        assert_eq!(decoded.entries.get("removed"), Some(&None));
    }

    #[test]
    fn test_json_codec_encodes_unsized_values() {
        let codec = JsonCodec;
        let bytes = codec.encode("echo").expect("encode should succeed");
        assert_eq!(&bytes, br#""echo""#);

        let slice: &[i64] = &[1, 2, 3];
        let bytes = codec.encode(slice).expect("encode should succeed");
        let decoded: Vec<i64> = codec.decode(&bytes).expect("decode should succeed");
        assert_eq!(decoded, vec![1, 2, 3]);
    }

    #[test]
    fn test_json_codec_decode_error() {
        let codec = JsonCodec;
        let result: Result<PropertyDelta, CodecError> = codec.decode(b"not valid json {");

        let err = result.expect_err("decode must fail");
        assert!(matches!(err, CodecError::Decode(_)));
        assert!(err.to_string().contains("decode error"));
    }

    #[test]
    fn test_json_codec_type_mismatch() {
        let codec = JsonCodec;
        let bytes = codec.encode(&42u64).expect("encode should succeed");

        let result: Result<String, CodecError> = codec.decode(&bytes);
        assert!(result.is_err());
    }

    #[test]
    fn test_codec_error_display() {
        let encode_err = CodecError::Encode(Box::new(std::io::Error::other("boom")));
        assert_eq!(encode_err.to_string(), "encode error: boom");
    }
}
