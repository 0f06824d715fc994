//! # nodelink-core
//!
//! Value types shared by every nodelink crate.
//!
//! - [`ContactPoint`]: transport-qualified address in the
//!   `transport:host:port(key=value,...)` format
//! - [`NodeId`]: identity of one running node instance, distinguishing
//!   restarts of the same installation
//! - [`MessageCodec`]: pluggable serialization used for wire payloads and
//!   service call parameters, with [`JsonCodec`] as the default

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod codec;
mod contact_point;
mod node_id;

// Codec exports
pub use codec::{CodecError, JsonCodec, MessageCodec};

// Addressing exports
pub use contact_point::{ContactPoint, ContactPointParseError};
pub use node_id::{NodeId, NodeIdParseError};
