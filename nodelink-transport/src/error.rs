//! Error types for the nodelink messaging layer.

use std::time::Duration;

use crate::protocol::ResultCode;
use crate::wire::WireError;
use crate::{CodecError, NodeId};

/// Errors raised by transports, message channels and routing.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// No transport provider is registered for the contact point's transport id.
    #[error("unknown transport id: {transport_id}")]
    UnknownTransport {
        /// The transport id that was requested.
        transport_id: String,
    },

    /// Establishing a connection failed; nothing was sent.
    #[error("failed to connect to {contact_point}: {message}")]
    ConnectionFailed {
        /// String form of the contact point.
        contact_point: String,
        /// Details about the failure.
        message: String,
    },

    /// A server could not be started on the given contact point.
    #[error("failed to start server on {contact_point}: {message}")]
    ServerStartFailed {
        /// String form of the contact point.
        contact_point: String,
        /// Details about the failure.
        message: String,
    },

    /// The node id exchange at connection setup failed.
    #[error("handshake failed: {message}")]
    HandshakeFailed {
        /// Details about the failure.
        message: String,
    },

    /// The channel was already closed when the request was attempted.
    #[error("channel {channel_id} is closed")]
    ChannelClosed {
        /// Id of the closed channel.
        channel_id: String,
    },

    /// The channel broke after the request was handed to it.
    #[error("request on channel {channel_id} interrupted: {message}")]
    RequestInterrupted {
        /// Id of the failed channel.
        channel_id: String,
        /// Details about the failure.
        message: String,
    },

    /// No response arrived within the request timeout.
    #[error("request timed out after {timeout:?}")]
    Timeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// No channel or route leads to the target node.
    #[error("no route to node {target}")]
    NoRoute {
        /// The unreachable node.
        target: NodeId,
    },

    /// The remote side answered with a non-success result code.
    #[error("remote side reported {code:?}: {message}")]
    RemoteFailure {
        /// Result code from the response.
        code: ResultCode,
        /// Message carried in the response payload.
        message: String,
    },

    /// Encoding or decoding a payload failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A frame on a stream transport was malformed.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Socket I/O failed outside of a request exchange.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel service is shutting down.
    #[error("messaging layer is shut down")]
    ShutDown,
}

impl MessagingError {
    /// Whether the request may have reached the remote side before the failure.
    ///
    /// Connection setup failures, missing routes and local encoding errors
    /// guarantee that nothing was delivered.
    pub fn may_have_been_delivered(&self) -> bool {
        matches!(
            self,
            MessagingError::RequestInterrupted { .. } | MessagingError::Timeout { .. }
        )
    }
}

/// Result type for messaging operations.
pub type MessagingResult<T> = Result<T, MessagingError>;
