//! Request/response envelopes exchanged over message channels.

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Identifies which request handler processes a [`NetworkRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// A service call, routed to the service call dispatcher.
    ServiceCall,
    /// Initial property exchange on a new channel; the response carries the
    /// receiver's complementing knowledge.
    NodePropertiesInit,
    /// Incremental property update.
    NodePropertiesDelta,
}

/// Outcome of processing a request at the messaging level.
///
/// Service-level conditions such as an unknown service travel inside a
/// successful response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    /// The handler produced a response payload.
    Success,
    /// No handler is registered for the message type.
    NoMatchingHandler,
    /// A forwarding node found no route to the target; nothing was delivered.
    TargetNodeUnreachable,
    /// A forwarding node handed the request on, but the exchange broke
    /// before the answer came back. The target may have processed it.
    ForwardingInterrupted,
    /// The handler failed while processing the request.
    ExceptionAtDestination,
}

/// A request sent over a message channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    /// Random id correlating request and response.
    pub request_id: String,
    /// Selects the request handler.
    pub message_type: MessageType,
    /// Node that created the request.
    pub sender: NodeId,
    /// Codec-encoded body.
    pub payload: Vec<u8>,
}

impl NetworkRequest {
    /// Create a request with a fresh random id.
    pub fn new(message_type: MessageType, sender: NodeId, payload: Vec<u8>) -> Self {
        Self {
            request_id: new_request_id(),
            message_type,
            sender,
            payload,
        }
    }
}

/// The answer to a [`NetworkRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResponse {
    /// Id of the request this answers.
    pub request_id: String,
    /// Messaging-level outcome.
    pub result_code: ResultCode,
    /// Codec-encoded body, or a UTF-8 error message for failure codes.
    pub payload: Vec<u8>,
}

impl NetworkResponse {
    /// Successful response to `request`.
    pub fn success(request: &NetworkRequest, payload: Vec<u8>) -> Self {
        Self {
            request_id: request.request_id.clone(),
            result_code: ResultCode::Success,
            payload,
        }
    }

    /// Failure response to `request` with a readable message.
    pub fn failure(request: &NetworkRequest, result_code: ResultCode, message: &str) -> Self {
        Self {
            request_id: request.request_id.clone(),
            result_code,
            payload: message.as_bytes().to_vec(),
        }
    }

    /// Whether the result code is [`ResultCode::Success`].
    pub fn is_success(&self) -> bool {
        self.result_code == ResultCode::Success
    }

    /// The payload interpreted as an error message.
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Random 16-hex-character id used for requests and reliable streams.
pub(crate) fn new_request_id() -> String {
    use rand::Rng;
    format!("{:016x}", rand::rng().random::<u64>())
}
