//! Service call envelopes and the errors crossing the RPC boundary.

use serde::{Deserialize, Serialize};

use crate::NodeId;
use crate::protocol::new_request_id;

/// Position of a call within a reliable RPC stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliableCallTag {
    /// Random id of the stream.
    pub stream_id: String,
    /// Sequence number of the call, starting at 1.
    pub seq: u64,
}

/// One method invocation addressed to a service on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCallRequest {
    /// Random id, echoed in the [`ServiceCallResult`].
    pub request_id: String,
    /// Node hosting the service.
    pub target: NodeId,
    /// Node issuing the call.
    pub caller: NodeId,
    /// Name of the service interface.
    pub service_name: String,
    /// Method to invoke.
    pub method_name: String,
    /// Codec-encoded parameters, one entry per method argument.
    pub parameters: Vec<Vec<u8>>,
    /// Set when the call belongs to a reliable RPC stream.
    pub reliable_stream: Option<ReliableCallTag>,
}

impl ServiceCallRequest {
    /// Create a request with a fresh id and no stream tag.
    pub fn new(
        target: NodeId,
        caller: NodeId,
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        parameters: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            request_id: new_request_id(),
            target,
            caller,
            service_name: service_name.into(),
            method_name: method_name.into(),
            parameters,
            reliable_stream: None,
        }
    }
}

/// A business exception thrown by a service method.
///
/// Carried structurally to the caller; type and message are preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{exception_type}: {message}")]
pub struct ServiceException {
    /// Application-defined exception type name.
    pub exception_type: String,
    /// Human-readable message.
    pub message: String,
}

impl ServiceException {
    /// Create an exception.
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_type: exception_type.into(),
            message: message.into(),
        }
    }
}

/// The answer to a [`ServiceCallRequest`] that reached its service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCallResult {
    /// Id of the request this answers.
    pub request_id: String,
    /// Encoded return value, or the business exception thrown.
    pub outcome: Result<Vec<u8>, ServiceException>,
}

/// Classification of a [`RemoteOperationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// The call could not be carried to the target or back.
    CommunicationFailed,
    /// No service with the requested name is registered at the target.
    ServiceNotFound,
    /// The method exists but is not in the service's whitelist.
    MethodNotPermitted,
    /// The dispatcher failed while invoking the service.
    InternalError,
    /// The call may or may not have been executed.
    OutcomeUnknown,
}

/// A non-business failure of a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteOperationError {
    /// What went wrong.
    pub kind: RemoteErrorKind,
    /// Details about the failure.
    pub message: String,
}

impl RemoteOperationError {
    /// Create an error of the given kind.
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a [`RemoteErrorKind::CommunicationFailed`] error.
    pub fn communication_failed(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::CommunicationFailed, message)
    }
}

/// Error returned by service proxy methods.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The service method threw a business exception.
    #[error("service exception: {0}")]
    Service(#[from] ServiceException),

    /// The call failed outside of the service method.
    #[error("remote operation failed: {0}")]
    Remote(#[from] RemoteOperationError),
}

impl CallError {
    /// The remote error kind, if this is not a business exception.
    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            CallError::Service(_) => None,
            CallError::Remote(e) => Some(e.kind),
        }
    }
}

/// Outcome of a service call as seen by the caller: the target's result,
/// or the reason the call did not complete.
pub type ServiceCallEnvelope = Result<ServiceCallResult, RemoteOperationError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JsonCodec, MessageCodec};

    #[test]
    fn test_envelope_keeps_exception_structure() {
        let envelope: ServiceCallEnvelope = Ok(ServiceCallResult {
            request_id: "r1".to_string(),
            outcome: Err(ServiceException::new("QuotaExceeded", "limit is 3")),
        });
        let bytes = JsonCodec.encode(&envelope).expect("encode");
        let decoded: ServiceCallEnvelope = JsonCodec.decode(&bytes).expect("decode");

        let outcome = decoded.expect("envelope ok").outcome;
        let exception = outcome.expect_err("business exception");
        assert_eq!(exception.exception_type, "QuotaExceeded");
        assert_eq!(exception.message, "limit is 3");
    }

    #[test]
    fn test_call_error_kind() {
        let remote =
            CallError::from(RemoteOperationError::new(RemoteErrorKind::ServiceNotFound, "x"));
        assert_eq!(remote.remote_kind(), Some(RemoteErrorKind::ServiceNotFound));
        let service = CallError::from(ServiceException::new("E", "m"));
        assert_eq!(service.remote_kind(), None);
        assert_eq!(service.to_string(), "service exception: E: m");
    }
}
