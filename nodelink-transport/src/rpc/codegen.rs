//! Support functions for code generated by `#[remote_service]`.

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::call::{CallError, RemoteOperationError};
use super::registry::InvocationError;
use crate::{JsonCodec, MessageCodec};

/// Encode one call parameter on the caller side.
///
/// A parameter that cannot be serialized fails the call as
/// `CommunicationFailed`, like any other failure to carry it.
pub fn encode_parameter<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CallError> {
    JsonCodec.encode(value).map_err(|e| {
        CallError::Remote(RemoteOperationError::communication_failed(format!(
            "failed to encode parameter: {e}"
        )))
    })
}

/// Decode the return value on the caller side.
pub fn decode_return<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CallError> {
    JsonCodec.decode(bytes).map_err(|e| {
        CallError::Remote(RemoteOperationError::communication_failed(format!(
            "failed to decode return value: {e}"
        )))
    })
}

/// Fail unless exactly `expected` parameters arrived.
pub fn check_parameter_count(
    method: &str,
    parameters: &[Vec<u8>],
    expected: usize,
) -> Result<(), InvocationError> {
    if parameters.len() == expected {
        Ok(())
    } else {
        Err(InvocationError::internal(format!(
            "{method} expects {expected} parameters, got {}",
            parameters.len()
        )))
    }
}

/// Decode parameter `index` on the callee side.
pub fn decode_parameter<T: DeserializeOwned>(
    method: &str,
    parameters: &[Vec<u8>],
    index: usize,
) -> Result<T, InvocationError> {
    let bytes = parameters
        .get(index)
        .ok_or_else(|| InvocationError::internal(format!("{method}: missing parameter {index}")))?;
    JsonCodec.decode(bytes).map_err(|e| {
        InvocationError::internal(format!("{method}: cannot decode parameter {index}: {e}"))
    })
}

/// Turn a service method's result into the dispatch result on the callee side.
///
/// A [`CallError::Remote`] raised inside the method (a failed nested call)
/// counts as an internal failure of this invocation.
pub fn encode_return<T: Serialize>(
    method: &str,
    result: Result<T, CallError>,
) -> Result<Vec<u8>, InvocationError> {
    match result {
        Ok(value) => JsonCodec.encode(&value).map_err(|e| {
            InvocationError::internal(format!("{method}: cannot encode return value: {e}"))
        }),
        Err(CallError::Service(exception)) => Err(InvocationError::Service(exception)),
        Err(CallError::Remote(e)) => Err(InvocationError::internal(format!(
            "{method}: nested call failed: {e}"
        ))),
    }
}

/// Error for a method name the service does not declare.
pub fn unknown_method(service: &str, method: &str) -> InvocationError {
    InvocationError::internal(format!("service {service} has no method {method}"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::rpc::call::{RemoteErrorKind, ServiceException};

    #[test]
    fn test_parameter_errors_are_internal() {
        let params = vec![encode_parameter(&7u32).expect("encode")];
        assert_eq!(decode_parameter::<u32>("m", &params, 0).expect("decode"), 7);
        assert!(matches!(
            decode_parameter::<u32>("m", &params, 1),
            Err(InvocationError::Internal { .. })
        ));
        assert!(matches!(
            decode_parameter::<String>("m", &params, 0),
            Err(InvocationError::Internal { .. })
        ));
        assert!(check_parameter_count("m", &params, 2).is_err());
    }

    #[test]
    fn test_caller_side_codec_failures_are_communication_failures() {
        // JSON object keys must be strings.
        let unencodable: HashMap<(u32, u32), u32> = HashMap::from([((1, 2), 3)]);
        let err = encode_parameter(&unencodable).expect_err("tuple keys");
        assert_eq!(err.remote_kind(), Some(RemoteErrorKind::CommunicationFailed));

        let err = decode_return::<u32>(b"\"text\"").expect_err("wrong type");
        assert_eq!(err.remote_kind(), Some(RemoteErrorKind::CommunicationFailed));
    }

    #[test]
    fn test_encode_return_keeps_business_exception() {
        let exception = ServiceException::new("Busy", "try later");
        let result: Result<u32, CallError> = Err(exception.clone().into());
        assert_eq!(encode_return("m", result), Err(InvocationError::Service(exception)));
    }
}
