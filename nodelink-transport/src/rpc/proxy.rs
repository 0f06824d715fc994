//! Caller side of service calls: invokers, callers and typed proxies.

use std::sync::Arc;

use async_trait::async_trait;

use super::call::{CallError, RemoteOperationError, ServiceCallEnvelope, ServiceCallRequest};
use super::reliable::{ReliableRpcStreamHandle, ReliableStreamPolicy};
use crate::NodeId;
use crate::error::MessagingResult;

/// Carries a [`ServiceCallRequest`] to its target and returns the envelope.
///
/// The outer error is a transport failure; the inner result is the verdict
/// of the target node.
#[async_trait]
pub trait ServiceCallInvoker: Send + Sync {
    /// Id of the node issuing calls.
    fn local_node_id(&self) -> &NodeId;

    /// Perform the call.
    async fn invoke(&self, request: ServiceCallRequest) -> MessagingResult<ServiceCallEnvelope>;
}

/// Untyped handle for calling methods of one service on one node.
#[derive(Clone)]
pub struct RemoteServiceCaller {
    target: NodeId,
    service_name: String,
    invoker: Arc<dyn ServiceCallInvoker>,
    reliable: Option<Arc<ReliableRpcStreamHandle>>,
}

impl RemoteServiceCaller {
    /// Create a caller.
    pub fn new(
        target: NodeId,
        service_name: impl Into<String>,
        invoker: Arc<dyn ServiceCallInvoker>,
        reliable: Option<Arc<ReliableRpcStreamHandle>>,
    ) -> Self {
        Self {
            target,
            service_name: service_name.into(),
            invoker,
            reliable,
        }
    }

    /// The node hosting the service.
    pub fn target(&self) -> &NodeId {
        &self.target
    }

    /// Name of the called service.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The reliable stream calls go through, if any.
    pub fn reliable_stream(&self) -> Option<&Arc<ReliableRpcStreamHandle>> {
        self.reliable.as_ref()
    }

    /// A caller for another service on the same node, sharing the stream.
    pub fn for_service(&self, service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..self.clone()
        }
    }

    /// Call `method` with encoded parameters and return the encoded result.
    ///
    /// # Errors
    ///
    /// - `CallError::Service` for business exceptions thrown by the method
    /// - `CallError::Remote` for everything else; transport failures are
    ///   always `CommunicationFailed`
    pub async fn call_method(
        &self,
        method: &str,
        parameters: Vec<Vec<u8>>,
    ) -> Result<Vec<u8>, CallError> {
        let request = ServiceCallRequest::new(
            self.target.clone(),
            self.invoker.local_node_id().clone(),
            self.service_name.clone(),
            method,
            parameters,
        );

        let envelope = match &self.reliable {
            Some(stream) => stream.call(request).await,
            None => match self.invoker.invoke(request).await {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::debug!(
                        node = %self.target,
                        service = %self.service_name,
                        method,
                        error = %e,
                        "service call failed in transport"
                    );
                    Err(RemoteOperationError::communication_failed(e.to_string()))
                }
            },
        };

        let result = envelope?;
        Ok(result.outcome?)
    }
}

impl std::fmt::Debug for RemoteServiceCaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteServiceCaller")
            .field("target", &self.target)
            .field("service_name", &self.service_name)
            .field("reliable", &self.reliable.as_ref().map(|s| s.stream_id().to_string()))
            .finish()
    }
}

/// A typed proxy for a remote service interface.
///
/// Implemented by the `{Trait}Proxy` types `#[remote_service]` generates.
pub trait ServiceProxy: Sized {
    /// Name the service is called under.
    const SERVICE_NAME: &'static str;

    /// Wrap a caller bound to this service.
    fn from_caller(caller: RemoteServiceCaller) -> Self;

    /// The underlying caller.
    fn caller(&self) -> &RemoteServiceCaller;
}

/// Creates typed proxies for services on any node.
#[derive(Clone)]
pub struct ServiceProxyFactory {
    invoker: Arc<dyn ServiceCallInvoker>,
    reliable_policy: ReliableStreamPolicy,
}

impl ServiceProxyFactory {
    /// Create a factory issuing calls through `invoker`.
    pub fn new(
        invoker: Arc<dyn ServiceCallInvoker>,
        reliable_policy: ReliableStreamPolicy,
    ) -> Self {
        Self {
            invoker,
            reliable_policy,
        }
    }

    /// Create a proxy for service `P` on `node_id`.
    ///
    /// With a reliable stream, calls go through it; the stream must target
    /// `node_id`, otherwise it is ignored.
    pub fn create_service_proxy<P: ServiceProxy>(
        &self,
        node_id: &NodeId,
        reliable_stream: Option<&Arc<ReliableRpcStreamHandle>>,
    ) -> P {
        let reliable = match reliable_stream {
            Some(stream) if stream.target() == node_id => Some(stream.clone()),
            Some(stream) => {
                tracing::warn!(
                    stream_id = stream.stream_id(),
                    stream_target = %stream.target(),
                    %node_id,
                    "reliable stream targets another node; ignoring it"
                );
                None
            }
            None => None,
        };
        P::from_caller(RemoteServiceCaller::new(
            node_id.clone(),
            P::SERVICE_NAME,
            self.invoker.clone(),
            reliable,
        ))
    }

    /// Create a proxy for another interface of the node behind `proxy`.
    pub fn create_additional_proxy<P: ServiceProxy, Q: ServiceProxy>(&self, proxy: &Q) -> P {
        P::from_caller(proxy.caller().for_service(P::SERVICE_NAME))
    }

    /// Open a new reliable RPC stream to `target`.
    pub fn create_reliable_rpc_stream(&self, target: &NodeId) -> Arc<ReliableRpcStreamHandle> {
        let handle = ReliableRpcStreamHandle::new(
            target.clone(),
            self.invoker.clone(),
            self.reliable_policy.clone(),
        );
        tracing::debug!(stream_id = handle.stream_id(), %target, "created reliable rpc stream");
        Arc::new(handle)
    }
}
