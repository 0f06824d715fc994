//! Callee side of service calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::call::{
    RemoteErrorKind, RemoteOperationError, ServiceCallEnvelope, ServiceCallRequest,
    ServiceCallResult,
};
use super::registry::{InvocationError, LocalServiceLookupResult, LocalServiceRegistry};
use super::reliable::ReliableStreamRegistry;
use crate::channel::NetworkRequestHandler;
use crate::protocol::{MessageType, NetworkRequest, NetworkResponse, ResultCode};
use crate::routing::MessageRouter;
use crate::{JsonCodec, MessageCodec, NodeId};

struct LookupCache {
    generation: u64,
    entries: HashMap<String, Arc<LocalServiceLookupResult>>,
}

/// Resolves incoming service calls to local implementations and invokes them.
pub struct ServiceCallDispatcher {
    local_node_id: NodeId,
    registry: Arc<LocalServiceRegistry>,
    cache: Mutex<LookupCache>,
    reliable_streams: ReliableStreamRegistry,
}

impl ServiceCallDispatcher {
    /// Create a dispatcher over `registry`.
    pub fn new(local_node_id: NodeId, registry: Arc<LocalServiceRegistry>) -> Self {
        Self {
            local_node_id,
            registry,
            cache: Mutex::new(LookupCache {
                generation: u64::MAX,
                entries: HashMap::new(),
            }),
            reliable_streams: ReliableStreamRegistry::default(),
        }
    }

    /// Forget reliable streams nobody called for `idle_timeout`.
    pub fn with_reliable_stream_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.reliable_streams = ReliableStreamRegistry::new(idle_timeout);
        self
    }

    /// The registry calls are resolved against.
    pub fn registry(&self) -> &Arc<LocalServiceRegistry> {
        &self.registry
    }

    /// Resolve a service name, caching the result until the registry changes.
    pub fn resolve(&self, service_name: &str) -> Arc<LocalServiceLookupResult> {
        let generation = self.registry.generation();
        let mut cache = self.cache.lock();
        if cache.generation != generation {
            cache.entries.clear();
            cache.generation = generation;
        }
        cache
            .entries
            .entry(service_name.to_string())
            .or_insert_with(|| Arc::new(self.registry.lookup(service_name)))
            .clone()
    }

    /// Invoke a call addressed to the local node.
    ///
    /// Business exceptions are part of the returned [`ServiceCallResult`].
    ///
    /// # Errors
    ///
    /// - `ServiceNotFound` if no service is registered under the name
    /// - `MethodNotPermitted` if the method is not whitelisted
    /// - `InternalError` if the invocation itself failed
    /// - `OutcomeUnknown` for reliable calls whose stream state is missing
    pub async fn dispatch_to_local_service(
        &self,
        request: ServiceCallRequest,
    ) -> ServiceCallEnvelope {
        match request.reliable_stream.clone() {
            Some(tag) => {
                self.reliable_streams
                    .execute(&tag, &request.request_id, || self.invoke_local(&request))
                    .await
            }
            None => self.invoke_local(&request).await,
        }
    }

    /// Drop all reliable stream state.
    pub fn reset_reliable_streams(&self) {
        self.reliable_streams.clear();
    }

    async fn invoke_local(&self, request: &ServiceCallRequest) -> ServiceCallEnvelope {
        let lookup = self.resolve(&request.service_name);
        let Some(implementation) = lookup.implementation() else {
            return Err(RemoteOperationError::new(
                RemoteErrorKind::ServiceNotFound,
                format!("no service {} on node {}", request.service_name, self.local_node_id),
            ));
        };
        if !lookup.is_valid_method_request(&request.method_name) {
            return Err(RemoteOperationError::new(
                RemoteErrorKind::MethodNotPermitted,
                format!(
                    "method {} of service {} is not remotely callable",
                    request.method_name, request.service_name
                ),
            ));
        }

        match implementation.invoke(&request.method_name, &request.parameters).await {
            Ok(value) => Ok(ServiceCallResult {
                request_id: request.request_id.clone(),
                outcome: Ok(value),
            }),
            Err(InvocationError::Service(exception)) => Ok(ServiceCallResult {
                request_id: request.request_id.clone(),
                outcome: Err(exception),
            }),
            Err(InvocationError::Internal { message }) => {
                tracing::error!(
                    service = %request.service_name,
                    method = %request.method_name,
                    caller = %request.caller,
                    %message,
                    "internal error while dispatching service call"
                );
                Err(RemoteOperationError::new(RemoteErrorKind::InternalError, message))
            }
        }
    }
}

/// Handles [`MessageType::ServiceCall`] requests.
///
/// Calls for the local node are dispatched; calls for other nodes are
/// forwarded when a router is present (relay nodes) and rejected otherwise.
pub(crate) struct ServiceCallRequestHandler {
    dispatcher: Arc<ServiceCallDispatcher>,
    forwarder: Option<Arc<MessageRouter>>,
    codec: JsonCodec,
}

impl ServiceCallRequestHandler {
    pub(crate) fn new(
        dispatcher: Arc<ServiceCallDispatcher>,
        forwarder: Option<Arc<MessageRouter>>,
    ) -> Self {
        Self {
            dispatcher,
            forwarder,
            codec: JsonCodec,
        }
    }

    fn respond(&self, request: &NetworkRequest, envelope: &ServiceCallEnvelope) -> NetworkResponse {
        match self.codec.encode(envelope) {
            Ok(payload) => NetworkResponse::success(request, payload),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode service call response");
                let message = e.to_string();
                NetworkResponse::failure(request, ResultCode::ExceptionAtDestination, &message)
            }
        }
    }
}

#[async_trait]
impl NetworkRequestHandler for ServiceCallRequestHandler {
    async fn handle_request(&self, request: NetworkRequest) -> NetworkResponse {
        let call: ServiceCallRequest = match self.codec.decode(&request.payload) {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!(sender = %request.sender, error = %e, "undecodable service call");
                return NetworkResponse::failure(
                    &request,
                    ResultCode::ExceptionAtDestination,
                    &e.to_string(),
                );
            }
        };

        if call.target == self.dispatcher.local_node_id {
            let envelope = self.dispatcher.dispatch_to_local_service(call).await;
            return self.respond(&request, &envelope);
        }

        let Some(router) = &self.forwarder else {
            let envelope: ServiceCallEnvelope =
                Err(RemoteOperationError::communication_failed(format!(
                    "node {} does not forward calls to {}",
                    self.dispatcher.local_node_id, call.target
                )));
            return self.respond(&request, &envelope);
        };

        tracing::debug!(to = %call.target, service = %call.service_name, "forwarding service call");
        match router
            .send_to_node(&call.target, MessageType::ServiceCall, request.payload.clone())
            .await
        {
            Ok(payload) => NetworkResponse::success(&request, payload),
            Err(e) => {
                let code = if e.may_have_been_delivered() {
                    ResultCode::ForwardingInterrupted
                } else {
                    ResultCode::TargetNodeUnreachable
                };
                tracing::debug!(to = %call.target, ?code, error = %e, "forwarding failed");
                NetworkResponse::failure(&request, code, &e.to_string())
            }
        }
    }
}
