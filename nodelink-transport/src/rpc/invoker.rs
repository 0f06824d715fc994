//! The node's own [`ServiceCallInvoker`].

use std::sync::Arc;

use async_trait::async_trait;

use super::call::{ServiceCallEnvelope, ServiceCallRequest};
use super::dispatcher::ServiceCallDispatcher;
use super::proxy::ServiceCallInvoker;
use crate::error::MessagingResult;
use crate::protocol::MessageType;
use crate::routing::MessageRouter;
use crate::{JsonCodec, MessageCodec, NodeId};

/// Dispatches calls to the local node directly and sends all others
/// through the [`MessageRouter`].
pub(crate) struct NodeServiceCallInvoker {
    local_node_id: NodeId,
    dispatcher: Arc<ServiceCallDispatcher>,
    router: Arc<MessageRouter>,
    codec: JsonCodec,
}

impl NodeServiceCallInvoker {
    pub(crate) fn new(
        local_node_id: NodeId,
        dispatcher: Arc<ServiceCallDispatcher>,
        router: Arc<MessageRouter>,
    ) -> Self {
        Self {
            local_node_id,
            dispatcher,
            router,
            codec: JsonCodec,
        }
    }
}

#[async_trait]
impl ServiceCallInvoker for NodeServiceCallInvoker {
    fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    async fn invoke(&self, request: ServiceCallRequest) -> MessagingResult<ServiceCallEnvelope> {
        if request.target == self.local_node_id {
            return Ok(self.dispatcher.dispatch_to_local_service(request).await);
        }
        let target = request.target.clone();
        let payload = self.codec.encode(&request)?;
        let response = self
            .router
            .send_to_node(&target, MessageType::ServiceCall, payload)
            .await?;
        Ok(self.codec.decode(&response)?)
    }
}
