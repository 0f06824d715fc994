//! MessageRouter: delivers requests to any reachable node.
//!
//! Resolution order for a target:
//! 1. an open channel to the target
//! 2. a channel to the next hop from the topology
//! 3. a fresh connection to the target's last known contact point

use std::sync::Arc;

use crate::channel::{MessageChannel, MessageChannelService};
use crate::error::{MessagingError, MessagingResult};
use crate::protocol::{MessageType, NetworkRequest, NetworkResponse, ResultCode};
use crate::topology::TopologyService;
use crate::NodeId;

/// Sends requests to nodes, directly or through relays.
pub struct MessageRouter {
    channels: Arc<MessageChannelService>,
    topology: Arc<TopologyService>,
}

impl MessageRouter {
    /// Create a router.
    pub fn new(channels: Arc<MessageChannelService>, topology: Arc<TopologyService>) -> Self {
        Self { channels, topology }
    }

    /// Send `payload` to `target` and return the response payload.
    ///
    /// # Errors
    ///
    /// - `NoRoute` if no channel or route leads to `target`
    /// - `RemoteFailure` if the receiving node answered with a failure code
    /// - any channel error; a broken channel is closed and reported to
    ///   channel lifecycle listeners
    pub async fn send_to_node(
        &self,
        target: &NodeId,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> MessagingResult<Vec<u8>> {
        let channel = self.route(target).await?;
        tracing::trace!(
            to = %target,
            via = %channel.remote_node_id(),
            channel_id = channel.channel_id(),
            ?message_type,
            "sending routed request"
        );
        let request =
            NetworkRequest::new(message_type, self.channels.local_node_id().clone(), payload);
        let response = self.channels.send_request(&channel, request).await?;
        response_payload(response, channel.channel_id())
    }

    async fn route(&self, target: &NodeId) -> MessagingResult<Arc<dyn MessageChannel>> {
        if let Some(channel) = self.channels.channel_to(target) {
            return Ok(channel);
        }
        if let Some(channel) = self
            .topology
            .next_hop(target)
            .and_then(|hop| self.channels.channel_to(&hop))
        {
            return Ok(channel);
        }
        match self.channels.reconnect(target).await? {
            Some(channel) => Ok(channel),
            None => Err(MessagingError::NoRoute {
                target: target.clone(),
            }),
        }
    }
}

/// Unwrap a response, keeping "may have been delivered" visible when a
/// relay lost the downstream answer.
fn response_payload(response: NetworkResponse, channel_id: &str) -> MessagingResult<Vec<u8>> {
    match response.result_code {
        ResultCode::Success => Ok(response.payload),
        ResultCode::ForwardingInterrupted => Err(MessagingError::RequestInterrupted {
            channel_id: channel_id.to_string(),
            message: format!("forwarded request interrupted: {}", response.error_message()),
        }),
        code => Err(MessagingError::RemoteFailure {
            code,
            message: response.error_message(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommunicationNode, NodeConfig};

    #[tokio::test]
    async fn test_unknown_node_has_no_route() {
        let node = CommunicationNode::builder(NodeConfig::local_network())
            .start()
            .expect("start");
        let err = node
            .router()
            .send_to_node(&NodeId::generate(), MessageType::ServiceCall, Vec::new())
            .await
            .expect_err("no route");
        assert!(matches!(err, MessagingError::NoRoute { .. }));
        assert!(!err.may_have_been_delivered());
    }

    #[test]
    fn test_relay_failures_keep_delivery_uncertainty() {
        let request = NetworkRequest::new(MessageType::ServiceCall, NodeId::generate(), Vec::new());

        let interrupted =
            NetworkResponse::failure(&request, ResultCode::ForwardingInterrupted, "lost");
        let err = response_payload(interrupted, "c1").expect_err("interrupted");
        assert!(matches!(
            err,
            MessagingError::RequestInterrupted { ref channel_id, .. } if channel_id == "c1"
        ));
        assert!(err.may_have_been_delivered());

        let unreachable =
            NetworkResponse::failure(&request, ResultCode::TargetNodeUnreachable, "no route");
        let err = response_payload(unreachable, "c1").expect_err("unreachable");
        assert!(!err.may_have_been_delivered());

        let ok = NetworkResponse::success(&request, b"x".to_vec());
        assert_eq!(response_payload(ok, "c1").expect("payload"), b"x");
    }
}
