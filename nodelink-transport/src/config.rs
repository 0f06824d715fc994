//! Configuration of a communication node.

use std::time::Duration;

use crate::NodeId;
use crate::rpc::{DEFAULT_STREAM_IDLE_TIMEOUT, ReliableStreamPolicy};

/// Settings for one [`CommunicationNode`](crate::CommunicationNode).
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Identity of the node; a fresh one per process by default.
    pub node_id: NodeId,

    /// Whether this node forwards property deltas and service calls for
    /// its neighbours.
    pub is_relay: bool,

    /// Time to wait for the response to one request on a channel.
    pub request_timeout: Duration,

    /// Timeout for establishing TCP connections.
    pub connect_timeout: Duration,

    /// Attempts per reliable stream call, including the first one.
    pub reliable_max_attempts: u32,

    /// Delay before the first reliable stream retry.
    pub reliable_initial_backoff: Duration,

    /// Upper bound for reliable stream retry delays.
    pub reliable_max_backoff: Duration,

    /// Time after which the callee forgets a reliable stream nobody calls.
    pub reliable_stream_idle_timeout: Duration,

    /// Property deltas combined into one broadcast at most.
    pub max_batch_size: usize,

    /// Longest time a property delta waits for its batch to fill.
    pub max_batch_latency: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::generate(),
            is_relay: false,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            reliable_max_attempts: 5,
            reliable_initial_backoff: Duration::from_millis(100),
            reliable_max_backoff: Duration::from_secs(2),
            reliable_stream_idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
            max_batch_size: 25,
            max_batch_latency: Duration::from_millis(150),
        }
    }
}

impl NodeConfig {
    /// Short timeouts for nodes on one machine or LAN.
    pub fn local_network() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(1),
            reliable_initial_backoff: Duration::from_millis(20),
            reliable_max_backoff: Duration::from_millis(500),
            max_batch_latency: Duration::from_millis(20),
            ..Self::default()
        }
    }

    /// Generous timeouts for links with high latency.
    pub fn wan_network() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
            reliable_max_attempts: 8,
            reliable_initial_backoff: Duration::from_millis(500),
            reliable_max_backoff: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// Use a specific node id.
    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    /// Make the node a relay.
    pub fn with_relay(mut self, is_relay: bool) -> Self {
        self.is_relay = is_relay;
        self
    }

    /// Set the request and connect timeouts.
    pub fn with_timeouts(mut self, request_timeout: Duration, connect_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self.connect_timeout = connect_timeout;
        self
    }

    /// Set the reliable stream retry policy.
    pub fn with_reliable_retries(
        mut self,
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        self.reliable_max_attempts = max_attempts;
        self.reliable_initial_backoff = initial_backoff;
        self.reliable_max_backoff = max_backoff;
        self
    }

    /// Set how long the callee keeps state of idle reliable streams.
    pub fn with_reliable_stream_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.reliable_stream_idle_timeout = idle_timeout;
        self
    }

    /// Set property delta batching.
    pub fn with_property_batching(
        mut self,
        max_batch_size: usize,
        max_batch_latency: Duration,
    ) -> Self {
        self.max_batch_size = max_batch_size;
        self.max_batch_latency = max_batch_latency;
        self
    }

    /// The reliable stream policy these settings describe.
    pub fn reliable_stream_policy(&self) -> ReliableStreamPolicy {
        ReliableStreamPolicy {
            max_attempts: self.reliable_max_attempts.max(1),
            initial_backoff: self.reliable_initial_backoff,
            max_backoff: self.reliable_max_backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_keep_batching_defaults() {
        let local = NodeConfig::local_network();
        assert_eq!(local.max_batch_size, 25);
        assert!(local.request_timeout < NodeConfig::wan_network().request_timeout);
        assert_ne!(local.node_id, NodeConfig::local_network().node_id);
    }

    #[test]
    fn test_reliable_policy_has_at_least_one_attempt() {
        let config = NodeConfig::default().with_reliable_retries(
            0,
            Duration::from_millis(1),
            Duration::from_millis(2),
        );
        assert_eq!(config.reliable_stream_policy().max_attempts, 1);
    }
}
