//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use nodelink_transport::{
    CallError, CommunicationNode, ContactPoint, NodeConfig, ServiceException, VirtualNetwork,
    VirtualTransportProvider, remote_service,
};

/// Install a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Contact point on the virtual network.
pub fn virtual_cp(host: &str) -> ContactPoint {
    ContactPoint::new("virtual", host, 1).expect("valid contact point")
}

/// Builder for a node attached to `network` with a duplex virtual transport.
pub fn virtual_node_builder(
    network: &Arc<VirtualNetwork>,
    config: NodeConfig,
) -> nodelink_transport::CommunicationNodeBuilder {
    CommunicationNode::builder(config)
        .with_transport(Arc::new(VirtualTransportProvider::new(network.clone(), true)))
}

/// Start a plain node serving at `virtual:<host>:1`.
pub async fn serving_node(
    network: &Arc<VirtualNetwork>,
    host: &str,
    config: NodeConfig,
) -> CommunicationNode {
    let node = virtual_node_builder(network, config).start().expect("start node");
    node.start_server(&virtual_cp(host)).await.expect("start server");
    node
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[remote_service(name = "EchoService")]
pub trait EchoService {
    async fn echo(&self, message: String) -> Result<String, CallError>;
    async fn reject(&self, reason: String) -> Result<u32, CallError>;
}

pub struct Echo;

#[async_trait::async_trait]
impl EchoService for Echo {
    async fn echo(&self, message: String) -> Result<String, CallError> {
        Ok(message)
    }

    async fn reject(&self, reason: String) -> Result<u32, CallError> {
        Err(ServiceException::new("IllegalStateException", reason).into())
    }
}

#[remote_service(name = "CounterService")]
pub trait CounterService {
    async fn increment(&self, by: u64) -> Result<u64, CallError>;
    async fn current(&self) -> Result<u64, CallError>;
}

/// Counts executions, so tests can tell replays from re-executions.
#[derive(Default)]
pub struct Counter {
    pub value: AtomicU64,
}

#[async_trait::async_trait]
impl CounterService for Counter {
    async fn increment(&self, by: u64) -> Result<u64, CallError> {
        Ok(self.value.fetch_add(by, Ordering::SeqCst) + by)
    }

    async fn current(&self) -> Result<u64, CallError> {
        Ok(self.value.load(Ordering::SeqCst))
    }
}
