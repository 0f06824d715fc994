//! Pluggable transport providers.
//!
//! A [`TransportProvider`] opens and accepts physical connections for one
//! transport id and turns them into [`MessageChannel`]s. Providers are
//! collected in an explicit [`TransportRegistry`] populated at startup.

mod tcp;
mod virtual_net;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::channel::{ChannelEndpointHandler, MessageChannel};
use crate::error::MessagingResult;
use crate::ContactPoint;

pub use tcp::{TCP_TRANSPORT_ID, TcpTransportProvider};
pub use virtual_net::{VIRTUAL_TRANSPORT_ID, VirtualNetwork, VirtualTransportProvider};

/// Strategy for one kind of carrier.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// The transport id matched against [`ContactPoint::transport_id`].
    fn transport_id(&self) -> &str;

    /// Whether the accepting side can push to the initiator over the same
    /// connection (duplex).
    fn supports_remote_initiated_connections(&self) -> bool;

    /// Open a channel to the node listening at `contact_point`.
    ///
    /// Fails promptly when the remote side is not reachable; no internal
    /// retries. With `allow_duplex` and a duplex-capable provider, the remote
    /// side receives a channel back to `handler`'s node.
    async fn connect(
        &self,
        contact_point: &ContactPoint,
        handler: Arc<dyn ChannelEndpointHandler>,
        allow_duplex: bool,
    ) -> MessagingResult<Arc<dyn MessageChannel>>;

    /// Accept connections at `contact_point`, returning the contact point
    /// actually bound (the port may differ when 0 was requested).
    async fn start_server(
        &self,
        contact_point: &ContactPoint,
        handler: Arc<dyn ChannelEndpointHandler>,
    ) -> MessagingResult<ContactPoint>;

    /// Stop accepting connections at `contact_point`.
    async fn stop_server(&self, contact_point: &ContactPoint);
}

/// Registry of transport providers keyed by transport id.
#[derive(Default)]
pub struct TransportRegistry {
    providers: RwLock<HashMap<String, Arc<dyn TransportProvider>>>,
}

impl TransportRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider, replacing any provider with the same transport id.
    pub fn add(&self, provider: Arc<dyn TransportProvider>) -> Option<Arc<dyn TransportProvider>> {
        let id = provider.transport_id().to_string();
        tracing::debug!(transport_id = %id, "registering transport provider");
        self.providers.write().insert(id, provider)
    }

    /// Remove the provider for a transport id.
    pub fn remove(&self, transport_id: &str) -> Option<Arc<dyn TransportProvider>> {
        self.providers.write().remove(transport_id)
    }

    /// Look up the provider for a transport id.
    pub fn get(&self, transport_id: &str) -> Option<Arc<dyn TransportProvider>> {
        self.providers.read().get(transport_id).cloned()
    }

    /// All registered transport ids, sorted.
    pub fn transport_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}
