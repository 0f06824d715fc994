//! In-process transport for tests and single-process setups.
//!
//! All nodes attached to one [`VirtualNetwork`] reach each other by
//! `host:port` without any I/O: a request is handed directly to the remote
//! node's handler on the caller's task, so behaviour is deterministic.
//! The duplex toggle selects whether the accepting node gets a channel back
//! to the initiator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::channel::{ChannelEndpointHandler, MessageChannel};
use crate::error::{MessagingError, MessagingResult};
use crate::protocol::{NetworkRequest, NetworkResponse};
use crate::transport::TransportProvider;
use crate::{ContactPoint, NodeId};

/// Transport id of the virtual transport.
pub const VIRTUAL_TRANSPORT_ID: &str = "virtual";

/// Shared in-process "network" connecting virtual transport providers.
#[derive(Default)]
pub struct VirtualNetwork {
    servers: Mutex<HashMap<String, Arc<dyn ChannelEndpointHandler>>>,
    next_channel: AtomicU64,
    responses_to_lose: AtomicU32,
}

impl VirtualNetwork {
    /// Create a new, empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` requests reach their handler, then break the
    /// channel before the response gets back.
    ///
    /// Simulates a connection drop while a request is in flight.
    pub fn lose_next_responses(&self, count: u32) {
        self.responses_to_lose.store(count, Ordering::SeqCst);
    }

    /// Number of servers currently accepting connections.
    pub fn server_count(&self) -> usize {
        self.servers.lock().len()
    }

    fn take_response_loss(&self) -> bool {
        self.responses_to_lose
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn next_channel_id(&self) -> String {
        format!("virtual-{}", self.next_channel.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Transport provider over a [`VirtualNetwork`].
pub struct VirtualTransportProvider {
    network: Arc<VirtualNetwork>,
    duplex: bool,
}

impl VirtualTransportProvider {
    /// Create a provider attached to `network`.
    pub fn new(network: Arc<VirtualNetwork>, duplex: bool) -> Self {
        Self { network, duplex }
    }
}

#[async_trait]
impl TransportProvider for VirtualTransportProvider {
    fn transport_id(&self) -> &str {
        VIRTUAL_TRANSPORT_ID
    }

    fn supports_remote_initiated_connections(&self) -> bool {
        self.duplex
    }

    async fn connect(
        &self,
        contact_point: &ContactPoint,
        handler: Arc<dyn ChannelEndpointHandler>,
        allow_duplex: bool,
    ) -> MessagingResult<Arc<dyn MessageChannel>> {
        let server = self
            .network
            .servers
            .lock()
            .get(&contact_point.socket_address())
            .cloned()
            .ok_or_else(|| MessagingError::ConnectionFailed {
                contact_point: contact_point.to_string(),
                message: "no virtual server at this address".to_string(),
            })?;

        let link = Arc::new(VirtualLink::default());
        let channel = Arc::new(VirtualMessageChannel {
            channel_id: self.network.next_channel_id(),
            remote_node_id: server.local_node_id(),
            remote_initiated: false,
            target: Arc::downgrade(&server),
            link: link.clone(),
            network: self.network.clone(),
            request_lock: tokio::sync::Mutex::new(()),
        });
        link.attach(&channel.channel_id, Arc::downgrade(&handler));

        if self.duplex && allow_duplex {
            let reverse = Arc::new(VirtualMessageChannel {
                channel_id: self.network.next_channel_id(),
                remote_node_id: handler.local_node_id(),
                remote_initiated: true,
                target: Arc::downgrade(&handler),
                link: link.clone(),
                network: self.network.clone(),
                request_lock: tokio::sync::Mutex::new(()),
            });
            link.attach(&reverse.channel_id, Arc::downgrade(&server));
            server.on_remote_initiated_channel(reverse);
        }

        tracing::debug!(
            channel_id = %channel.channel_id,
            remote = %channel.remote_node_id,
            duplex = self.duplex && allow_duplex,
            "virtual channel established"
        );
        Ok(channel)
    }

    async fn start_server(
        &self,
        contact_point: &ContactPoint,
        handler: Arc<dyn ChannelEndpointHandler>,
    ) -> MessagingResult<ContactPoint> {
        let mut servers = self.network.servers.lock();
        let key = contact_point.socket_address();
        if servers.contains_key(&key) {
            return Err(MessagingError::ServerStartFailed {
                contact_point: contact_point.to_string(),
                message: "address already in use".to_string(),
            });
        }
        servers.insert(key, handler);
        Ok(contact_point.clone())
    }

    async fn stop_server(&self, contact_point: &ContactPoint) {
        self.network
            .servers
            .lock()
            .remove(&contact_point.socket_address());
    }
}

/// Shared state of the channels created by one `connect` call.
#[derive(Default)]
struct VirtualLink {
    open: AtomicBool,
    closed: AtomicBool,
    endpoints: Mutex<Vec<(String, Weak<dyn ChannelEndpointHandler>)>>,
}

impl VirtualLink {
    fn attach(&self, channel_id: &str, owner: Weak<dyn ChannelEndpointHandler>) {
        self.open.store(true, Ordering::SeqCst);
        self.endpoints.lock().push((channel_id.to_string(), owner));
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    /// Close the link, notifying the owners of all other channels on it.
    fn close_from(&self, closing_channel_id: &str) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let endpoints = self.endpoints.lock().clone();
        for (channel_id, owner) in endpoints {
            if channel_id == closing_channel_id {
                continue;
            }
            if let Some(owner) = owner.upgrade() {
                owner.on_remote_channel_closed(&channel_id);
            }
        }
        true
    }
}

struct VirtualMessageChannel {
    channel_id: String,
    remote_node_id: NodeId,
    remote_initiated: bool,
    target: Weak<dyn ChannelEndpointHandler>,
    link: Arc<VirtualLink>,
    network: Arc<VirtualNetwork>,
    request_lock: tokio::sync::Mutex<()>,
}

#[async_trait]
impl MessageChannel for VirtualMessageChannel {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn remote_node_id(&self) -> &NodeId {
        &self.remote_node_id
    }

    fn is_remote_initiated(&self) -> bool {
        self.remote_initiated
    }

    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    async fn send_request(
        &self,
        request: NetworkRequest,
        timeout: Duration,
    ) -> MessagingResult<NetworkResponse> {
        let _exchange = self.request_lock.lock().await;
        let closed = || MessagingError::ChannelClosed {
            channel_id: self.channel_id.clone(),
        };
        if !self.link.is_open() {
            return Err(closed());
        }
        let Some(target) = self.target.upgrade() else {
            self.close();
            return Err(closed());
        };

        let response = tokio::time::timeout(timeout, target.on_request(request))
            .await
            .map_err(|_| MessagingError::Timeout { timeout })?;

        if self.network.take_response_loss() {
            tracing::debug!(channel_id = %self.channel_id, "dropping response and breaking link");
            self.close();
            return Err(MessagingError::RequestInterrupted {
                channel_id: self.channel_id.clone(),
                message: "link dropped before the response arrived".to_string(),
            });
        }
        Ok(response)
    }

    fn close(&self) -> bool {
        self.link.close_from(&self.channel_id)
    }
}
