//! MessageChannelService: owns every channel of the local node.
//!
//! Responsibilities:
//! - connect to contact points through the matching transport provider
//! - track outgoing and remote-initiated channels
//! - answer incoming requests through the [`RequestHandlerMap`]
//! - inform lifecycle listeners when channels appear or go away

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{
    ChannelEndpointHandler, MessageChannel, MessageChannelLifecycleListener, NetworkRequestHandler,
    RequestHandlerMap,
};
use crate::error::{MessagingError, MessagingResult};
use crate::protocol::{MessageType, NetworkRequest, NetworkResponse, ResultCode};
use crate::transport::{TransportProvider, TransportRegistry};
use crate::{ContactPoint, NodeId};

#[derive(Default)]
struct ChannelTable {
    outgoing: HashMap<String, Arc<dyn MessageChannel>>,
    remote_initiated: HashMap<String, Arc<dyn MessageChannel>>,
}

impl ChannelTable {
    fn remove(&mut self, channel_id: &str) -> Option<Arc<dyn MessageChannel>> {
        self.outgoing
            .remove(channel_id)
            .or_else(|| self.remote_initiated.remove(channel_id))
    }
}

/// Central registry of the local node's message channels.
pub struct MessageChannelService {
    local_node_id: NodeId,
    transports: Arc<TransportRegistry>,
    handlers: RwLock<RequestHandlerMap>,
    channels: RwLock<ChannelTable>,
    listeners: RwLock<Vec<Arc<dyn MessageChannelLifecycleListener>>>,
    servers: Mutex<Vec<(Arc<dyn TransportProvider>, ContactPoint)>>,
    /// Where each connected node was reached, for reconnecting after failures.
    known_contact_points: Mutex<HashMap<NodeId, (ContactPoint, bool)>>,
    request_timeout: Duration,
    shut_down: AtomicBool,
}

impl MessageChannelService {
    /// Create the service for `local_node_id`.
    pub fn new(
        local_node_id: NodeId,
        transports: Arc<TransportRegistry>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_node_id,
            transports,
            handlers: RwLock::new(RequestHandlerMap::new()),
            channels: RwLock::new(ChannelTable::default()),
            listeners: RwLock::new(Vec::new()),
            servers: Mutex::new(Vec::new()),
            known_contact_points: Mutex::new(HashMap::new()),
            request_timeout,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Id of the local node.
    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    /// The transport registry used for connecting and serving.
    pub fn transports(&self) -> &Arc<TransportRegistry> {
        &self.transports
    }

    /// Default timeout for requests sent through [`send_request`](Self::send_request).
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Register the handler for one message type.
    pub fn register_request_handler(
        &self,
        message_type: MessageType,
        handler: Arc<dyn NetworkRequestHandler>,
    ) {
        self.handlers.write().insert(message_type, handler);
    }

    /// Add a channel lifecycle listener.
    pub fn add_lifecycle_listener(&self, listener: Arc<dyn MessageChannelLifecycleListener>) {
        self.listeners.write().push(listener);
    }

    /// Connect to the node at `contact_point`.
    ///
    /// # Errors
    ///
    /// - `UnknownTransport` if no provider matches the transport id
    /// - `HandshakeFailed` if the contact point leads back to the local node
    /// - any connection error from the provider
    pub async fn connect(
        self: &Arc<Self>,
        contact_point: &ContactPoint,
        allow_duplex: bool,
    ) -> MessagingResult<Arc<dyn MessageChannel>> {
        self.ensure_running()?;
        let provider = self.transports.get(contact_point.transport_id()).ok_or_else(|| {
            MessagingError::UnknownTransport {
                transport_id: contact_point.transport_id().to_string(),
            }
        })?;

        let handler: Arc<dyn ChannelEndpointHandler> = self.clone();
        let channel = provider.connect(contact_point, handler, allow_duplex).await?;
        if channel.remote_node_id() == &self.local_node_id {
            channel.close();
            return Err(MessagingError::HandshakeFailed {
                message: format!("{} leads back to the local node", contact_point),
            });
        }

        tracing::debug!(
            channel_id = channel.channel_id(),
            remote = %channel.remote_node_id(),
            %contact_point,
            "outgoing channel established"
        );
        self.channels
            .write()
            .outgoing
            .insert(channel.channel_id().to_string(), channel.clone());
        self.known_contact_points.lock().insert(
            channel.remote_node_id().clone(),
            (contact_point.clone(), allow_duplex),
        );
        self.notify_established(&channel);
        Ok(channel)
    }

    /// Connect again to a node reached through [`connect`](Self::connect)
    /// before. Returns `Ok(None)` when no contact point is known.
    ///
    /// The node behind the contact point must still be `node`; a restarted
    /// instance with a new session is closed again and reported as a
    /// handshake failure.
    pub async fn reconnect(
        self: &Arc<Self>,
        node: &NodeId,
    ) -> MessagingResult<Option<Arc<dyn MessageChannel>>> {
        let known = self.known_contact_points.lock().get(node).cloned();
        let Some((contact_point, allow_duplex)) = known else {
            return Ok(None);
        };
        tracing::debug!(%node, %contact_point, "reconnecting");
        let channel = self.connect(&contact_point, allow_duplex).await?;
        if channel.remote_node_id() != node {
            self.close_outgoing_channel(channel.channel_id());
            return Err(MessagingError::HandshakeFailed {
                message: format!("{} is now served by {}", contact_point, channel.remote_node_id()),
            });
        }
        Ok(Some(channel))
    }

    /// Start accepting connections at `contact_point`.
    pub async fn start_server(
        self: &Arc<Self>,
        contact_point: &ContactPoint,
    ) -> MessagingResult<ContactPoint> {
        self.ensure_running()?;
        let provider = self.transports.get(contact_point.transport_id()).ok_or_else(|| {
            MessagingError::UnknownTransport {
                transport_id: contact_point.transport_id().to_string(),
            }
        })?;
        let handler: Arc<dyn ChannelEndpointHandler> = self.clone();
        let bound = provider.start_server(contact_point, handler).await?;
        self.servers.lock().push((provider, bound.clone()));
        Ok(bound)
    }

    /// All open channels created by the local node.
    pub fn get_all_outgoing_channels(&self) -> Vec<Arc<dyn MessageChannel>> {
        self.channels
            .read()
            .outgoing
            .values()
            .filter(|c| c.is_open())
            .cloned()
            .collect()
    }

    /// All open channels, outgoing and remote-initiated.
    pub fn get_all_channels(&self) -> Vec<Arc<dyn MessageChannel>> {
        let table = self.channels.read();
        table
            .outgoing
            .values()
            .chain(table.remote_initiated.values())
            .filter(|c| c.is_open())
            .cloned()
            .collect()
    }

    /// An open channel to `node`, preferring locally created ones.
    pub fn channel_to(&self, node: &NodeId) -> Option<Arc<dyn MessageChannel>> {
        let table = self.channels.read();
        table
            .outgoing
            .values()
            .chain(table.remote_initiated.values())
            .find(|c| c.is_open() && c.remote_node_id() == node)
            .cloned()
    }

    /// Nodes with at least one open channel from the local node.
    pub fn connected_nodes(&self) -> BTreeSet<NodeId> {
        self.get_all_channels()
            .iter()
            .map(|c| c.remote_node_id().clone())
            .collect()
    }

    /// Close one outgoing channel. Returns whether a channel was closed.
    pub fn close_outgoing_channel(&self, channel_id: &str) -> bool {
        let removed = self.channels.write().outgoing.remove(channel_id);
        match removed {
            Some(channel) => {
                self.known_contact_points.lock().remove(channel.remote_node_id());
                channel.close();
                self.notify_closed(&channel);
                true
            }
            None => false,
        }
    }

    /// Close every channel.
    pub fn close_all(&self) {
        let drained: Vec<Arc<dyn MessageChannel>> = {
            let mut table = self.channels.write();
            let outgoing = std::mem::take(&mut table.outgoing);
            let remote = std::mem::take(&mut table.remote_initiated);
            outgoing.into_values().chain(remote.into_values()).collect()
        };
        for channel in drained {
            channel.close();
            self.notify_closed(&channel);
        }
    }

    /// Stop servers, refuse further work and close every channel.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(node = %self.local_node_id, "shutting down message channel service");
        let servers = std::mem::take(&mut *self.servers.lock());
        for (provider, contact_point) in servers {
            provider.stop_server(&contact_point).await;
        }
        self.close_all();
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Send a request over `channel` with the default timeout.
    ///
    /// A channel that is no longer open after a failure is removed and
    /// reported to lifecycle listeners.
    pub async fn send_request(
        &self,
        channel: &Arc<dyn MessageChannel>,
        request: NetworkRequest,
    ) -> MessagingResult<NetworkResponse> {
        self.ensure_running()?;
        let result = channel.send_request(request, self.request_timeout).await;
        if let Err(e) = &result {
            tracing::debug!(channel_id = channel.channel_id(), error = %e, "request failed");
            if !channel.is_open() {
                self.handle_channel_failure(channel);
            }
        }
        result
    }

    /// Close a broken channel and notify listeners once.
    pub fn handle_channel_failure(&self, channel: &Arc<dyn MessageChannel>) {
        let removed = self.channels.write().remove(channel.channel_id());
        channel.close();
        if let Some(channel) = removed {
            tracing::debug!(channel_id = channel.channel_id(), "channel failed and was removed");
            self.notify_closed(&channel);
        }
    }

    fn ensure_running(&self) -> MessagingResult<()> {
        if self.is_shut_down() {
            return Err(MessagingError::ShutDown);
        }
        Ok(())
    }

    fn notify_established(&self, channel: &Arc<dyn MessageChannel>) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_channel_established(channel);
        }
    }

    fn notify_closed(&self, channel: &Arc<dyn MessageChannel>) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_channel_closed(channel);
        }
    }
}

#[async_trait]
impl ChannelEndpointHandler for MessageChannelService {
    fn local_node_id(&self) -> NodeId {
        self.local_node_id.clone()
    }

    async fn on_request(&self, request: NetworkRequest) -> NetworkResponse {
        if self.is_shut_down() {
            return NetworkResponse::failure(
                &request,
                ResultCode::ExceptionAtDestination,
                "node is shutting down",
            );
        }
        let handler = self.handlers.read().get(request.message_type);
        match handler {
            Some(handler) => handler.handle_request(request).await,
            None => {
                tracing::warn!(
                    message_type = ?request.message_type,
                    sender = %request.sender,
                    "no handler for request"
                );
                NetworkResponse::failure(
                    &request,
                    ResultCode::NoMatchingHandler,
                    "no handler registered for this message type",
                )
            }
        }
    }

    fn on_remote_initiated_channel(&self, channel: Arc<dyn MessageChannel>) {
        if self.is_shut_down() {
            channel.close();
            return;
        }
        tracing::debug!(
            channel_id = channel.channel_id(),
            remote = %channel.remote_node_id(),
            "remote-initiated channel registered"
        );
        self.channels
            .write()
            .remote_initiated
            .insert(channel.channel_id().to_string(), channel.clone());
        self.notify_established(&channel);
    }

    fn on_remote_channel_closed(&self, channel_id: &str) {
        let removed = self.channels.write().remove(channel_id);
        if let Some(channel) = removed {
            tracing::debug!(channel_id, "channel closed by remote side");
            self.notify_closed(&channel);
        }
    }
}
