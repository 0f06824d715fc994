//! CommunicationNode: one running node with all messaging services wired up.
//!
//! # Startup
//!
//! ```text
//! TransportRegistry ─► MessageChannelService ─┬─► NodePropertiesService ─► TopologyService
//!                                             │                                │
//!                                             │        NodePropertiesStateService
//!                                             │                                │
//!                                             └──── MessageRouter ◄────────────┘
//!                                                        │
//!               ServiceCallDispatcher ◄── ServiceCall handler (forwards if relay)
//!                        │
//!               NodeServiceCallInvoker ─► ServiceProxyFactory
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::channel::{MessageChannel, MessageChannelService};
use crate::config::NodeConfig;
use crate::error::{MessagingError, MessagingResult};
use crate::properties::{NodePropertiesService, NodePropertiesStateService};
use crate::protocol::MessageType;
use crate::routing::MessageRouter;
use crate::rpc::{
    LocalServiceRegistry, NodeServiceCallInvoker, ReliableRpcStreamHandle, ServiceCallDispatcher,
    ServiceCallRequestHandler, ServiceDispatch, ServiceProxy, ServiceProxyFactory,
};
use crate::topology::TopologyService;
use crate::transport::{TcpTransportProvider, TransportProvider, TransportRegistry};
use crate::{ContactPoint, NodeId};

/// Errors raised while assembling a node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Two providers were added for the same transport id.
    #[error("transport {transport_id} was added twice")]
    DuplicateTransport {
        /// The contested transport id.
        transport_id: String,
    },

    /// Two services were registered under the same name.
    #[error("service {service_name} was registered twice")]
    DuplicateService {
        /// The contested service name.
        service_name: String,
    },

    /// A messaging operation during startup failed.
    #[error("messaging error: {0}")]
    Messaging(#[from] MessagingError),
}

enum Whitelist {
    Methods(Vec<String>),
    AllDeclared,
}

/// Collects transports and services before a node starts.
pub struct CommunicationNodeBuilder {
    config: NodeConfig,
    transports: Vec<Arc<dyn TransportProvider>>,
    services: Vec<(Arc<dyn ServiceDispatch>, Whitelist)>,
}

impl CommunicationNodeBuilder {
    /// Add a transport provider. Without any, TCP is used.
    pub fn with_transport(mut self, provider: Arc<dyn TransportProvider>) -> Self {
        self.transports.push(provider);
        self
    }

    /// Register a service; only `allowed_methods` are remotely callable.
    pub fn register_service<I, S>(
        mut self,
        dispatch: Arc<dyn ServiceDispatch>,
        allowed_methods: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let methods = allowed_methods.into_iter().map(Into::into).collect();
        self.services.push((dispatch, Whitelist::Methods(methods)));
        self
    }

    /// Register a service with every declared method callable.
    pub fn register_service_all_declared(mut self, dispatch: Arc<dyn ServiceDispatch>) -> Self {
        self.services.push((dispatch, Whitelist::AllDeclared));
        self
    }

    /// Wire up all services. Requires a tokio runtime; servers are started
    /// separately with [`CommunicationNode::start_server`].
    ///
    /// # Errors
    ///
    /// Returns `DuplicateTransport` or `DuplicateService` for conflicting
    /// registrations.
    pub fn start(self) -> Result<CommunicationNode, NodeError> {
        let config = self.config;
        let transports = Arc::new(TransportRegistry::new());
        if self.transports.is_empty() {
            transports.add(Arc::new(TcpTransportProvider::new(config.connect_timeout)));
        }
        for provider in self.transports {
            let transport_id = provider.transport_id().to_string();
            if transports.add(provider).is_some() {
                return Err(NodeError::DuplicateTransport { transport_id });
            }
        }

        let registry = Arc::new(LocalServiceRegistry::new());
        let mut names = BTreeSet::new();
        for (dispatch, whitelist) in self.services {
            let service_name = dispatch.service_name().to_string();
            if !names.insert(service_name.clone()) {
                return Err(NodeError::DuplicateService { service_name });
            }
            match whitelist {
                Whitelist::Methods(methods) => registry.register(dispatch, methods),
                Whitelist::AllDeclared => registry.register_all_declared(dispatch),
            }
        }

        let node_id = config.node_id.clone();
        let channels =
            MessageChannelService::new(node_id.clone(), transports, config.request_timeout);
        let properties = NodePropertiesService::new(
            channels.clone(),
            config.is_relay,
            config.max_batch_size,
            config.max_batch_latency,
        );
        let topology = TopologyService::new(channels.clone(), properties.clone());
        let state = NodePropertiesStateService::new(&properties, &topology);
        let router = Arc::new(MessageRouter::new(channels.clone(), topology.clone()));

        let dispatcher = Arc::new(
            ServiceCallDispatcher::new(node_id.clone(), registry)
                .with_reliable_stream_idle_timeout(config.reliable_stream_idle_timeout),
        );
        let forwarder = config.is_relay.then(|| router.clone());
        channels.register_request_handler(
            MessageType::ServiceCall,
            Arc::new(ServiceCallRequestHandler::new(dispatcher.clone(), forwarder)),
        );
        let invoker = Arc::new(NodeServiceCallInvoker::new(
            node_id.clone(),
            dispatcher.clone(),
            router.clone(),
        ));
        let proxy_factory = ServiceProxyFactory::new(invoker, config.reliable_stream_policy());

        tracing::debug!(node = %node_id, relay = config.is_relay, "communication node started");
        Ok(CommunicationNode {
            config,
            channels,
            properties,
            topology,
            state,
            router,
            dispatcher,
            proxy_factory,
        })
    }
}

/// A started node.
pub struct CommunicationNode {
    config: NodeConfig,
    channels: Arc<MessageChannelService>,
    properties: Arc<NodePropertiesService>,
    topology: Arc<TopologyService>,
    state: Arc<NodePropertiesStateService>,
    router: Arc<MessageRouter>,
    dispatcher: Arc<ServiceCallDispatcher>,
    proxy_factory: ServiceProxyFactory,
}

impl CommunicationNode {
    /// Start assembling a node.
    pub fn builder(config: NodeConfig) -> CommunicationNodeBuilder {
        CommunicationNodeBuilder {
            config,
            transports: Vec::new(),
            services: Vec::new(),
        }
    }

    /// Id of this node.
    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    /// The configuration the node was started with.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Connect to another node, allowing it to push back over the same
    /// connection when the transport is duplex.
    pub async fn connect(
        &self,
        contact_point: &ContactPoint,
    ) -> MessagingResult<Arc<dyn MessageChannel>> {
        self.channels.connect(contact_point, true).await
    }

    /// Accept connections at `contact_point`; returns the bound address.
    pub async fn start_server(
        &self,
        contact_point: &ContactPoint,
    ) -> MessagingResult<ContactPoint> {
        self.channels.start_server(contact_point).await
    }

    /// The channel service.
    pub fn channels(&self) -> &Arc<MessageChannelService> {
        &self.channels
    }

    /// The property directory.
    pub fn properties(&self) -> &Arc<NodePropertiesService> {
        &self.properties
    }

    /// Publish or change one property of this node; `None` removes it.
    pub fn publish_property(&self, key: impl Into<String>, value: Option<String>) {
        self.properties.add_or_update_local_property(key, value);
    }

    /// The reachability-filtered property view.
    pub fn state(&self) -> &Arc<NodePropertiesStateService> {
        &self.state
    }

    /// The topology service.
    pub fn topology(&self) -> &Arc<TopologyService> {
        &self.topology
    }

    /// All currently reachable nodes, including this one.
    pub fn reachable_nodes(&self) -> BTreeSet<NodeId> {
        self.topology.reachable_nodes()
    }

    /// The router used for calls to other nodes.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Services callable on this node. Changes take effect immediately.
    pub fn service_registry(&self) -> &Arc<LocalServiceRegistry> {
        self.dispatcher.registry()
    }

    /// The proxy factory.
    pub fn proxy_factory(&self) -> &ServiceProxyFactory {
        &self.proxy_factory
    }

    /// Shorthand for [`ServiceProxyFactory::create_service_proxy`] without a
    /// reliable stream.
    pub fn create_service_proxy<P: ServiceProxy>(&self, node_id: &NodeId) -> P {
        self.proxy_factory.create_service_proxy(node_id, None)
    }

    /// Open a reliable RPC stream to `target`.
    pub fn create_reliable_rpc_stream(&self, target: &NodeId) -> Arc<ReliableRpcStreamHandle> {
        self.proxy_factory.create_reliable_rpc_stream(target)
    }

    /// Stop servers, close all channels and forget reliable stream state.
    pub async fn shutdown(&self) {
        tracing::debug!(node = %self.node_id(), "shutting down communication node");
        self.channels.shutdown().await;
        self.dispatcher.reset_reliable_streams();
    }
}
