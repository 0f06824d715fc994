//! # nodelink transport layer
//!
//! Messaging substrate connecting nodelink nodes.
//!
//! This crate provides:
//! - **Transports and channels**: pluggable carriers (TCP, in-process virtual
//!   network) producing request/response message channels
//! - **Node properties**: an eventually consistent key/value directory
//!   synchronized between nodes, with relay forwarding
//! - **Topology and routing**: reachability from published links, and
//!   delivery to nodes behind relays
//! - **Service calls**: typed proxies, whitelisted dispatch and reliable RPC
//!   streams with at-most-once execution
//! - **Uplink sessions**: priority-multiplexed logical channels over one
//!   stream with fail-fast bounded queues
//! - **Node runtime**: [`CommunicationNode`] wiring everything together

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

extern crate self as nodelink_transport;

// Re-export core types for convenience
pub use nodelink_core::{
    CodecError, ContactPoint, ContactPointParseError, JsonCodec, MessageCodec, NodeId,
    NodeIdParseError,
};

// Re-export the proc-macro and the runtime it expands to
pub use nodelink_transport_derive::remote_service;
#[doc(hidden)]
pub use async_trait;

// =============================================================================
// Modules
// =============================================================================

mod callbacks;

/// Message channels and the channel service.
pub mod channel;

/// Node configuration.
pub mod config;

/// Error types for messaging operations.
pub mod error;

/// Node runtime.
pub mod node;

/// Node property directory.
pub mod properties;

/// Request/response envelopes.
pub mod protocol;

/// Delivery to direct and relayed nodes.
pub mod routing;

/// Service calls, proxies and reliable RPC streams.
pub mod rpc;

/// Network graph and reachability.
pub mod topology;

/// Transport providers.
pub mod transport;

/// Prioritized uplink sessions.
pub mod uplink;

/// Frame format with CRC32C checksums.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

// Error exports
pub use error::{MessagingError, MessagingResult};

// Channel exports
pub use channel::{
    ChannelEndpointHandler, MessageChannel, MessageChannelLifecycleListener, MessageChannelService,
    NetworkRequestHandler, RequestHandlerMap,
};

// Protocol exports
pub use protocol::{MessageType, NetworkRequest, NetworkResponse, ResultCode};

// Transport exports
pub use transport::{
    TCP_TRANSPORT_ID, TcpTransportProvider, TransportProvider, TransportRegistry,
    VIRTUAL_TRANSPORT_ID, VirtualNetwork, VirtualTransportProvider,
};

// Wire format exports
pub use wire::{
    FrameKind, HEADER_SIZE, MAX_PAYLOAD_SIZE, WireError, deserialize_frame, serialize_frame,
    try_deserialize_frame,
};

// Property exports
pub use properties::{
    NodePropertiesChangeListener, NodePropertiesRegistry, NodePropertiesService,
    NodePropertiesStateService, NodeProperty, NodeValueMaps, RawNodePropertiesChangeListener,
};

// Topology and routing exports
pub use routing::MessageRouter;
pub use topology::{NetworkGraph, ReachableNodesListener, TopologyService};

// RPC exports
pub use rpc::{
    CallError, InvocationError, LocalServiceLookupResult, LocalServiceRegistry, ReliableCallTag,
    ReliableRpcStreamHandle, ReliableStreamPolicy, RemoteErrorKind, RemoteOperationError,
    RemoteServiceCaller, ServiceCallDispatcher, ServiceCallEnvelope, ServiceCallInvoker,
    ServiceCallRequest, ServiceCallResult, ServiceDispatch, ServiceException, ServiceProxy,
    ServiceProxyFactory,
};

// Uplink exports
pub use uplink::{
    BoundedMessageBlockPrioritizer, MessageBlock, MessageBlockPriority, MessageBlockType,
    MessageBlockWithMetadata, UplinkConfigurationProvider, UplinkError, UplinkProtocolConfiguration,
    UplinkProtocolConfigurationBuilder, UplinkSession,
};

// Node exports
pub use config::NodeConfig;
pub use node::{CommunicationNode, CommunicationNodeBuilder, NodeError};
