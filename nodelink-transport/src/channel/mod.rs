//! Message channels: logical point-to-point conduits between two nodes.
//!
//! A [`MessageChannel`] is created by a [`TransportProvider`](crate::TransportProvider)
//! and carries [`NetworkRequest`]/[`NetworkResponse`] exchanges. The sending
//! side always initiates; a duplex transport additionally hands the accepting
//! side a *remote-initiated* channel pointing back at the initiator, which is
//! how either side can push to the other.
//!
//! # Channel Lifecycle
//!
//! ```text
//! ┌────────────┐  connect   ┌──────┐  close / failure  ┌────────┐
//! │ Connecting ├───────────►│ Open ├──────────────────►│ Closed │
//! └─────┬──────┘            └──┬───┘                   └────────┘
//!       │ refused              │ send_request
//!       ▼                      ▼
//!    error to caller      one exchange at a time
//! ```
//!
//! Channels never reconnect by themselves; retry policy belongs to the caller.

mod handler_map;
mod service;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::MessagingResult;
use crate::protocol::{NetworkRequest, NetworkResponse};
use crate::NodeId;

pub use handler_map::{NetworkRequestHandler, RequestHandlerMap};
pub use service::MessageChannelService;

/// A point-to-point conduit to one remote node.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Unique id of this channel.
    fn channel_id(&self) -> &str;

    /// The node at the other end.
    fn remote_node_id(&self) -> &NodeId;

    /// Whether the remote side created this channel through a duplex connection.
    fn is_remote_initiated(&self) -> bool;

    /// Whether the channel can still carry requests.
    fn is_open(&self) -> bool;

    /// Send one request and wait for its response.
    ///
    /// Requests on one channel are strictly sequential: a second call waits
    /// until the first has observed its response or failure.
    ///
    /// # Errors
    ///
    /// - `ChannelClosed` if the channel was closed before sending
    /// - `RequestInterrupted` if the channel broke during the exchange
    /// - `Timeout` if no response arrived in time
    async fn send_request(
        &self,
        request: NetworkRequest,
        timeout: Duration,
    ) -> MessagingResult<NetworkResponse>;

    /// Close the channel. Returns `true` only for the call that closed it.
    fn close(&self) -> bool;
}

/// Callbacks a transport uses to hand incoming traffic to the local node.
#[async_trait]
pub trait ChannelEndpointHandler: Send + Sync {
    /// Id of the local node, sent during connection handshakes.
    fn local_node_id(&self) -> NodeId;

    /// Process one incoming request.
    async fn on_request(&self, request: NetworkRequest) -> NetworkResponse;

    /// A duplex peer connected and created a channel back to itself.
    fn on_remote_initiated_channel(&self, channel: Arc<dyn MessageChannel>);

    /// The remote side closed the link behind one of the local channels.
    fn on_remote_channel_closed(&self, _channel_id: &str) {}
}

/// Observer of channel establishment and closing.
pub trait MessageChannelLifecycleListener: Send + Sync {
    /// A channel became available (outgoing or remote-initiated).
    fn on_channel_established(&self, _channel: &Arc<dyn MessageChannel>) {}

    /// A channel was closed or failed.
    fn on_channel_closed(&self, _channel: &Arc<dyn MessageChannel>) {}
}
