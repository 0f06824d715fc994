//! TCP transport.
//!
//! Each connection starts with a handshake: the client sends its node id in a
//! [`FrameKind::Handshake`] frame and the server answers with its own. After
//! that the client sends request frames and the server answers each with one
//! response frame, strictly alternating. The transport is not duplex: the
//! accepting node cannot push to the initiator.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

use crate::channel::{ChannelEndpointHandler, MessageChannel};
use crate::error::{MessagingError, MessagingResult};
use crate::protocol::{NetworkRequest, NetworkResponse};
use crate::transport::TransportProvider;
use crate::wire::{FrameKind, serialize_frame, try_deserialize_frame};
use crate::{ContactPoint, JsonCodec, MessageCodec, NodeId};

/// Transport id of the TCP transport.
pub const TCP_TRANSPORT_ID: &str = "tcp";

/// Transport provider over tokio TCP sockets.
pub struct TcpTransportProvider {
    connect_timeout: Duration,
    codec: JsonCodec,
    servers: Mutex<HashMap<String, JoinHandle<()>>>,
    next_channel: AtomicU64,
}

impl Default for TcpTransportProvider {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl TcpTransportProvider {
    /// Create a provider with the given connection timeout.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            codec: JsonCodec,
            servers: Mutex::new(HashMap::new()),
            next_channel: AtomicU64::new(0),
        }
    }
}

impl Drop for TcpTransportProvider {
    fn drop(&mut self) {
        for (_, accept_task) in self.servers.lock().drain() {
            accept_task.abort();
        }
    }
}

#[async_trait]
impl TransportProvider for TcpTransportProvider {
    fn transport_id(&self) -> &str {
        TCP_TRANSPORT_ID
    }

    fn supports_remote_initiated_connections(&self) -> bool {
        false
    }

    async fn connect(
        &self,
        contact_point: &ContactPoint,
        handler: Arc<dyn ChannelEndpointHandler>,
        _allow_duplex: bool,
    ) -> MessagingResult<Arc<dyn MessageChannel>> {
        let connect_failed = |message: String| MessagingError::ConnectionFailed {
            contact_point: contact_point.to_string(),
            message,
        };
        let mut stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(contact_point.socket_address()),
        )
        .await
        .map_err(|_| connect_failed("connection timed out".to_string()))?
        .map_err(|e| connect_failed(e.to_string()))?;
        stream.set_nodelay(true)?;

        let mut read_buffer = Vec::with_capacity(4096);
        let local_id = self.codec.encode(&handler.local_node_id())?;
        let remote_node_id = tokio::time::timeout(
            self.connect_timeout,
            exchange_handshake(&mut stream, &mut read_buffer, &local_id, &self.codec),
        )
        .await
        .map_err(|_| MessagingError::HandshakeFailed {
            message: "no handshake answer".to_string(),
        })??;

        let channel_id = format!(
            "tcp-{}",
            self.next_channel.fetch_add(1, Ordering::Relaxed) + 1
        );
        tracing::debug!(%channel_id, remote = %remote_node_id, "tcp channel established");
        Ok(Arc::new(TcpMessageChannel {
            channel_id,
            remote_node_id,
            codec: self.codec,
            open: AtomicBool::new(true),
            connection: tokio::sync::Mutex::new(Some(TcpConnection {
                stream,
                read_buffer,
            })),
        }))
    }

    async fn start_server(
        &self,
        contact_point: &ContactPoint,
        handler: Arc<dyn ChannelEndpointHandler>,
    ) -> MessagingResult<ContactPoint> {
        let listener = TcpListener::bind(contact_point.socket_address())
            .await
            .map_err(|e| MessagingError::ServerStartFailed {
                contact_point: contact_point.to_string(),
                message: e.to_string(),
            })?;
        let bound = contact_point.clone().with_port(listener.local_addr()?.port());
        tracing::debug!(contact_point = %bound, "tcp server listening");

        let codec = self.codec;
        let accept_task = tokio::spawn(async move {
            // Dropping the set when the server stops aborts every connection.
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "accepted tcp connection");
                            connections.spawn(serve_connection(stream, handler.clone(), codec));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "tcp accept failed, stopping server");
                            break;
                        }
                    },
                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                }
            }
            tracing::debug!(open = connections.len(), "closing tcp server connections");
        });
        self.servers
            .lock()
            .insert(bound.socket_address(), accept_task);
        Ok(bound)
    }

    async fn stop_server(&self, contact_point: &ContactPoint) {
        let accept_task = self.servers.lock().remove(&contact_point.socket_address());
        if let Some(accept_task) = accept_task {
            accept_task.abort();
            tracing::debug!(%contact_point, "tcp server stopped");
        }
    }
}

async fn exchange_handshake(
    stream: &mut TcpStream,
    read_buffer: &mut Vec<u8>,
    local_id: &[u8],
    codec: &JsonCodec,
) -> MessagingResult<NodeId> {
    write_frame(stream, FrameKind::Handshake, local_id).await?;
    match read_frame(stream, read_buffer).await? {
        Some((FrameKind::Handshake, payload)) => Ok(codec.decode(&payload)?),
        Some((kind, _)) => Err(MessagingError::HandshakeFailed {
            message: format!("expected handshake, got {:?}", kind),
        }),
        None => Err(MessagingError::HandshakeFailed {
            message: "connection closed during handshake".to_string(),
        }),
    }
}

/// Server side of one connection: handshake, then request/response loop.
async fn serve_connection(
    mut stream: TcpStream,
    handler: Arc<dyn ChannelEndpointHandler>,
    codec: JsonCodec,
) {
    let mut read_buffer: Vec<u8> = Vec::with_capacity(4096);
    let result: MessagingResult<()> = async {
        let client_id: NodeId = match read_frame(&mut stream, &mut read_buffer).await? {
            Some((FrameKind::Handshake, payload)) => codec.decode(&payload)?,
            _ => {
                return Err(MessagingError::HandshakeFailed {
                    message: "client did not start with a handshake".to_string(),
                });
            }
        };
        let local_id = codec.encode(&handler.local_node_id())?;
        write_frame(&mut stream, FrameKind::Handshake, &local_id).await?;
        tracing::debug!(client = %client_id, "tcp handshake complete");

        while let Some((kind, payload)) = read_frame(&mut stream, &mut read_buffer).await? {
            if kind != FrameKind::Request {
                tracing::warn!(?kind, "ignoring unexpected frame on server connection");
                continue;
            }
            let request: NetworkRequest = codec.decode(&payload)?;
            let response = handler.on_request(request).await;
            write_frame(&mut stream, FrameKind::Response, &codec.encode(&response)?).await?;
        }
        Ok::<(), MessagingError>(())
    }
    .await;

    if let Err(e) = result {
        tracing::debug!(error = %e, "tcp server connection ended with error");
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    kind: FrameKind,
    payload: &[u8],
) -> MessagingResult<()> {
    let frame = serialize_frame(kind, payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next frame, buffering partial reads. `Ok(None)` on clean EOF.
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    read_buffer: &mut Vec<u8>,
) -> MessagingResult<Option<(FrameKind, Vec<u8>)>> {
    loop {
        if let Some((kind, payload, consumed)) = try_deserialize_frame(read_buffer)? {
            read_buffer.drain(..consumed);
            return Ok(Some((kind, payload)));
        }
        let mut chunk = [0u8; 4096];
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        read_buffer.extend_from_slice(&chunk[..n]);
    }
}

struct TcpConnection {
    stream: TcpStream,
    read_buffer: Vec<u8>,
}

struct TcpMessageChannel {
    channel_id: String,
    remote_node_id: NodeId,
    codec: JsonCodec,
    open: AtomicBool,
    connection: tokio::sync::Mutex<Option<TcpConnection>>,
}

#[async_trait]
impl MessageChannel for TcpMessageChannel {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn remote_node_id(&self) -> &NodeId {
        &self.remote_node_id
    }

    fn is_remote_initiated(&self) -> bool {
        false
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_request(
        &self,
        request: NetworkRequest,
        timeout: Duration,
    ) -> MessagingResult<NetworkResponse> {
        let payload = self.codec.encode(&request)?;
        let mut guard = self.connection.lock().await;
        let connection = match guard.as_mut() {
            Some(connection) if self.is_open() => connection,
            _ => {
                return Err(MessagingError::ChannelClosed {
                    channel_id: self.channel_id.clone(),
                });
            }
        };

        let exchange = async {
            write_frame(&mut connection.stream, FrameKind::Request, &payload).await?;
            read_frame(&mut connection.stream, &mut connection.read_buffer).await
        };
        let interrupted = |message: String| MessagingError::RequestInterrupted {
            channel_id: self.channel_id.clone(),
            message,
        };
        let outcome = match tokio::time::timeout(timeout, exchange).await {
            Err(_) => Err(MessagingError::Timeout { timeout }),
            Ok(Ok(Some((FrameKind::Response, body)))) => {
                self.codec.decode::<NetworkResponse>(&body).map_err(MessagingError::from)
            }
            Ok(Ok(Some((kind, _)))) => Err(interrupted(format!("unexpected {:?} frame", kind))),
            Ok(Ok(None)) => Err(interrupted("connection closed by peer".to_string())),
            Ok(Err(e)) => Err(interrupted(e.to_string())),
        };

        // A failed exchange leaves the stream at an unknown frame boundary.
        if outcome.is_err() || !self.is_open() {
            self.open.store(false, Ordering::SeqCst);
            *guard = None;
        }
        outcome
    }

    fn close(&self) -> bool {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        if was_open && let Ok(mut guard) = self.connection.try_lock() {
            *guard = None;
        }
        was_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageType, ResultCode};

    struct UppercaseEndpoint {
        node_id: NodeId,
    }

    #[async_trait]
    impl ChannelEndpointHandler for UppercaseEndpoint {
        fn local_node_id(&self) -> NodeId {
            self.node_id.clone()
        }

        async fn on_request(&self, request: NetworkRequest) -> NetworkResponse {
            let body = String::from_utf8_lossy(&request.payload).to_uppercase();
            NetworkResponse::success(&request, body.into_bytes())
        }

        fn on_remote_initiated_channel(&self, _channel: Arc<dyn MessageChannel>) {}
    }

    fn endpoint() -> Arc<UppercaseEndpoint> {
        Arc::new(UppercaseEndpoint {
            node_id: NodeId::generate(),
        })
    }

    fn loopback() -> ContactPoint {
        ContactPoint::new(TCP_TRANSPORT_ID, "127.0.0.1", 0).expect("valid contact point")
    }

    #[tokio::test]
    async fn test_tcp_handshake_and_sequential_requests() {
        let provider = TcpTransportProvider::default();
        let server = endpoint();
        let bound = provider
            .start_server(&loopback(), server.clone())
            .await
            .expect("server starts");
        assert_ne!(bound.port(), 0);

        let client = endpoint();
        let channel = provider
            .connect(&bound, client.clone(), true)
            .await
            .expect("connect");
        assert_eq!(channel.remote_node_id(), &server.node_id);

        for word in ["alpha", "beta", "gamma"] {
            let request = NetworkRequest::new(
                MessageType::ServiceCall,
                client.node_id.clone(),
                word.as_bytes().to_vec(),
            );
            let response = channel
                .send_request(request.clone(), Duration::from_secs(5))
                .await
                .expect("response");
            assert_eq!(response.result_code, ResultCode::Success);
            assert_eq!(response.request_id, request.request_id);
            assert_eq!(response.payload, word.to_uppercase().into_bytes());
        }

        assert!(channel.close());
        let request = NetworkRequest::new(MessageType::ServiceCall, client.node_id.clone(), vec![]);
        let err = channel
            .send_request(request, Duration::from_secs(1))
            .await
            .expect_err("closed channel");
        assert!(matches!(err, MessagingError::ChannelClosed { .. }));
        provider.stop_server(&bound).await;
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let provider = TcpTransportProvider::new(Duration::from_secs(2));
        let unused = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = unused.local_addr().expect("addr").port();
        drop(unused);

        let target = loopback().with_port(port);
        let result = provider.connect(&target, endpoint(), false).await;
        assert!(matches!(result, Err(MessagingError::ConnectionFailed { .. })));
    }

    #[tokio::test]
    async fn test_stop_server_closes_open_connections() {
        let provider = TcpTransportProvider::default();
        let bound = provider
            .start_server(&loopback(), endpoint())
            .await
            .expect("server starts");
        let client = endpoint();
        let channel = provider
            .connect(&bound, client.clone(), false)
            .await
            .expect("connect");
        let request =
            NetworkRequest::new(MessageType::ServiceCall, client.node_id.clone(), b"up".to_vec());
        channel
            .send_request(request, Duration::from_secs(5))
            .await
            .expect("served before stop");

        provider.stop_server(&bound).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let request = NetworkRequest::new(
            MessageType::ServiceCall,
            client.node_id.clone(),
            b"down".to_vec(),
        );
        let err = channel
            .send_request(request, Duration::from_secs(5))
            .await
            .expect_err("connection closed with the server");
        assert!(matches!(err, MessagingError::RequestInterrupted { .. }));
        assert!(!channel.is_open());

        let refused = provider.connect(&bound, endpoint(), false).await;
        assert!(matches!(refused, Err(MessagingError::ConnectionFailed { .. })));
    }
}
