//! Reliable RPC streams: ordered, at-most-once calls to one node.
//!
//! The caller side numbers each call of a stream and retries transport
//! failures with the same sequence number. The callee side executes each
//! sequence number at most once and answers a retried call from its cache.
//!
//! When retries are exhausted after a failure that may have delivered the
//! call, the caller cannot tell whether it executed: the call reports
//! [`RemoteErrorKind::OutcomeUnknown`] and the stream becomes unusable.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::call::{
    ReliableCallTag, RemoteErrorKind, RemoteOperationError, ServiceCallEnvelope, ServiceCallRequest,
};
use super::proxy::ServiceCallInvoker;
use crate::NodeId;
use crate::protocol::new_request_id;

/// Retry behaviour of reliable RPC streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliableStreamPolicy {
    /// Attempts per call, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub initial_backoff: Duration,
    /// Upper bound for the retry delay.
    pub max_backoff: Duration,
}

impl Default for ReliableStreamPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl ReliableStreamPolicy {
    fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(16)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

struct ClientState {
    next_seq: u64,
    broken: bool,
}

/// Caller-side handle of a reliable RPC stream.
///
/// Calls through one handle are serialized.
pub struct ReliableRpcStreamHandle {
    stream_id: String,
    target: NodeId,
    invoker: Arc<dyn ServiceCallInvoker>,
    policy: ReliableStreamPolicy,
    state: tokio::sync::Mutex<ClientState>,
}

impl ReliableRpcStreamHandle {
    pub(crate) fn new(
        target: NodeId,
        invoker: Arc<dyn ServiceCallInvoker>,
        policy: ReliableStreamPolicy,
    ) -> Self {
        Self {
            stream_id: new_request_id(),
            target,
            invoker,
            policy,
            state: tokio::sync::Mutex::new(ClientState {
                next_seq: 1,
                broken: false,
            }),
        }
    }

    /// Random id of this stream.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// The node all calls of this stream go to.
    pub fn target(&self) -> &NodeId {
        &self.target
    }

    /// Whether a previous call ended with an unknown outcome.
    pub async fn is_broken(&self) -> bool {
        self.state.lock().await.broken
    }

    /// Perform one call on the stream.
    pub(crate) async fn call(&self, mut request: ServiceCallRequest) -> ServiceCallEnvelope {
        let mut state = self.state.lock().await;
        if state.broken {
            return Err(RemoteOperationError::communication_failed(format!(
                "reliable stream {} is no longer usable",
                self.stream_id
            )));
        }

        let seq = state.next_seq;
        request.target = self.target.clone();
        request.reliable_stream = Some(ReliableCallTag {
            stream_id: self.stream_id.clone(),
            seq,
        });

        let mut maybe_delivered = false;
        let mut last_error = String::new();
        for attempt in 0..self.policy.max_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.policy.backoff(attempt - 1)).await;
            }
            match self.invoker.invoke(request.clone()).await {
                Ok(Err(e)) if e.kind == RemoteErrorKind::OutcomeUnknown => {
                    tracing::warn!(
                        stream_id = %self.stream_id,
                        seq,
                        error = %e,
                        "remote stream state lost"
                    );
                    state.broken = true;
                    return Err(e);
                }
                Ok(envelope) => {
                    state.next_seq += 1;
                    return envelope;
                }
                Err(e) => {
                    maybe_delivered |= e.may_have_been_delivered();
                    tracing::debug!(
                        stream_id = %self.stream_id,
                        seq,
                        attempt,
                        error = %e,
                        "reliable call attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        if maybe_delivered {
            state.broken = true;
            Err(RemoteOperationError::new(
                RemoteErrorKind::OutcomeUnknown,
                format!(
                    "call {} of stream {} may have been executed: {}",
                    seq, self.stream_id, last_error
                ),
            ))
        } else {
            Err(RemoteOperationError::communication_failed(last_error))
        }
    }
}

/// How long the callee keeps the state of a stream nobody calls.
pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Default)]
struct ServerState {
    last_seq: u64,
    last_request_id: Option<String>,
    last_result: Option<ServiceCallEnvelope>,
}

struct StreamEntry {
    state: Arc<tokio::sync::Mutex<ServerState>>,
    last_used: Instant,
}

struct StreamTable {
    entries: HashMap<String, StreamEntry>,
    last_sweep: Instant,
}

/// Callee-side bookkeeping of reliable streams.
///
/// Streams idle for longer than the idle timeout are forgotten; a later
/// call on such a stream reports `OutcomeUnknown`, as after a restart.
pub(crate) struct ReliableStreamRegistry {
    streams: Mutex<StreamTable>,
    idle_timeout: Duration,
}

impl Default for ReliableStreamRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_IDLE_TIMEOUT)
    }
}

impl ReliableStreamRegistry {
    pub(crate) fn new(idle_timeout: Duration) -> Self {
        Self {
            streams: Mutex::new(StreamTable {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            idle_timeout,
        }
    }

    /// Execute `call` unless `tag` was already executed.
    ///
    /// A repeated sequence number is answered from the cache only when it
    /// carries the same request id as the executed call.
    pub(crate) async fn execute<F, Fut>(
        &self,
        tag: &ReliableCallTag,
        request_id: &str,
        call: F,
    ) -> ServiceCallEnvelope
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ServiceCallEnvelope>,
    {
        let stream = {
            let mut streams = self.streams.lock();
            let now = Instant::now();
            self.sweep_idle(&mut streams, now);
            match streams.entries.get_mut(&tag.stream_id) {
                Some(entry) => {
                    entry.last_used = now;
                    entry.state.clone()
                }
                None if tag.seq == 1 => {
                    let state = Arc::new(tokio::sync::Mutex::new(ServerState::default()));
                    streams.entries.insert(
                        tag.stream_id.clone(),
                        StreamEntry {
                            state: state.clone(),
                            last_used: now,
                        },
                    );
                    state
                }
                None => {
                    return Err(RemoteOperationError::new(
                        RemoteErrorKind::OutcomeUnknown,
                        format!("unknown reliable stream {} at call {}", tag.stream_id, tag.seq),
                    ));
                }
            }
        };

        let mut state = stream.lock().await;
        if tag.seq == state.last_seq + 1 {
            let result = call().await;
            state.last_seq = tag.seq;
            state.last_request_id = Some(request_id.to_string());
            state.last_result = Some(result.clone());
            return result;
        }
        if tag.seq == state.last_seq
            && let Some(cached) = &state.last_result
        {
            if state.last_request_id.as_deref() != Some(request_id) {
                tracing::warn!(
                    stream_id = %tag.stream_id,
                    seq = tag.seq,
                    "sequence number reused by another request"
                );
                return Err(RemoteOperationError::new(
                    RemoteErrorKind::OutcomeUnknown,
                    format!(
                        "call {} of stream {} was already executed for another request",
                        tag.seq, tag.stream_id
                    ),
                ));
            }
            tracing::debug!(
                stream_id = %tag.stream_id,
                seq = tag.seq,
                "replaying cached reliable call result"
            );
            return cached.clone();
        }
        if tag.seq < state.last_seq {
            return Err(RemoteOperationError::new(
                RemoteErrorKind::InternalError,
                format!(
                    "call {} of stream {} is older than {}",
                    tag.seq, tag.stream_id, state.last_seq
                ),
            ));
        }
        Err(RemoteOperationError::new(
            RemoteErrorKind::OutcomeUnknown,
            format!(
                "gap in stream {}: expected {}, got {}",
                tag.stream_id,
                state.last_seq + 1,
                tag.seq
            ),
        ))
    }

    /// Forget streams idle for longer than the idle timeout. Runs at most
    /// once per quarter timeout; streams with a call in progress are kept.
    fn sweep_idle(&self, streams: &mut StreamTable, now: Instant) {
        if now.duration_since(streams.last_sweep) < self.idle_timeout / 4 {
            return;
        }
        streams.last_sweep = now;
        let before = streams.entries.len();
        streams.entries.retain(|_, entry| {
            Arc::strong_count(&entry.state) > 1
                || now.duration_since(entry.last_used) < self.idle_timeout
        });
        let expired = before - streams.entries.len();
        if expired > 0 {
            tracing::debug!(
                expired,
                remaining = streams.entries.len(),
                "expired idle reliable streams"
            );
        }
    }

    /// Forget all stream state, as after a restart.
    pub(crate) fn clear(&self) {
        self.streams.lock().entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.streams.lock().entries.len()
    }
}
