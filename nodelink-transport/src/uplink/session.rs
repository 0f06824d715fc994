//! UplinkSession: multiplexed logical channels over one byte stream.
//!
//! Two background tasks own the stream halves:
//! - the writer waits on a `Notify`, then drains the prioritizer onto the
//!   stream; after `close` it drains what is queued, writes a goodbye block
//!   and shuts the stream down
//! - the reader decodes blocks and hands each one to the receiver
//!   registered for its channel id, or to the session-level receiver

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::wire::{MAX_PAYLOAD_SIZE, WireError};

use super::{
    BoundedMessageBlockPrioritizer, MessageBlock, MessageBlockPriority, MessageBlockType,
    MessageBlockWithMetadata, UplinkError, UplinkProtocolConfiguration, encode_block,
    try_decode_block,
};

/// Channel id of blocks that concern the session as a whole.
const SESSION_CHANNEL_ID: u64 = 0;

struct SessionShared {
    prioritizer: BoundedMessageBlockPrioritizer,
    data_to_send: Notify,
    receivers: Mutex<HashMap<u64, mpsc::UnboundedSender<MessageBlock>>>,
    unrouted: mpsc::UnboundedSender<MessageBlockWithMetadata>,
    closing: AtomicBool,
    closed: AtomicBool,
}

impl SessionShared {
    fn mark_closed(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Dropping the senders ends every channel receiver.
            self.receivers.lock().clear();
            self.data_to_send.notify_one();
        }
    }
}

/// One end of an uplink session.
pub struct UplinkSession {
    shared: Arc<SessionShared>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: JoinHandle<()>,
}

impl UplinkSession {
    /// Start a session over `stream`.
    ///
    /// Returns the session and a receiver for blocks whose channel id has no
    /// registered receiver (channel offers, session-level traffic). Requires
    /// a tokio runtime.
    pub fn new<S>(
        stream: S,
        configuration: &UplinkProtocolConfiguration,
    ) -> (Self, mpsc::UnboundedReceiver<MessageBlockWithMetadata>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (unrouted_tx, unrouted_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            prioritizer: BoundedMessageBlockPrioritizer::new(configuration),
            data_to_send: Notify::new(),
            receivers: Mutex::new(HashMap::new()),
            unrouted: unrouted_tx,
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let (read_half, write_half) = tokio::io::split(stream);
        let writer = tokio::spawn(writer_task(shared.clone(), write_half));
        let reader = tokio::spawn(reader_task(shared.clone(), read_half));
        let session = Self {
            shared,
            writer: Mutex::new(Some(writer)),
            reader,
        };
        (session, unrouted_rx)
    }

    /// Receive the blocks arriving for `channel_id` from now on.
    ///
    /// A second registration for the same id replaces the first.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session has ended.
    pub fn register_channel(
        &self,
        channel_id: u64,
    ) -> Result<mpsc::UnboundedReceiver<MessageBlock>, UplinkError> {
        if self.is_closed() {
            return Err(UplinkError::SessionClosed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.receivers.lock().insert(channel_id, tx);
        Ok(rx)
    }

    /// Stop routing blocks for `channel_id` to its receiver.
    pub fn unregister_channel(&self, channel_id: u64) {
        self.shared.receivers.lock().remove(&channel_id);
    }

    /// Queue `block` for sending. Never waits for the stream.
    ///
    /// # Errors
    ///
    /// - `SessionClosed` once [`close`](Self::close) was called or the
    ///   stream ended
    /// - `QueueFull` if the priority class is at capacity
    /// - `Wire(FrameTooLarge)` if the payload cannot be framed
    pub fn send(
        &self,
        block: MessageBlock,
        channel_id: u64,
        priority: MessageBlockPriority,
    ) -> Result<(), UplinkError> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(UplinkError::SessionClosed);
        }
        if block.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::FrameTooLarge { size: block.payload.len() }.into());
        }
        self.shared
            .prioritizer
            .submit_or_fail(MessageBlockWithMetadata::new(block, channel_id, priority))?;
        self.shared.data_to_send.notify_one();
        Ok(())
    }

    /// Blocks of `priority` waiting to be written.
    pub fn queued(&self, priority: MessageBlockPriority) -> usize {
        self.shared.prioritizer.queued(priority)
    }

    /// Whether the session has ended.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Send a goodbye after everything already queued, then shut down the
    /// write side. Returns once the goodbye was written or the stream failed.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session was already closing.
    pub async fn close(&self) -> Result<(), UplinkError> {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return Err(UplinkError::SessionClosed);
        }
        self.shared.data_to_send.notify_one();

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::warn!(error = %e, "uplink writer task ended abnormally");
            }
        }
        Ok(())
    }
}

impl Drop for UplinkSession {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.lock().take() {
            writer.abort();
        }
        self.reader.abort();
    }
}

async fn writer_task<S: AsyncWrite>(shared: Arc<SessionShared>, mut stream: WriteHalf<S>) {
    loop {
        shared.data_to_send.notified().await;
        while let Some(block) = shared.prioritizer.take_next() {
            if let Err(e) = write_block(&mut stream, &block).await {
                tracing::debug!(error = %e, "uplink write failed");
                shared.mark_closed();
                return;
            }
        }
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        if shared.closing.load(Ordering::SeqCst) {
            let goodbye = MessageBlockWithMetadata::new(
                MessageBlock::new(MessageBlockType::Goodbye, Vec::new()),
                SESSION_CHANNEL_ID,
                MessageBlockPriority::SessionControl,
            );
            match write_block(&mut stream, &goodbye).await {
                Ok(()) => {
                    if let Err(e) = stream.shutdown().await {
                        tracing::debug!(error = %e, "uplink shutdown after goodbye failed");
                    }
                    tracing::debug!("uplink goodbye sent");
                }
                Err(e) => tracing::debug!(error = %e, "uplink goodbye could not be written"),
            }
            shared.mark_closed();
            return;
        }
    }
}

async fn write_block<S: AsyncWrite>(
    stream: &mut WriteHalf<S>,
    block: &MessageBlockWithMetadata,
) -> Result<(), UplinkError> {
    let data = encode_block(block)?;
    stream.write_all(&data).await?;
    Ok(())
}

async fn reader_task<S: AsyncRead>(shared: Arc<SessionShared>, mut stream: ReadHalf<S>) {
    let mut buffer: Vec<u8> = Vec::with_capacity(4096);
    loop {
        loop {
            let decoded = match try_decode_block(&buffer) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed uplink block, ending session");
                    shared.mark_closed();
                    return;
                }
            };
            let Some((block, consumed)) = decoded else {
                break;
            };
            buffer.drain(..consumed);
            if block.channel_id == SESSION_CHANNEL_ID
                && block.block.block_type == MessageBlockType::Goodbye
            {
                tracing::debug!("uplink goodbye received");
                shared.mark_closed();
                return;
            }
            deliver(&shared, block);
        }

        match stream.read_buf(&mut buffer).await {
            Ok(0) => {
                tracing::debug!("uplink stream ended");
                shared.mark_closed();
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "uplink read failed");
                shared.mark_closed();
                return;
            }
        }
    }
}

fn deliver(shared: &SessionShared, block: MessageBlockWithMetadata) {
    let channel_id = block.channel_id;
    let mut receivers = shared.receivers.lock();
    if let Some(tx) = receivers.get(&channel_id) {
        if tx.send(block.block).is_err() {
            receivers.remove(&channel_id);
        }
        return;
    }
    drop(receivers);
    if shared.unrouted.send(block).is_err() {
        tracing::debug!(channel_id, "no receiver for uplink block");
    }
}
