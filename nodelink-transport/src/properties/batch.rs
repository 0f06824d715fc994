use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

/// Collects items and hands them to a processor in batches.
///
/// A batch is processed when it reaches `max_size` items or `max_latency`
/// after its first item arrived, whichever comes first. Batches are
/// processed one at a time, in order.
pub(crate) struct BatchAggregator<T> {
    queue: mpsc::UnboundedSender<T>,
}

impl<T: Send + 'static> BatchAggregator<T> {
    /// Spawn the aggregation task. Requires a tokio runtime.
    pub(crate) fn new<F, Fut>(max_size: usize, max_latency: Duration, processor: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (queue, mut rx) = mpsc::unbounded_channel::<T>();
        let max_size = max_size.max(1);
        tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                let deadline = tokio::time::Instant::now() + max_latency;
                let mut batch = vec![first];
                let mut closed = false;
                while batch.len() < max_size {
                    tokio::select! {
                        item = rx.recv() => match item {
                            Some(item) => batch.push(item),
                            None => {
                                closed = true;
                                break;
                            }
                        },
                        _ = tokio::time::sleep_until(deadline) => break,
                    }
                }
                processor(batch).await;
                if closed {
                    break;
                }
            }
        });
        Self { queue }
    }

    /// Add an item to the current batch.
    pub(crate) fn enqueue(&self, item: T) {
        if self.queue.send(item).is_err() {
            tracing::warn!("batch aggregator task has stopped; dropping item");
        }
    }
}
