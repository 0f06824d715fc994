//! Ordered asynchronous listener callbacks.
//!
//! Each listener gets its own delivery task fed by an unbounded mpsc queue,
//! so callbacks run off the mutating thread, in enqueue order, and a slow
//! listener never delays the others.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

type Callback<L> = Arc<dyn Fn(&L) + Send + Sync>;

/// Listener set with per-listener ordered delivery.
///
/// Adding a listener spawns a task and therefore requires a tokio runtime.
pub(crate) struct OrderedCallbacks<L: ?Sized + Send + Sync + 'static> {
    queues: Mutex<Vec<mpsc::UnboundedSender<Callback<L>>>>,
}

impl<L: ?Sized + Send + Sync + 'static> Default for OrderedCallbacks<L> {
    fn default() -> Self {
        Self {
            queues: Mutex::new(Vec::new()),
        }
    }
}

impl<L: ?Sized + Send + Sync + 'static> OrderedCallbacks<L> {
    /// Add a listener whose first callback is `initial`.
    ///
    /// Call this while holding the lock that orders later [`enqueue`](Self::enqueue)
    /// calls, so the initial state and the following deltas line up.
    pub(crate) fn add_listener_with_initial(
        &self,
        listener: Arc<L>,
        initial: impl Fn(&L) + Send + Sync + 'static,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Callback<L>>();
        if tx.send(Arc::new(initial)).is_err() {
            tracing::debug!("listener queue closed before the initial callback");
        }
        tokio::spawn(async move {
            while let Some(callback) = rx.recv().await {
                callback(listener.as_ref());
            }
        });
        self.queues.lock().push(tx);
    }

    /// Queue `callback` for every listener.
    pub(crate) fn enqueue(&self, callback: impl Fn(&L) + Send + Sync + 'static) {
        let callback: Callback<L> = Arc::new(callback);
        self.queues
            .lock()
            .retain(|queue| queue.send(callback.clone()).is_ok());
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.queues.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Sink: Send + Sync {
        fn push(&self, value: u32);
    }

    struct Recorder {
        seen: Mutex<Vec<u32>>,
        done: tokio::sync::Notify,
    }

    impl Sink for Recorder {
        fn push(&self, value: u32) {
            self.seen.lock().push(value);
            if value == 100 {
                self.done.notify_one();
            }
        }
    }

    #[tokio::test]
    async fn test_initial_callback_comes_first_and_order_is_kept() {
        let callbacks: OrderedCallbacks<dyn Sink> = OrderedCallbacks::default();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            done: tokio::sync::Notify::new(),
        });
        callbacks.add_listener_with_initial(recorder.clone(), |l| l.push(0));
        for i in 1..=100 {
            callbacks.enqueue(move |l| l.push(i));
        }
        recorder.done.notified().await;

        let seen = recorder.seen.lock().clone();
        assert_eq!(seen, (0..=100).collect::<Vec<_>>());
        assert_eq!(callbacks.listener_count(), 1);
    }
}
