use std::collections::VecDeque;

use parking_lot::Mutex;

use super::{
    MessageBlockPriority, MessageBlockWithMetadata, UplinkError, UplinkProtocolConfiguration,
};

struct Bucket {
    queue: VecDeque<MessageBlockWithMetadata>,
    capacity: usize,
}

/// Bounded outbound queue with one FIFO per priority class.
///
/// Neither operation blocks: `submit_or_fail` rejects blocks for a full
/// class and `take_next` returns `None` when everything is empty. Each class
/// has its own lock, so producers of different priorities do not contend.
pub struct BoundedMessageBlockPrioritizer {
    buckets: Vec<Mutex<Bucket>>,
}

impl BoundedMessageBlockPrioritizer {
    /// Create a prioritizer with the capacities of `configuration`, read
    /// once here.
    pub fn new(configuration: &UplinkProtocolConfiguration) -> Self {
        let buckets = MessageBlockPriority::ALL
            .into_iter()
            .map(|priority| {
                Mutex::new(Bucket {
                    queue: VecDeque::new(),
                    capacity: configuration.max_buffered_messages_for_priority(priority),
                })
            })
            .collect();
        Self { buckets }
    }

    /// Queue `block` in its priority class.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` if the class already holds its capacity.
    pub fn submit_or_fail(&self, block: MessageBlockWithMetadata) -> Result<(), UplinkError> {
        let priority = block.priority;
        let mut bucket = self.buckets[priority.index()].lock();
        if bucket.queue.len() >= bucket.capacity {
            return Err(UplinkError::QueueFull {
                priority,
                capacity: bucket.capacity,
            });
        }
        bucket.queue.push_back(block);
        Ok(())
    }

    /// The oldest block of the most urgent non-empty class.
    pub fn take_next(&self) -> Option<MessageBlockWithMetadata> {
        self.buckets.iter().find_map(|bucket| bucket.lock().queue.pop_front())
    }

    /// Queued blocks of one priority class.
    pub fn queued(&self, priority: MessageBlockPriority) -> usize {
        self.buckets[priority.index()].lock().queue.len()
    }

    /// Whether no block is queued.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.lock().queue.is_empty())
    }
}
