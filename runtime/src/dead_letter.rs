//! Bounded dead-letter queue.
//!
//! Holds payloads that no consumer processed successfully, together with the
//! failure reason, so they can be inspected or replayed later.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Dead letter queue entry
#[derive(Debug, Clone)]
pub struct DeadLetter<T> {
    /// The failed payload
    pub payload: T,

    /// The error message from the failure
    pub error_message: String,

    /// When the payload was dead-lettered
    pub failed_at: DateTime<Utc>,
}

/// Dead Letter Queue for storing failed deliveries
///
/// # Features
///
/// - Bounded queue with configurable max size
/// - FIFO ordering (oldest entries dropped when full)
/// - Thread-safe for concurrent access
/// - Metrics tracking for queue size and operations
///
/// # Example
///
/// ```
/// use wiz_kernel_runtime::dead_letter::DeadLetterQueue;
///
/// let dlq = DeadLetterQueue::new(2);
/// dlq.push("a", "timeout".to_string());
/// dlq.push("b", "timeout".to_string());
/// dlq.push("c", "timeout".to_string());
///
/// let payloads: Vec<_> = dlq.entries().into_iter().map(|entry| entry.payload).collect();
/// assert_eq!(payloads, vec!["b", "c"]);
/// ```
#[derive(Debug)]
pub struct DeadLetterQueue<T> {
    queue: Arc<Mutex<VecDeque<DeadLetter<T>>>>,
    max_size: usize,
}

impl<T> DeadLetterQueue<T> {
    /// Create a new dead letter queue with the given max size
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size,
        }
    }

    /// Push a failed payload onto the queue
    ///
    /// If the queue is full, the oldest entry is dropped.
    pub fn push(&self, payload: T, error_message: String) {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if self.max_size == 0 {
            return;
        }

        // Drop oldest if at capacity
        if queue.len() >= self.max_size {
            queue.pop_front();
            metrics::counter!("dlq.dropped").increment(1);
            tracing::warn!(
                max_size = self.max_size,
                "DLQ at capacity, dropping oldest entry"
            );
        }

        queue.push_back(DeadLetter {
            payload,
            error_message,
            failed_at: Utc::now(),
        });

        // Queue size is bounded by max_size, well within f64 precision
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("dlq.size").set(queue.len() as f64);
        metrics::counter!("dlq.pushed").increment(1);
    }

    /// Get the current queue size
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Check if the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every entry, oldest first
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetter<T>>
    where
        T: Clone,
    {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Drain all entries from the queue
    pub fn drain(&self) -> Vec<DeadLetter<T>> {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entries: Vec<_> = queue.drain(..).collect();

        metrics::gauge!("dlq.size").set(0.0);
        metrics::counter!("dlq.drained").increment(entries.len() as u64);

        tracing::info!(count = entries.len(), "Drained dead letter queue");

        entries
    }

    /// Get the maximum queue size
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }
}

impl<T> Clone for DeadLetterQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            max_size: self.max_size,
        }
    }
}

impl<T> Default for DeadLetterQueue<T> {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_drain() {
        let dlq = DeadLetterQueue::new(10);
        dlq.push(1, "first".to_string());
        dlq.push(2, "second".to_string());

        assert_eq!(dlq.len(), 2);
        let drained = dlq.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].payload, 1);
        assert_eq!(drained[1].error_message, "second");
        assert!(dlq.is_empty());
    }

    #[test]
    fn oldest_entry_dropped_at_capacity() {
        let dlq = DeadLetterQueue::new(2);
        dlq.push(1, String::new());
        dlq.push(2, String::new());
        dlq.push(3, String::new());

        let payloads: Vec<i32> = dlq.entries().into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![2, 3]);
        assert_eq!(dlq.max_size(), 2);
    }

    #[test]
    fn clones_share_storage() {
        let dlq = DeadLetterQueue::new(5);
        let other = dlq.clone();
        other.push("x", "failed".to_string());
        assert_eq!(dlq.len(), 1);
    }
}
