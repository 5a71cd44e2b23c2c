//! Fixed-capacity FIFO queues used to fan messages into the rest of the
//! system without letting a stalled consumer grow memory without bound.
//!
//! Pushing onto a full queue drops the incoming item; popping from an empty
//! queue returns `None` and never lets the observed count go negative.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// A bounded, multi-producer/single-consumer-safe FIFO queue.
///
/// `push` drops the incoming item when the queue is at capacity rather than
/// blocking the caller; callers that need backpressure should watch `len()`
/// themselves.
pub struct BoundedQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    count: AtomicUsize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        BoundedQueue {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            count: AtomicUsize::new(0),
        }
    }

    /// Current number of items queued. Safe to call without locking.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pushes `item` onto the queue. If the queue is already at capacity the
    /// item is dropped silently and `false` is returned.
    pub async fn push(&self, item: T) -> bool {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            return false;
        }
        items.push_back(item);
        self.count.store(items.len(), Ordering::Release);
        true
    }

    /// Pops the oldest item, or `None` if the queue is empty.
    pub async fn pop(&self) -> Option<T> {
        let mut items = self.items.lock().await;
        let item = items.pop_front();
        self.count.store(items.len(), Ordering::Release);
        item
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn push_pop_fifo_order() {
        let q: BoundedQueue<i32> = BoundedQueue::new(4);
        assert!(q.push(1).await);
        assert!(q.push(2).await);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().await, Some(1));
        assert_eq!(q.pop().await, Some(2));
        assert_eq!(q.pop().await, None);
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn overflow_drops_incoming() {
        let q: BoundedQueue<i32> = BoundedQueue::new(2);
        assert!(q.push(1).await);
        assert!(q.push(2).await);
        assert!(!q.push(3).await);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().await, Some(1));
        assert_eq!(q.pop().await, Some(2));
    }

    #[tokio::test]
    async fn pop_on_empty_does_not_go_negative() {
        let q: BoundedQueue<i32> = BoundedQueue::new(2);
        assert_eq!(q.pop().await, None);
        assert_eq!(q.len(), 0);
    }
}
