//! Event Queue: a bounded, multi-producer/single-consumer FIFO that
//! is the substrate for every event subscription's fan-out.
//!
//! Unlike [`crate::channel::MultiChannel`] this never backpressures a
//! producer: node execution must not stall on a slow subscriber, so on
//! overflow the *oldest* buffered event is dropped and a counter is bumped
//! instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct QueueState<T> {
    buffer: VecDeque<T>,
    closed: bool,
}

/// A bounded FIFO queue. One queue per subscription; cloned producer
/// handles (`Arc<EventQueue<T>>`) publish into it, and its single consumer
/// drains it via [`EventQueue::recv`].
pub struct EventQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> EventQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                buffer: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Publish without blocking. Drops the oldest buffered item if the
    /// queue is already at capacity.
    pub fn publish(&self, item: T) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if state.buffer.len() >= self.capacity {
            state.buffer.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        state.buffer.push_back(item);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Idempotent. Unblocks any pending `recv` once the buffer drains.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Await the next item in publication order. Returns `None` once the
    /// queue is closed and empty.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(item) = state.buffer.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Count of events dropped for overflow since creation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fan-out of one publisher to many independently-paced subscribers,
/// realised by maintaining one queue per subscription, each fed by the
/// same publisher. Used both for an execution's event stream and for the
/// flow-level mutation stream.
pub struct EventBus<T> {
    subscribers: Mutex<Vec<Arc<EventQueue<T>>>>,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Publish to every currently-registered subscriber.
    pub fn publish(&self, item: T) {
        for queue in self.subscribers.lock().iter() {
            queue.publish(item.clone());
        }
    }

    /// Register a new subscriber queue, started empty. Items published
    /// before this call are not replayed — callers that need replay
    /// semantics combine this with their own event log.
    pub fn subscribe(&self, capacity: usize) -> Arc<EventQueue<T>> {
        let queue = Arc::new(EventQueue::new(capacity));
        self.subscribers.lock().push(Arc::clone(&queue));
        queue
    }

    /// Close every subscriber queue, ending their streams.
    pub fn close_all(&self) {
        for queue in self.subscribers.lock().drain(..) {
            queue.close();
        }
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_recv_in_order() {
        let queue = EventQueue::new(10);
        queue.publish(1);
        queue.publish(2);
        queue.publish(3);
        assert_eq!(queue.recv().await, Some(1));
        assert_eq!(queue.recv().await, Some(2));
        assert_eq!(queue.recv().await, Some(3));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let queue = EventQueue::new(2);
        queue.publish(1);
        queue.publish(2);
        queue.publish(3); // drops 1
        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(queue.recv().await, Some(2));
        assert_eq!(queue.recv().await, Some(3));
    }

    #[tokio::test]
    async fn close_unblocks_recv_once_drained() {
        let queue = Arc::new(EventQueue::<i32>::new(4));
        queue.publish(1);
        queue.close();
        assert_eq!(queue.recv().await, Some(1));
        assert_eq!(queue.recv().await, None);
        // Idempotent
        queue.close();
        assert_eq!(queue.recv().await, None);
    }

    #[tokio::test]
    async fn recv_blocks_until_published() {
        let queue = Arc::new(EventQueue::<i32>::new(4));
        let reader = {
            let q = Arc::clone(&queue);
            tokio::spawn(async move { q.recv().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.publish(42);
        assert_eq!(reader.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn event_bus_fans_out_to_every_subscriber() {
        let bus: EventBus<i32> = EventBus::new();
        let a = bus.subscribe(10);
        let b = bus.subscribe(10);
        bus.publish(1);
        bus.publish(2);
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(2));
    }
}
