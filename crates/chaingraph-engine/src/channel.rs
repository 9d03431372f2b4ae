//! MultiChannel: a one-producer, many-consumer streaming buffer used
//! to wire a stream-typed output port to every consumer connected to it.
//!
//! Each consumer owns a cursor into a shared, bounded buffer. A cursor never
//! loses an item that is still in the buffer; the buffer only drops its
//! oldest entries once every live cursor has advanced past them. When the
//! buffer hits its high-water mark the producer is backpressured until some
//! consumer's progress drops it back under the low-water mark.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{EngineError, Result};

struct ChannelState<T> {
    buffer: VecDeque<T>,
    /// Absolute stream index of `buffer[0]`.
    base: usize,
    /// Absolute stream index the next published item will receive.
    next_index: usize,
    closed: bool,
    error: Option<String>,
    cursors: HashMap<u64, usize>,
}

/// One producer, many consumers, bounded by a high/low water mark.
pub struct MultiChannel<T> {
    state: Mutex<ChannelState<T>>,
    item_ready: Notify,
    space_available: Notify,
    next_cursor_id: AtomicU64,
    high_water_mark: usize,
    low_water_mark: usize,
    /// How long `publish` will wait for a consumer to make room before
    /// giving up and surfacing `ResourceExhausted`. Reuses
    /// `EngineConfig::cancel_grace_period` rather than inventing a second,
    /// separately-configured timeout.
    backpressure_timeout: Duration,
}

impl<T: Clone> MultiChannel<T> {
    pub fn new(high_water_mark: usize, low_water_mark: usize, backpressure_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ChannelState {
                buffer: VecDeque::new(),
                base: 0,
                next_index: 0,
                closed: false,
                error: None,
                cursors: HashMap::new(),
            }),
            item_ready: Notify::new(),
            space_available: Notify::new(),
            next_cursor_id: AtomicU64::new(0),
            high_water_mark,
            low_water_mark: low_water_mark.min(high_water_mark.saturating_sub(1)).max(1),
            backpressure_timeout,
        }
    }

    /// Publish one item. Blocks (asynchronously) while the buffer is at its
    /// high-water mark, until a consumer advances far enough to free space.
    /// If no consumer makes progress before `backpressure_timeout` elapses,
    /// the channel is closed with a `ResourceExhausted` error (visible to
    /// every subscriber) and the same error is returned to the producer.
    pub async fn publish(self: &Arc<Self>, item: T) -> Result<()> {
        let mut pending = Some(item);
        let deadline = tokio::time::Instant::now() + self.backpressure_timeout;
        loop {
            let notified = self.space_available.notified();
            {
                let mut state = self.state.lock();
                if state.buffer.len() < self.high_water_mark {
                    state.buffer.push_back(pending.take().expect("item already published"));
                    state.next_index += 1;
                    drop(state);
                    self.item_ready.notify_waiters();
                    return Ok(());
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let err = EngineError::ResourceExhausted(format!(
                    "channel high-water mark ({}) reached with no consumer progress for {:?}",
                    self.high_water_mark, self.backpressure_timeout
                ));
                self.set_error(err.to_string());
                return Err(err);
            }
        }
    }

    /// Mark end-of-stream. Idempotent; pending consumers drain the
    /// remaining buffer before observing the end.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.item_ready.notify_waiters();
    }

    /// Surface an error to consumers once they finish draining the buffer.
    pub fn set_error(&self, err: impl Into<String>) {
        let mut state = self.state.lock();
        state.error = Some(err.into());
        state.closed = true;
        drop(state);
        self.item_ready.notify_waiters();
    }

    pub fn get_error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Register a new consumer cursor, positioned at the oldest item still
    /// in the buffer (or at the stream's current tail if nothing has been
    /// published yet).
    pub fn subscribe(self: &Arc<Self>) -> ChannelCursor<T> {
        let id = self.next_cursor_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.cursors.insert(id, state.base);
        ChannelCursor {
            channel: Arc::clone(self),
            id,
        }
    }

    fn recv_ready(&self, cursor_id: u64) -> Option<ReadOutcome<T>> {
        let mut state = self.state.lock();
        let pos = *state.cursors.get(&cursor_id).expect("unknown cursor");
        if let Some(offset) = pos.checked_sub(state.base) {
            if offset < state.buffer.len() {
                let item = state.buffer[offset].clone();
                state.cursors.insert(cursor_id, pos + 1);
                self.trim_locked(&mut state);
                let should_notify_space = state.buffer.len() <= self.low_water_mark;
                drop(state);
                if should_notify_space {
                    self.space_available.notify_waiters();
                }
                return Some(ReadOutcome::Item(item));
            }
        }
        if state.closed {
            return Some(match state.error.clone() {
                Some(e) => ReadOutcome::Error(e),
                None => ReadOutcome::End,
            });
        }
        None
    }

    fn trim_locked(&self, state: &mut ChannelState<T>) {
        let min_cursor = state.cursors.values().copied().min().unwrap_or(state.next_index);
        while state.base < min_cursor && !state.buffer.is_empty() {
            state.buffer.pop_front();
            state.base += 1;
        }
    }

    fn unsubscribe(&self, cursor_id: u64) {
        let mut state = self.state.lock();
        state.cursors.remove(&cursor_id);
        self.trim_locked(&mut state);
    }
}

enum ReadOutcome<T> {
    Item(T),
    End,
    Error(String),
}

/// A single consumer's view of a [`MultiChannel`].
pub struct ChannelCursor<T> {
    channel: Arc<MultiChannel<T>>,
    id: u64,
}

impl<T: Clone> ChannelCursor<T> {
    /// Await the next item. Returns `None` once the channel is closed and
    /// fully drained; returns `Some(Err(..))` if the producer surfaced an
    /// error after the buffer was drained.
    pub async fn next(&mut self) -> Option<std::result::Result<T, String>> {
        loop {
            let notified = self.channel.item_ready.notified();
            match self.channel.recv_ready(self.id) {
                Some(ReadOutcome::Item(item)) => return Some(Ok(item)),
                Some(ReadOutcome::End) => return None,
                Some(ReadOutcome::Error(e)) => return Some(Err(e)),
                None => notified.await,
            }
        }
    }
}

impl<T> Drop for ChannelCursor<T> {
    fn drop(&mut self) {
        self.channel.unsubscribe(self.id);
    }
}
