//! Batched outbound queue.
//!
//! Many producers ([`Session::send`](super::Session::send) callers) append;
//! exactly one consumer (the session's send loop) drains the whole backlog
//! in one lock acquisition.
//!
//! # Ordering
//!
//! ```text
//! append(A) append(B) append(Stop) append(C)
//!            │
//!            ▼
//! drain() -> out = [A, B], returns true      (C is discarded)
//! ```
//!
//! Everything appended before [`Outbound::Stop`] is handed out, in append
//! order, in the same batch as the stop signal or an earlier one.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use parking_lot::Mutex;
use tokio::sync::Notify;

// ============================================================================
// Outbound
// ============================================================================

/// An item on the outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound<M> {
    /// A message to encode and write.
    Message(M),
    /// Stop after writing the messages queued before this marker.
    Stop,
}

// ============================================================================
// OutboundQueue
// ============================================================================

/// Unbounded multi-producer, single-consumer batch queue.
pub struct OutboundQueue<M> {
    /// Pending items in append order.
    items: Mutex<Vec<Outbound<M>>>,
    /// Wakes the consumer; stores a permit when nobody is waiting.
    ready: Notify,
}

impl<M> Default for OutboundQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for OutboundQueue<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<M> OutboundQueue<M> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            ready: Notify::new(),
        }
    }

    /// Appends an item and wakes the consumer. Never blocks on the consumer.
    pub fn append(&self, item: Outbound<M>) {
        self.items.lock().push(item);
        self.ready.notify_one();
    }

    /// Appends a message.
    #[inline]
    pub fn push(&self, message: M) {
        self.append(Outbound::Message(message));
    }

    /// Appends the stop marker.
    #[inline]
    pub fn push_stop(&self) {
        self.append(Outbound::Stop);
    }

    /// Waits for at least one pending item, then moves the whole backlog
    /// into `out`.
    ///
    /// Returns `true` if the backlog contained [`Outbound::Stop`]. Messages
    /// queued after the marker are dropped.
    pub async fn drain(&self, out: &mut Vec<M>) -> bool {
        loop {
            {
                let mut items = self.items.lock();
                if !items.is_empty() {
                    return Self::take_batch(&mut items, out);
                }
            }

            self.ready.notified().await;
        }
    }

    /// Returns the number of pending items, stop markers included.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns `true` if nothing is pending.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Drops everything pending.
    pub fn reset(&self) {
        self.items.lock().clear();
    }

    fn take_batch(items: &mut Vec<Outbound<M>>, out: &mut Vec<M>) -> bool {
        out.reserve(items.len());

        // Dropping the drain iterator early discards whatever follows Stop.
        for item in items.drain(..) {
            match item {
                Outbound::Message(message) => out.push(message),
                Outbound::Stop => return true,
            }
        }

        false
    }
}

// ============================================================================
// Tests
// ============================================================================
