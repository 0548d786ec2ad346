//! Bounded outbound queue for a single subscriber.
//!
//! The hub pushes without ever blocking; when the queue is full the oldest
//! pending event is discarded to make room. The subscriber's writer task is
//! the only consumer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use crate::event::Event;

/// Result of pushing onto a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The event was queued.
    Enqueued,
    /// The queue was full; the oldest event was dropped and this one queued.
    DroppedOldest {
        /// Overflows since the consumer last took an event.
        streak: u32,
    },
    /// The queue is closed; the event was discarded.
    Closed,
}

#[derive(Debug, Default)]
struct Inner {
    events: VecDeque<Arc<Event>>,
    closed: bool,
    overflow_streak: u32,
    dropped: u64,
}

/// A bounded, drop-oldest, single-consumer queue.
#[derive(Debug)]
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` events (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                events: VecDeque::with_capacity(capacity.min(64)),
                ..Inner::default()
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push an event without blocking.
    pub fn push(&self, event: Arc<Event>) -> PushOutcome {
        let mut inner = self.lock();
        if inner.closed {
            return PushOutcome::Closed;
        }

        let outcome = if inner.events.len() >= self.capacity {
            inner.events.pop_front();
            inner.dropped += 1;
            inner.overflow_streak = inner.overflow_streak.saturating_add(1);
            PushOutcome::DroppedOldest {
                streak: inner.overflow_streak,
            }
        } else {
            PushOutcome::Enqueued
        };

        inner.events.push_back(event);
        drop(inner);

        self.notify.notify_one();
        outcome
    }

    /// Take the next event without waiting.
    ///
    /// Returns `None` if the queue is empty or closed.
    pub fn try_recv(&self) -> Option<Arc<Event>> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        let event = inner.events.pop_front();
        if event.is_some() {
            inner.overflow_streak = 0;
        }
        event
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the queue is closed. Cancel safe: dropping the
    /// future never loses an event.
    pub async fn recv(&self) -> Option<Arc<Event>> {
        loop {
            let notified = self.notify.notified();
            {
                let inner = self.lock();
                if inner.closed {
                    return None;
                }
            }
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            notified.await;
        }
    }

    /// Close the queue and release any pending events.
    ///
    /// Returns `true` if this call closed it.
    pub fn close(&self) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        inner.closed = true;
        inner.events = VecDeque::new();
        drop(inner);

        self.notify.notify_one();
        true
    }

    /// Check if the queue is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of pending events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    /// Check if no events are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of pending events.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total events discarded by overflow.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}
