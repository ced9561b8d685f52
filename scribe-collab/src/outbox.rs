//! Per-connection outbound queue with backpressure.
//!
//! ```text
//! RoomManager::broadcast ──push──► Outbox ──recv──► connection writer ──► socket
//!                                   ├── reliable lane (SYNC, CONTROL): never dropped
//!                                   └── lossy lane (PRESENCE, PING/PONG): drop-oldest
//! ```
//!
//! `push` never waits, so one slow socket cannot stall a broadcast. A
//! consumer whose reliable lane grows past `max_pending_sync` is evicted: the
//! outbox closes and the connection is dropped, and the client recovers by
//! reconnecting and receiving the full state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

use crate::protocol::Delivery;

/// Encoded frame shared by every recipient of a broadcast.
pub type Frame = Arc<str>;

/// Result of queueing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after discarding the oldest lossy frame.
    DroppedOldest,
    /// The outbox is closed; the frame was discarded.
    Closed,
    /// The reliable lane overflowed and the outbox was closed.
    Evicted,
}

#[derive(Default)]
struct Lanes {
    reliable: VecDeque<Frame>,
    lossy: VecDeque<Frame>,
    closed: bool,
    evicted: bool,
}

/// Bounded two-lane outbound queue for a single connection.
pub struct Outbox {
    lanes: Mutex<Lanes>,
    notify: Notify,
    queue_capacity: usize,
    max_pending_sync: usize,
    dropped: AtomicU64,
}

impl Outbox {
    pub fn new(queue_capacity: usize, max_pending_sync: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            notify: Notify::new(),
            queue_capacity: queue_capacity.max(1),
            max_pending_sync: max_pending_sync.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a frame without waiting.
    pub fn push(&self, frame: Frame, delivery: Delivery) -> PushOutcome {
        let outcome = {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            if lanes.closed {
                return PushOutcome::Closed;
            }
            match delivery {
                Delivery::Reliable => {
                    if lanes.reliable.len() >= self.max_pending_sync {
                        lanes.closed = true;
                        lanes.evicted = true;
                        lanes.reliable.clear();
                        lanes.lossy.clear();
                        PushOutcome::Evicted
                    } else {
                        lanes.reliable.push_back(frame);
                        PushOutcome::Queued
                    }
                }
                Delivery::Lossy => {
                    let mut outcome = PushOutcome::Queued;
                    if lanes.lossy.len() >= self.queue_capacity {
                        lanes.lossy.pop_front();
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        outcome = PushOutcome::DroppedOldest;
                    }
                    lanes.lossy.push_back(frame);
                    outcome
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Next frame to send, reliable lane first. `None` once the outbox is
    /// closed; frames still queued at that point are discarded.
    pub async fn recv(&self) -> Option<Frame> {
        loop {
            {
                let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
                if lanes.closed {
                    return None;
                }
                if let Some(frame) = lanes.reliable.pop_front() {
                    return Some(frame);
                }
                if let Some(frame) = lanes.lossy.pop_front() {
                    return Some(frame);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-waiting variant of [`recv`](Self::recv).
    pub fn try_recv(&self) -> Option<Frame> {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        if lanes.closed {
            return None;
        }
        lanes.reliable.pop_front().or_else(|| lanes.lossy.pop_front())
    }

    /// Close the outbox, cancelling everything still queued.
    pub fn close(&self) {
        {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            lanes.closed = true;
            lanes.reliable.clear();
            lanes.lossy.clear();
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner).closed
    }

    /// True if the outbox was closed because its consumer fell behind.
    pub fn was_evicted(&self) -> bool {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner).evicted
    }

    pub fn len(&self) -> usize {
        let lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        lanes.reliable.len() + lanes.lossy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lossy frames discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
