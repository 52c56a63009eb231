//! Bounded latest-frame buffer with per-consumer cursors

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::Frame;

/// Fan-out ring buffer holding the most recent frames.
///
/// `offer` never blocks: a full buffer evicts its oldest frame. Every consumer
/// reads through its own [`FrameCursor`], so readers never compete for frames
/// and a slow reader only skips ahead instead of holding anyone back.
pub struct FrameRingBuffer {
    slots: Mutex<Slots>,
    capacity: usize,

    /// Wakes consumers parked in `take`
    notify: Notify,

    /// Statistics
    stats: CachePadded<Stats>,
}

struct Slots {
    frames: VecDeque<Slot>,
    next_position: u64,
}

struct Slot {
    position: u64,
    frame: Frame,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RingStats {
    pub written: u64,
    pub delivered: u64,
    pub dropped: u64,
}

/// Read position of one consumer; a fresh cursor starts at the oldest retained frame
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameCursor {
    next: u64,
}

impl FrameCursor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Mutex::new(Slots {
                frames: VecDeque::with_capacity(capacity),
                next_position: 0,
            }),
            capacity,
            notify: Notify::new(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer: insert a frame, evicting the oldest one if full.
    /// Returns true when a frame was evicted.
    pub fn offer(&self, frame: Frame) -> bool {
        let evicted = {
            let mut slots = self.slots();
            let evicted = if slots.frames.len() >= self.capacity {
                slots.frames.pop_front();
                true
            } else {
                false
            };

            let position = slots.next_position;
            slots.next_position += 1;
            slots.frames.push_back(Slot { position, frame });
            evicted
        };

        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        if evicted {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_waiters();
        evicted
    }

    /// Consumer: next frame for this cursor, without waiting
    pub fn try_take(&self, cursor: &mut FrameCursor) -> Option<Frame> {
        let slots = self.slots();
        let oldest = slots.frames.front()?.position;

        // A cursor behind the oldest slot jumps forward to it
        let index = cursor.next.saturating_sub(oldest) as usize;
        let slot = slots.frames.get(index)?;
        cursor.next = slot.position + 1;
        let frame = slot.frame.clone();
        drop(slots);

        self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Consumer: wait up to `timeout` for a frame this cursor has not seen.
    /// `None` means no data yet; callers are expected to retry.
    pub async fn take(&self, cursor: &mut FrameCursor, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so an offer in between is not missed
            notified.as_mut().enable();

            if let Some(frame) = self.try_take(cursor) {
                return Some(frame);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Drop every retained frame. Cursors stay valid.
    pub fn clear(&self) {
        self.slots().frames.clear();
    }

    pub fn len(&self) -> usize {
        self.slots().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}
