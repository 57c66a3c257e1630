//! Bounded, drop-oldest frame queue sitting between capture and detection.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tracing::trace;

use crate::types::Frame;

pub const DEFAULT_BUFFER_CAPACITY: usize = 30;
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_nanos(1_000_000_000 / 30);

/// Thread-safe frame queue.
///
/// `put` rate-limits on the frames' capture instants: a frame captured less
/// than one interval after the last enqueued frame is accepted but discarded.
/// At capacity the oldest unread frame is evicted so readers always see the
/// freshest frames. A lock poisoned by a panicking caller is recovered, so
/// one fault never stops frames flowing.
pub struct FrameBuffer {
    capacity: usize,
    min_interval: Duration,
    inner: Mutex<BufferInner>,
}

struct BufferInner {
    frames: VecDeque<Frame>,
    last_enqueued: Option<Instant>,
}

impl FrameBuffer {
    pub fn new(capacity: usize, min_interval: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            min_interval,
            inner: Mutex::new(BufferInner {
                frames: VecDeque::with_capacity(capacity),
                last_enqueued: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer a frame. Always accepted, so this returns `true`; a frame inside
    /// the rate-limit interval is accepted and discarded.
    pub fn put(&self, frame: Frame) -> bool {
        let mut inner = self.lock();

        if let Some(last) = inner.last_enqueued {
            if frame.captured_at.saturating_duration_since(last) < self.min_interval {
                metrics::counter!("ingest_buffer_throttled_total").increment(1);
                trace!("frame arrived inside the rate-limit interval; dropped");
                return true;
            }
        }

        while inner.frames.len() >= self.capacity {
            inner.frames.pop_front();
            metrics::counter!("ingest_buffer_evicted_total").increment(1);
        }
        inner.last_enqueued = Some(frame.captured_at);
        inner.frames.push_back(frame);
        metrics::gauge!("ingest_buffer_depth").set(inner.frames.len() as f64);
        true
    }

    /// Non-blocking pop of the oldest retained frame.
    pub fn get(&self) -> Option<Frame> {
        let mut inner = self.lock();
        let frame = inner.frames.pop_front();
        metrics::gauge!("ingest_buffer_depth").set(inner.frames.len() as f64);
        frame
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every queued frame and forget the rate-limit reference.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.frames.clear();
        inner.last_enqueued = None;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY, DEFAULT_FRAME_INTERVAL)
    }
}
