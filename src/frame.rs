//! Frame container and the bounded ingest queue.
//!
//! The queue decouples the capture context (camera callback, native frame
//! rate) from the processing context (scheduler loop). It holds at most
//! [`FRAME_QUEUE_CAPACITY`] entries; inserting beyond capacity evicts the
//! single oldest entry. Overflow is normal backpressure handling, not an
//! error: when frames arrive faster than they are consumed, freshness wins
//! over completeness.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Build-time ingest queue capacity.
pub const FRAME_QUEUE_CAPACITY: usize = 3;

/// One captured camera frame: contiguous RGBA bytes plus capture metadata.
///
/// Immutable once queued. `enqueue` copies the pixel data, so the producer
/// may reuse its buffer immediately after the call returns.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture timestamp, unix milliseconds.
    pub ts_ms: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, ts_ms: u64) -> Self {
        Self {
            data,
            width,
            height,
            ts_ms,
        }
    }

    /// Expected byte length for a well-formed RGBA frame.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Frame plus the moment it entered the queue.
#[derive(Clone, Debug)]
pub struct FrameQueueEntry {
    pub frame: Frame,
    /// Enqueue timestamp, unix milliseconds.
    pub enqueued_ms: u64,
}

/// Fixed-capacity, drop-oldest frame buffer.
///
/// `enqueue` runs on the capture context, `drain_all` on the processing
/// context; the internal mutex is held only for the O(1) queue operation
/// so the producer never blocks for long.
pub struct FrameIngestQueue {
    entries: Mutex<VecDeque<FrameQueueEntry>>,
    capacity: usize,
}

impl FrameIngestQueue {
    pub fn new() -> Self {
        Self::with_capacity(FRAME_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Copy `data` and append a frame. Evicts the oldest entry first when
    /// the queue is full. Never blocks the producer, never fails.
    pub fn enqueue(&self, data: &[u8], width: u32, height: u32) {
        let frame = Frame::new(data.to_vec(), width, height, unix_ms());
        self.enqueue_frame(frame);
    }

    /// Append an already-built frame under the same eviction policy.
    pub fn enqueue_frame(&self, frame: Frame) {
        let enqueued_ms = unix_ms();
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(FrameQueueEntry { frame, enqueued_ms });
    }

    /// Atomically remove and return all queued entries in FIFO order.
    /// Called once per scheduler tick.
    pub fn drain_all(&self) -> Vec<FrameQueueEntry> {
        match self.entries.lock() {
            Ok(mut entries) => entries.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FrameIngestQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
