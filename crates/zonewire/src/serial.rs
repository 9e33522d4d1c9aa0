//! Globally-ordered event queues.
//!
//! The serial queue carries events whose correctness depends on cross-thread
//! ordering: memory alloc/free, paired frame marks, GPU events. Producers
//! hold its mutex only long enough to push one record; the worker swaps the
//! backing vector out under the lock and encodes without holding it.
//!
//! The frame-image queue follows the same double-buffer discipline, with a
//! soft bound: past [`FRAME_IMAGE_SOFT_LIMIT`] pending images the oldest is
//! dropped and a diagnostic is logged, since a stalled worker must not let
//! image submissions grow without bound.

use parking_lot::Mutex;

use crate::record::QueueEvent;

/// Single globally-ordered FIFO for cross-thread-ordered events.
pub(crate) struct SerialQueue {
    queue: Mutex<Vec<QueueEvent>>,
}

impl SerialQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
        }
    }

    /// Push one record. The lock is held only for the push and must never be
    /// held across blocking I/O.
    #[inline]
    pub(crate) fn push(&self, event: QueueEvent) {
        self.queue.lock().push(event);
    }

    /// Push a pair of records under one lock acquisition, preserving their
    /// adjacency in the global order (memory event + its callstack).
    #[inline]
    pub(crate) fn push_pair(&self, first: QueueEvent, second: QueueEvent) {
        let mut queue = self.queue.lock();
        queue.push(first);
        queue.push(second);
    }

    /// Swap out everything pushed so far. Consumer side; the returned buffer
    /// is encoded without the lock held.
    pub(crate) fn drain_into(&self, scratch: &mut Vec<QueueEvent>) {
        scratch.clear();
        std::mem::swap(&mut *self.queue.lock(), scratch);
    }
}

/// Pending frame images beyond this count drop the oldest submission.
pub(crate) const FRAME_IMAGE_SOFT_LIMIT: usize = 256;

/// One submitted frame image, pixels copied at submit time.
pub(crate) struct FrameImage {
    /// Raw RGBA pixels, `width * height * 4` bytes.
    pub pixels: Box<[u8]>,
    /// Frame the image belongs to (frame counter minus submitter offset).
    pub frame: u64,
    pub width: u16,
    pub height: u16,
    /// Whether the viewer should flip the image vertically.
    pub flip: bool,
}

/// Copy-on-submit queue of raw frames awaiting compression.
pub(crate) struct FrameImageQueue {
    queue: Mutex<Vec<FrameImage>>,
}

impl FrameImageQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, image: FrameImage) {
        let mut queue = self.queue.lock();
        if queue.len() >= FRAME_IMAGE_SOFT_LIMIT {
            let dropped = queue.remove(0);
            tracing::warn!(
                frame = dropped.frame,
                pending = queue.len(),
                "frame image queue over soft limit, dropping oldest"
            );
        }
        queue.push(image);
    }

    pub(crate) fn drain_into(&self, scratch: &mut Vec<FrameImage>) {
        scratch.clear();
        std::mem::swap(&mut *self.queue.lock(), scratch);
    }
}
