//! Frame acquisition bridge: a latest-only slot between the streaming output
//! and the capture driver.
//!
//! Only one undelivered frame is ever retained. A newer delivery drops (and so
//! releases) the older one, which keeps the bounded buffer pool from starving.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::traits::{FrameListener, RawFrame};

/// Single-slot handoff of the most recent frame.
#[derive(Default)]
pub struct FrameBridge {
    pending: Mutex<Option<RawFrame>>,
    delivered: AtomicU64,
    discarded: AtomicU64,
}

impl FrameBridge {
    /// Create an empty bridge.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the pending frame, leaving the slot empty.
    pub fn take_pending(&self) -> Option<RawFrame> {
        self.pending.lock().take()
    }

    /// Drop any pending frame. Returns whether one was held.
    pub fn clear(&self) -> bool {
        let stale = self.pending.lock().take();
        if stale.is_some() {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
        stale.is_some()
    }

    /// Frames delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Frames replaced before anyone took them, plus those cleared explicitly.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Count a frame the consumer received but threw away.
    pub(crate) fn note_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }
}

impl FrameListener for FrameBridge {
    fn on_frame(&self, frame: RawFrame) {
        let sequence = frame.sequence;
        self.delivered.fetch_add(1, Ordering::Relaxed);

        // Swap under the lock, drop outside it: the release hook may call back
        // into the producer.
        let previous = self.pending.lock().replace(frame);
        if let Some(previous) = previous {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                dropped = previous.sequence,
                kept = sequence,
                "replacing undelivered frame"
            );
        }
    }
}
