//! Appender counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of one log stream, updated by its appender.
#[derive(Debug, Default)]
pub struct LogStreamMetrics {
    /// Appender turns that consumed at least one frame.
    pub turns: AtomicU64,
    /// Frames that became durable.
    pub frames_appended: AtomicU64,
    /// Frames whose append failed.
    pub frames_failed: AtomicU64,
    /// Frames discarded after a failure.
    pub frames_discarded: AtomicU64,
}

impl LogStreamMetrics {
    pub(crate) fn record_turn(&self, appended: usize, discarded: usize, failed: bool) {
        self.turns.fetch_add(1, Ordering::Relaxed);
        self.frames_appended
            .fetch_add(appended as u64, Ordering::Relaxed);
        self.frames_discarded
            .fetch_add(discarded as u64, Ordering::Relaxed);
        if failed {
            self.frames_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Frames that became durable.
    pub fn appended(&self) -> u64 {
        self.frames_appended.load(Ordering::Relaxed)
    }

    /// Frames flagged failed, whether by their own append or a discard.
    pub fn failed(&self) -> u64 {
        self.frames_failed.load(Ordering::Relaxed) + self.frames_discarded.load(Ordering::Relaxed)
    }
}
