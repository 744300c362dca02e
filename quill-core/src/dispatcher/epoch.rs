//! Grace periods for publisher limit refreshes.
//!
//! A refresh reads the subscription snapshot and raises the publisher limit
//! from it. Opening a subscription swaps in a new snapshot and then waits
//! out every refresh that may still be working from the old one, so the
//! limit it validates against can no longer grow past the new cursor.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Two-slot reader counter in the style of left-right.
#[derive(Debug, Default)]
pub(crate) struct RefreshEpoch {
    epoch: AtomicUsize,
    active: [CachePadded<AtomicUsize>; 2],
}

/// Marks a refresh in progress until dropped.
pub(crate) struct EpochGuard<'a> {
    slot: &'a AtomicUsize,
}

impl RefreshEpoch {
    /// Enter a refresh section. Never blocks.
    pub(crate) fn enter(&self) -> EpochGuard<'_> {
        loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            let slot = &*self.active[epoch & 1];
            slot.fetch_add(1, Ordering::SeqCst);
            // Counted in the slot a concurrent synchronize will wait on.
            if self.epoch.load(Ordering::SeqCst) == epoch {
                return EpochGuard { slot };
            }
            slot.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Wait until every section entered before this call has been left.
    ///
    /// Callers must be serialized with each other.
    pub(crate) fn synchronize(&self) {
        let previous = self.epoch.fetch_add(1, Ordering::SeqCst);
        let slot = &*self.active[previous & 1];
        let mut spins = 0u32;
        while slot.load(Ordering::SeqCst) != 0 {
            if spins < 64 {
                std::hint::spin_loop();
                spins += 1;
            } else {
                std::thread::yield_now();
            }
        }
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.slot.fetch_sub(1, Ordering::SeqCst);
    }
}
