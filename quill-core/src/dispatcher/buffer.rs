//! Memory-mapped byte ring with a lap-tagged publication table.

use crate::error::{QuillError, Result};
use crate::frame::{FLAGS_OFFSET, FRAME_ALIGNMENT};
use memmap2::{MmapMut, MmapOptions};
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

/// Fixed-capacity byte ring.
///
/// Positions are monotonically increasing byte offsets; the physical
/// offset is `position & (capacity - 1)`. A frame starting at `position` is
/// visible once its slot in the publication table holds the lap of that
/// position. The table only ever stores lap tags, so bytes left over from
/// an earlier lap can never pass as a published frame.
pub(crate) struct RingBuffer {
    _mmap: MmapMut,
    base: *mut u8,
    capacity: usize,
    mask: u64,
    lap_shift: u32,
    published: Box<[AtomicU32]>,
}

// SAFETY: `base` points into `_mmap`, which lives as long as the buffer.
// Concurrent access follows the claim/publish protocol: a region is written
// only by the producer that claimed it, read only after its publication tag
// was observed with acquire ordering, and reclaimed only after every
// subscription moved past it. The flags byte, the one location touched after
// publication, is only accessed atomically.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Map an anonymous region of `capacity` bytes. `capacity` must be a
    /// validated power of two.
    pub(crate) fn allocate(capacity: usize) -> Result<Self> {
        let mut mmap = MmapOptions::new()
            .len(capacity)
            .map_anon()
            .map_err(|e| QuillError::DispatcherAllocate {
                capacity,
                cause: e.to_string(),
            })?;
        let base = mmap.as_mut_ptr();
        let published = (0..capacity / FRAME_ALIGNMENT)
            .map(|_| AtomicU32::new(0))
            .collect();

        Ok(Self {
            _mmap: mmap,
            base,
            capacity,
            mask: capacity as u64 - 1,
            lap_shift: capacity.trailing_zeros(),
            published,
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Physical offset of a position.
    #[inline]
    pub(crate) fn offset(&self, position: u64) -> usize {
        (position & self.mask) as usize
    }

    /// Lap tag of a position. Starts at 1 so the zeroed table never matches.
    #[inline]
    pub(crate) fn lap(&self, position: u64) -> u32 {
        ((position >> self.lap_shift) as u32).wrapping_add(1)
    }

    /// Make the frame at `position` visible to subscribers.
    #[inline]
    pub(crate) fn publish(&self, position: u64) {
        let slot = self.offset(position) / FRAME_ALIGNMENT;
        self.published[slot].store(self.lap(position), Ordering::Release);
    }

    /// Check whether the frame at `position` has been published in this lap.
    #[inline]
    pub(crate) fn is_published(&self, position: u64) -> bool {
        let slot = self.offset(position) / FRAME_ALIGNMENT;
        self.published[slot].load(Ordering::Acquire) == self.lap(position)
    }

    /// Mutable view of a region.
    ///
    /// # Safety
    ///
    /// The caller must exclusively own `offset..offset + len`: it was claimed
    /// by the caller and has not been published yet.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn region_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.capacity);
        // SAFETY: in bounds, and exclusive per the caller's contract.
        unsafe { std::slice::from_raw_parts_mut(self.base.add(offset), len) }
    }

    /// Shared view of a region.
    ///
    /// # Safety
    ///
    /// The region must belong to a published frame that cannot be reclaimed
    /// while the view is alive, and must not cover a flags byte.
    pub(crate) unsafe fn region(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.capacity);
        // SAFETY: in bounds, and immutable per the caller's contract.
        unsafe { std::slice::from_raw_parts(self.base.add(offset), len) }
    }

    /// The flags byte of the frame starting at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be the start of a published frame that cannot be
    /// reclaimed while the reference is alive.
    pub(crate) unsafe fn flags(&self, offset: usize) -> &AtomicU8 {
        debug_assert!(offset + FLAGS_OFFSET < self.capacity);
        // SAFETY: in bounds and aligned (u8); after publication this byte is
        // only accessed through atomics.
        unsafe { AtomicU8::from_ptr(self.base.add(offset + FLAGS_OFFSET)) }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_and_laps() {
        let buffer = RingBuffer::allocate(4096).unwrap();
        assert_eq!(buffer.offset(0), 0);
        assert_eq!(buffer.offset(4096 + 24), 24);
        assert_eq!(buffer.lap(0), 1);
        assert_eq!(buffer.lap(4095), 1);
        assert_eq!(buffer.lap(4096), 2);
    }

    #[test]
    fn publication_is_per_lap() {
        let buffer = RingBuffer::allocate(4096).unwrap();
        assert!(!buffer.is_published(64));

        buffer.publish(64);
        assert!(buffer.is_published(64));
        // Same slot, next lap: still unpublished.
        assert!(!buffer.is_published(4096 + 64));

        buffer.publish(4096 + 64);
        assert!(buffer.is_published(4096 + 64));
        assert!(!buffer.is_published(64));
    }
}
