//! Producer-side write handle.

use super::DispatcherInner;
use crate::frame::HEADER_LENGTH;

/// Exclusive reservation of buffer space.
///
/// The only ways out are [`commit`](Self::commit), which publishes the frame,
/// and [`abort`](Self::abort), which turns the region into padding.
/// Dropping an unfinished claim aborts it so subscribers never stall on it.
#[must_use = "a claim must be committed or aborted"]
pub struct ClaimedFragment<'a> {
    dispatcher: &'a DispatcherInner,
    position: u64,
    length: usize,
    completed: bool,
}

impl<'a> ClaimedFragment<'a> {
    pub(super) fn new(dispatcher: &'a DispatcherInner, position: u64, length: usize) -> Self {
        Self {
            dispatcher,
            position,
            length,
            completed: false,
        }
    }

    /// Dispatcher position of the frame.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Payload length reserved by the claim.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the claim has an empty payload.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The payload region to fill before committing.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        let offset = self.dispatcher.buffer.offset(self.position) + HEADER_LENGTH;
        // SAFETY: the region was claimed by this handle and is unpublished
        // until commit or abort, both of which consume the handle.
        unsafe { self.dispatcher.buffer.region_mut(offset, self.length) }
    }

    /// Copy `payload` into the start of the reserved region.
    ///
    /// # Panics
    ///
    /// Panics if `payload` is longer than the claim.
    pub fn write(&mut self, payload: &[u8]) {
        self.buffer_mut()[..payload.len()].copy_from_slice(payload);
    }

    /// Publish the frame and return its position.
    pub fn commit(mut self) -> u64 {
        self.completed = true;
        self.dispatcher.commit_frame(self.position, self.length);
        self.position
    }

    /// Release the region as padding; subscribers skip it.
    pub fn abort(mut self) {
        self.completed = true;
        self.dispatcher.abort_frame(self.position, self.length);
    }
}

impl Drop for ClaimedFragment<'_> {
    fn drop(&mut self) {
        if !self.completed {
            tracing::debug!(
                dispatcher = %self.dispatcher.name,
                position = self.position,
                "Claim dropped without commit, aborting"
            );
            self.dispatcher.abort_frame(self.position, self.length);
        }
    }
}

impl std::fmt::Debug for ClaimedFragment<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedFragment")
            .field("position", &self.position)
            .field("length", &self.length)
            .finish()
    }
}
