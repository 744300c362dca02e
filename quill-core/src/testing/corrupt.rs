//! Frame corruption for exercising halt handling end to end.

use crate::dispatcher::Dispatcher;
use crate::frame::VERSION_OFFSET;

/// Overwrite the version byte of the committed frame at `position`, so the
/// next subscription reaching it halts with
/// [`FrameCorrupt`](crate::QuillError::FrameCorrupt).
///
/// # Safety
///
/// The frame must be committed and still retained, and no subscription may
/// be polling the dispatcher concurrently.
pub unsafe fn corrupt_frame(dispatcher: &Dispatcher, position: u64) {
    // SAFETY: forwarded to the caller.
    let header = unsafe { dispatcher.header_mut(position) };
    header[VERSION_OFFSET] = 0;
    tracing::warn!(dispatcher = dispatcher.name(), position, "Corrupted frame header");
}
