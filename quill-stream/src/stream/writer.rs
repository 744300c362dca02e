//! Producer handle for a log stream's write buffer.

use super::state::{LogStreamStatus, StreamShared};
use quill_core::dispatcher::{ClaimedFragment, Dispatcher};
use quill_core::error::{QuillError, Result};
use std::sync::Arc;
use std::time::Duration;

/// Retries that only yield before backing off with a sleep.
const YIELD_RETRIES: usize = 4;

/// Back-off between retries after the yielding ones.
const RETRY_BACKOFF: Duration = Duration::from_millis(1);

/// Writes frames with a fixed stream id into a log stream.
///
/// Cheap to clone; every producer thread may own one. A write returns once
/// the frame is committed to the write buffer, not once it is durable: use
/// [`LogStream::wait_for_position`](crate::LogStream::wait_for_position) or
/// an append condition for that.
#[derive(Clone)]
pub struct LogStreamWriter {
    dispatcher: Dispatcher,
    shared: Arc<StreamShared>,
    stream_id: i32,
}

impl LogStreamWriter {
    pub(crate) fn new(dispatcher: Dispatcher, shared: Arc<StreamShared>, stream_id: i32) -> Self {
        Self {
            dispatcher,
            shared,
            stream_id,
        }
    }

    /// Stream id written into every frame.
    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Claim space for a payload of `length` bytes to fill in place.
    pub fn claim(&self, length: usize) -> Result<ClaimedFragment<'_>> {
        self.dispatcher
            .claim(length, self.stream_id)
            .map_err(|e| self.closed_error(e))
    }

    /// Copy `payload` into one frame and commit it.
    ///
    /// Returns the frame's write buffer position. Fails with
    /// [`QuillError::Blocked`] when the buffer is full.
    pub fn write(&self, payload: &[u8]) -> Result<u64> {
        self.dispatcher
            .offer(self.stream_id, payload)
            .map_err(|e| self.closed_error(e))
    }

    /// Like [`write`](Self::write), retrying up to `attempts` times while the
    /// buffer is full.
    pub async fn write_with_retry(&self, payload: &[u8], attempts: usize) -> Result<u64> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.write(payload) {
                Err(e) if e.is_retriable() && attempt < attempts => {
                    if attempt <= YIELD_RETRIES {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Report a closed buffer as the stream status that closed it.
    fn closed_error(&self, error: QuillError) -> QuillError {
        if !matches!(error, QuillError::DispatcherClosed { .. }) {
            return error;
        }
        match self.shared.status() {
            LogStreamStatus::Failed => QuillError::StreamFailed {
                stream: self.shared.name.clone(),
            },
            status => QuillError::StreamNotOpen {
                stream: self.shared.name.clone(),
                status: status.to_string(),
            },
        }
    }
}

impl std::fmt::Debug for LogStreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStreamWriter")
            .field("stream", &self.shared.name)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}
