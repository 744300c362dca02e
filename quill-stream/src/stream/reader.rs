//! Reader over the durable records of a log stream.

use super::state::StreamShared;
use quill_core::error::Result;
use quill_core::frame::Frame;
use quill_core::storage::LogStorage;
use quill_core::types::Position;
use std::sync::Arc;

/// A durable record read back from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRecord {
    /// Log position.
    pub position: Position,
    /// Routing tag the producer used.
    pub stream_id: i32,
    /// Failed flag as stored. Durable records normally have it cleared.
    pub failed: bool,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// Iterates durable records in position order.
///
/// Never reads past the appender position, so every record returned is
/// durable. Iteration ends at the current end of the log; after more
/// appends the same reader continues from where it stopped. A record that
/// fails to decode is returned as an error and halts the reader.
pub struct LogStreamReader {
    storage: Arc<dyn LogStorage>,
    shared: Arc<StreamShared>,
    next: Position,
    halted: bool,
}

impl LogStreamReader {
    pub(crate) fn new(storage: Arc<dyn LogStorage>, shared: Arc<StreamShared>) -> Self {
        Self {
            storage,
            shared,
            next: Position::FIRST,
            halted: false,
        }
    }

    /// Position of the record the next call to `next` returns.
    pub fn position(&self) -> Position {
        self.next
    }

    /// Whether a decode error stopped the reader.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Position the reader at `position`.
    ///
    /// Returns whether a durable record exists there. Positions before the
    /// first record are moved up to it.
    pub fn seek(&mut self, position: Position) -> Result<bool> {
        let first = self.storage.first_position()?;
        self.next = position.max(first).max(Position::FIRST);
        self.halted = false;
        Ok(!first.is_none() && self.next <= self.shared.appender_position())
    }

    /// Position the reader at the oldest record.
    pub fn seek_to_first(&mut self) -> Result<()> {
        self.seek(Position::NONE).map(|_| ())
    }

    /// Position the reader at the newest durable record.
    pub fn seek_to_last(&mut self) -> Result<()> {
        self.seek(self.shared.appender_position()).map(|_| ())
    }

    fn read_next(&mut self) -> Result<Option<LoggedRecord>> {
        let position = self.next;
        if position > self.shared.appender_position() {
            return Ok(None);
        }
        let Some(bytes) = self.storage.read(position)? else {
            return Ok(None);
        };

        let frame = Frame::decode(&bytes)?;
        self.next = position.next();
        Ok(Some(LoggedRecord {
            position,
            stream_id: frame.stream_id(),
            failed: frame.is_failed(),
            payload: frame.payload().to_vec(),
        }))
    }
}

impl Iterator for LogStreamReader {
    type Item = Result<LoggedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.halted {
            return None;
        }
        match self.read_next() {
            Ok(record) => record.map(Ok),
            Err(e) => {
                tracing::error!(
                    stream = %self.shared.name,
                    position = %self.next,
                    error = %e,
                    "Log stream reader halted"
                );
                self.halted = true;
                Some(Err(e))
            }
        }
    }
}

impl std::fmt::Debug for LogStreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStreamReader")
            .field("stream", &self.shared.name)
            .field("next", &self.next)
            .field("halted", &self.halted)
            .finish()
    }
}
