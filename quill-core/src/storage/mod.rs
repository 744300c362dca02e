//! Durable storage behind a log stream.
//!
//! The log stream only depends on the [`LogStorage`] contract. Two backends
//! are provided:
//!
//! - [`FsLogStorage`]: checksummed segment files with crash recovery
//! - [`MemoryLogStorage`]: a vector, for tests and ephemeral streams

mod config;
mod fs;
mod memory;
mod segment;

pub use config::{MIN_SEGMENT_SIZE, StorageConfig};
pub use fs::FsLogStorage;
pub use memory::MemoryLogStorage;

use crate::error::Result;
use crate::types::Position;

/// Append/read contract of a durable log.
///
/// Records receive consecutive positions starting at [`Position::FIRST`].
/// Implementations are called from one appender at a time but must be safe
/// to read from other threads.
pub trait LogStorage: Send + Sync {
    /// Durably append one frame and return its position.
    ///
    /// An error means the record must be treated as not written.
    fn append(&self, frame: &[u8]) -> Result<Position>;

    /// Read the frame at `position`; `Ok(None)` if no such record exists.
    fn read(&self, position: Position) -> Result<Option<Vec<u8>>>;

    /// Position of the newest record, [`Position::NONE`] when empty.
    fn last_position(&self) -> Result<Position>;

    /// Position of the oldest record, [`Position::NONE`] when empty.
    fn first_position(&self) -> Result<Position>;

    /// Force buffered appends to durable media.
    fn flush(&self) -> Result<()>;

    /// Flush and release handles. Appends fail until [`reopen`](Self::reopen).
    fn close(&self) -> Result<()>;

    /// Re-acquire handles after [`close`](Self::close). No-op when open.
    fn reopen(&self) -> Result<()>;

    /// Whether the storage is closed.
    fn is_closed(&self) -> bool;

    /// Close and remove all data.
    fn delete(&self) -> Result<()>;
}
