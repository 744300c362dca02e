//! In-process log storage.

use super::LogStorage;
use crate::error::{QuillError, Result};
use crate::types::Position;
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct MemoryInner {
    records: Vec<Vec<u8>>,
    closed: bool,
}

/// Log storage backed by a vector. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryLogStorage {
    inner: RwLock<MemoryInner>,
}

impl MemoryLogStorage {
    /// Create an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records stored.
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// Whether nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogStorage for MemoryLogStorage {
    fn append(&self, frame: &[u8]) -> Result<Position> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(QuillError::StorageClosed);
        }
        inner.records.push(frame.to_vec());
        Ok(Position::new(inner.records.len() as u64))
    }

    fn read(&self, position: Position) -> Result<Option<Vec<u8>>> {
        if position.is_none() {
            return Ok(None);
        }
        let inner = self.inner.read();
        Ok(inner.records.get(position.as_u64() as usize - 1).cloned())
    }

    fn last_position(&self) -> Result<Position> {
        Ok(Position::new(self.inner.read().records.len() as u64))
    }

    fn first_position(&self) -> Result<Position> {
        let inner = self.inner.read();
        Ok(if inner.records.is_empty() {
            Position::NONE
        } else {
            Position::FIRST
        })
    }

    fn flush(&self) -> Result<()> {
        if self.inner.read().closed {
            return Err(QuillError::StorageClosed);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.inner.write().closed = true;
        Ok(())
    }

    fn reopen(&self) -> Result<()> {
        self.inner.write().closed = false;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    fn delete(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.records.clear();
        inner.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_start_at_one() {
        let storage = MemoryLogStorage::new();
        assert_eq!(storage.first_position().unwrap(), Position::NONE);
        assert_eq!(storage.append(b"a").unwrap(), Position::new(1));
        assert_eq!(storage.append(b"b").unwrap(), Position::new(2));
        assert_eq!(storage.read(Position::new(2)).unwrap().unwrap(), b"b");
        assert!(storage.read(Position::new(3)).unwrap().is_none());
        assert_eq!(storage.first_position().unwrap(), Position::FIRST);
    }

    #[test]
    fn closed_storage_rejects_appends() {
        let storage = MemoryLogStorage::new();
        storage.append(b"a").unwrap();
        storage.close().unwrap();
        assert!(matches!(storage.append(b"b"), Err(QuillError::StorageClosed)));

        storage.reopen().unwrap();
        assert_eq!(storage.append(b"b").unwrap(), Position::new(2));
    }
}
