//! Segment-file log storage.

use super::LogStorage;
use super::config::StorageConfig;
use super::segment::{
    EntryLocation, encode_entry, list_segments, read_entry, scan_segment, segment_path,
};
use crate::error::{QuillError, Result};
use crate::types::Position;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// The segment currently being appended to.
struct ActiveSegment {
    file: BufWriter<File>,
    path: PathBuf,
    sequence: u64,
    size: u64,
}

struct FsInner {
    /// `None` while closed.
    active: Option<ActiveSegment>,
    /// Location of every record, `index[i]` holds `first_position + i`.
    index: Vec<EntryLocation>,
    first_position: Position,
    last_position: Position,
}

/// Durable log storage in a directory of append-only segment files.
///
/// Every record is written as a checksummed entry carrying its position.
/// On open the segments are scanned to rebuild the position index; a torn or
/// corrupt entry at the end of the newest segment (the trace of a crash
/// mid-append) is truncated, while corruption anywhere else is an error.
pub struct FsLogStorage {
    config: StorageConfig,
    inner: Mutex<FsInner>,
}

impl FsLogStorage {
    /// Open or create the storage, recovering existing segments.
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let inner = recover(&config)?;
        Ok(Self {
            config,
            inner: Mutex::new(inner),
        })
    }

    /// Storage directory.
    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Path of the segment currently appended to.
    pub fn active_segment(&self) -> Option<PathBuf> {
        self.inner.lock().active.as_ref().map(|a| a.path.clone())
    }

    /// Number of records stored.
    pub fn record_count(&self) -> usize {
        self.inner.lock().index.len()
    }

    fn rotate_locked(&self, active: &mut ActiveSegment) -> Result<()> {
        sync(&mut active.file, &active.path)?;

        let sequence = active.sequence + 1;
        let path = segment_path(&self.config.directory, sequence);
        let file = open_segment(&path)?;
        let _ = fs2::FileExt::unlock(active.file.get_ref());

        tracing::info!(
            directory = %self.config.directory.display(),
            sequence,
            "Rotated log segment"
        );

        *active = ActiveSegment {
            file: BufWriter::with_capacity(self.config.buffer_size, file),
            path,
            sequence,
            size: 0,
        };
        Ok(())
    }
}

impl FsLogStorage {
    /// Cut the segment back to `offset`, the end of the last acknowledged
    /// entry, so neither a later flush nor recovery sees a failed append.
    ///
    /// Acknowledged entries still buffered before `offset` are written out;
    /// everything after it is dropped.
    fn roll_back(&self, segment: ActiveSegment, offset: u64) -> Result<ActiveSegment> {
        let ActiveSegment {
            file,
            path,
            sequence,
            ..
        } = segment;
        let io_error = |e: std::io::Error| QuillError::Io {
            path: path.clone(),
            cause: e.to_string(),
        };

        let (mut file, buffered) = file.into_parts();
        let buffered = buffered.unwrap_or_else(|panicked| panicked.into_inner());
        let on_disk = file.metadata().map_err(io_error)?.len();
        if on_disk < offset {
            let keep = ((offset - on_disk) as usize).min(buffered.len());
            file.write_all(&buffered[..keep]).map_err(io_error)?;
        } else {
            file.set_len(offset).map_err(io_error)?;
        }

        tracing::warn!(
            segment = %path.display(),
            offset,
            "Rolled back failed append"
        );
        Ok(ActiveSegment {
            file: BufWriter::with_capacity(self.config.buffer_size, file),
            path,
            sequence,
            size: offset,
        })
    }
}

impl LogStorage for FsLogStorage {
    fn append(&self, frame: &[u8]) -> Result<Position> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let position = inner.last_position.next();
        let Some(active) = inner.active.as_mut() else {
            return Err(QuillError::StorageClosed);
        };

        let entry = encode_entry(position, frame);
        if active.size > 0 && active.size + entry.len() as u64 > self.config.max_segment_size {
            self.rotate_locked(active)
                .map_err(|e| QuillError::StorageAppend {
                    position,
                    cause: e.to_string(),
                })?;
        }

        let offset = active.size;
        let written = active
            .file
            .write_all(&entry)
            .map_err(|e| QuillError::Io {
                path: active.path.clone(),
                cause: e.to_string(),
            })
            .and_then(|()| {
                if self.config.sync_on_append {
                    sync(&mut active.file, &active.path)
                } else {
                    Ok(())
                }
            });
        if let Err(e) = written {
            if let Some(segment) = inner.active.take() {
                match self.roll_back(segment, offset) {
                    Ok(segment) => inner.active = Some(segment),
                    Err(rollback) => tracing::error!(
                        directory = %self.config.directory.display(),
                        position = %position,
                        error = %rollback,
                        "Failed to roll back append, closing log storage"
                    ),
                }
            }
            return Err(QuillError::StorageAppend {
                position,
                cause: e.to_string(),
            });
        }
        active.size += entry.len() as u64;

        inner.index.push(EntryLocation {
            sequence: active.sequence,
            offset,
            length: entry.len() as u32,
        });
        if inner.first_position.is_none() {
            inner.first_position = position;
        }
        inner.last_position = position;

        tracing::trace!(position = %position, bytes = frame.len(), "Appended record");
        Ok(position)
    }

    fn read(&self, position: Position) -> Result<Option<Vec<u8>>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if position.is_none()
            || position < inner.first_position
            || position > inner.last_position
        {
            return Ok(None);
        }
        let index = (position.as_u64() - inner.first_position.as_u64()) as usize;
        let location = inner.index[index];

        // Buffered bytes of the active segment must reach the file first.
        if let Some(active) = inner.active.as_mut() {
            if active.sequence == location.sequence {
                active.file.flush().map_err(|e| QuillError::StorageRead {
                    position,
                    cause: e.to_string(),
                })?;
            }
        }

        let path = segment_path(&self.config.directory, location.sequence);
        read_entry(&path, location, position).map(Some)
    }

    fn last_position(&self) -> Result<Position> {
        Ok(self.inner.lock().last_position)
    }

    fn first_position(&self) -> Result<Position> {
        Ok(self.inner.lock().first_position)
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.active.as_mut() {
            Some(active) => sync(&mut active.file, &active.path),
            None => Err(QuillError::StorageClosed),
        }
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(mut active) = inner.active.take() {
            sync(&mut active.file, &active.path)?;
            let _ = fs2::FileExt::unlock(active.file.get_ref());
            tracing::debug!(directory = %self.config.directory.display(), "Closed log storage");
        }
        Ok(())
    }

    fn reopen(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.active.is_none() {
            *inner = recover(&self.config)?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().active.is_none()
    }

    fn delete(&self) -> Result<()> {
        self.close()?;
        let mut inner = self.inner.lock();
        inner.index.clear();
        inner.first_position = Position::NONE;
        inner.last_position = Position::NONE;
        if self.config.directory.exists() {
            std::fs::remove_dir_all(&self.config.directory).map_err(|e| QuillError::Io {
                path: self.config.directory.clone(),
                cause: e.to_string(),
            })?;
        }
        tracing::info!(directory = %self.config.directory.display(), "Deleted log storage");
        Ok(())
    }
}

impl Drop for FsLogStorage {
    fn drop(&mut self) {
        if let Some(active) = self.inner.get_mut().active.as_mut() {
            let _ = active.file.flush();
            let _ = fs2::FileExt::unlock(active.file.get_ref());
        }
    }
}

impl std::fmt::Debug for FsLogStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsLogStorage")
            .field("directory", &self.config.directory)
            .finish_non_exhaustive()
    }
}

fn sync(file: &mut BufWriter<File>, path: &Path) -> Result<()> {
    let io_error = |e: std::io::Error| QuillError::Io {
        path: path.to_path_buf(),
        cause: e.to_string(),
    };
    file.flush().map_err(io_error)?;
    file.get_ref().sync_data().map_err(io_error)
}

fn open_segment(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| QuillError::StorageOpen {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;
    file.try_lock_exclusive()
        .map_err(|e| QuillError::StorageOpen {
            path: path.to_path_buf(),
            cause: format!("Failed to lock segment: {}", e),
        })?;
    Ok(file)
}

/// Rebuild the index from the segment files and open the newest one.
fn recover(config: &StorageConfig) -> Result<FsInner> {
    std::fs::create_dir_all(&config.directory).map_err(|e| QuillError::StorageOpen {
        path: config.directory.clone(),
        cause: e.to_string(),
    })?;

    let segments = list_segments(&config.directory)?;
    let mut index = Vec::new();
    let mut first_position = Position::NONE;
    let mut last_position = Position::NONE;
    let mut active = (0u64, 0u64);

    for (i, (sequence, path)) in segments.iter().enumerate() {
        let expected = if last_position.is_none() {
            Position::NONE
        } else {
            last_position.next()
        };
        let scan = scan_segment(path, *sequence, expected)?;
        let is_newest = i + 1 == segments.len();

        if let Some(cause) = scan.invalid_tail {
            if !is_newest {
                return Err(QuillError::StorageCorruption {
                    path: path.clone(),
                    offset: scan.valid_length,
                    cause,
                });
            }
            tracing::warn!(
                segment = %path.display(),
                offset = scan.valid_length,
                %cause,
                "Truncating invalid tail of log segment"
            );
            truncate(path, scan.valid_length)?;
        }

        for (position, location) in scan.entries {
            if first_position.is_none() {
                first_position = position;
            }
            last_position = position;
            index.push(location);
        }
        active = (*sequence, scan.valid_length);
    }

    let (sequence, size) = active;
    let path = segment_path(&config.directory, sequence);
    let file = open_segment(&path)?;

    tracing::info!(
        directory = %config.directory.display(),
        segments = segments.len(),
        first_position = %first_position,
        last_position = %last_position,
        "Recovered log storage"
    );

    Ok(FsInner {
        active: Some(ActiveSegment {
            file: BufWriter::with_capacity(config.buffer_size, file),
            path,
            sequence,
            size,
        }),
        index,
        first_position,
        last_position,
    })
}

fn truncate(path: &Path, length: u64) -> Result<()> {
    let io_error = |e: std::io::Error| QuillError::Io {
        path: path.to_path_buf(),
        cause: e.to_string(),
    };
    let file = OpenOptions::new().write(true).open(path).map_err(io_error)?;
    file.set_len(length).map_err(io_error)?;
    file.sync_all().map_err(io_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::storage::segment::ENTRY_HEADER_LENGTH;
    use tempfile::tempdir;

    fn config(dir: &Path) -> StorageConfig {
        StorageConfig::default()
            .with_directory(dir)
            .with_sync(false)
    }

    #[test]
    fn append_and_read() {
        let dir = tempdir().unwrap();
        let storage = FsLogStorage::open(config(dir.path())).unwrap();
        assert_eq!(storage.last_position().unwrap(), Position::NONE);

        let first = storage.append(&Frame::encode(1, b"FOO").unwrap()).unwrap();
        let second = storage.append(&Frame::encode(1, b"BAR").unwrap()).unwrap();
        assert_eq!(first, Position::new(1));
        assert_eq!(second, Position::new(2));

        let bytes = storage.read(second).unwrap().unwrap();
        assert_eq!(Frame::decode(&bytes).unwrap().payload(), b"BAR");
        assert!(storage.read(Position::new(3)).unwrap().is_none());
        assert!(storage.read(Position::NONE).unwrap().is_none());
        assert_eq!(storage.first_position().unwrap(), Position::FIRST);
    }

    /// Leave a half-done entry behind as a failed append would, then roll
    /// it back.
    fn fail_append(storage: &FsLogStorage, flushed: bool) {
        let mut inner = storage.inner.lock();
        let next = inner.last_position.next();
        let active = inner.active.as_mut().unwrap();
        let offset = active.size;
        let entry = encode_entry(next, &Frame::encode(1, b"lost").unwrap());
        active.file.write_all(&entry).unwrap();
        if flushed {
            active.file.flush().unwrap();
        }
        let segment = inner.active.take().unwrap();
        inner.active = Some(storage.roll_back(segment, offset).unwrap());
    }

    #[test]
    fn failed_append_is_rolled_back() {
        for flushed in [false, true] {
            let dir = tempdir().unwrap();
            {
                let storage = FsLogStorage::open(config(dir.path())).unwrap();
                storage.append(&Frame::encode(1, b"a").unwrap()).unwrap();
                storage.append(&Frame::encode(1, b"b").unwrap()).unwrap();
                fail_append(&storage, flushed);

                let third = storage.append(&Frame::encode(1, b"c").unwrap()).unwrap();
                assert_eq!(third, Position::new(3));
                storage.close().unwrap();
            }

            let storage = FsLogStorage::open(config(dir.path())).unwrap();
            assert_eq!(storage.last_position().unwrap(), Position::new(3));
            let payloads: Vec<Vec<u8>> = (1..=3)
                .map(|p| {
                    let bytes = storage.read(Position::new(p)).unwrap().unwrap();
                    Frame::decode(&bytes).unwrap().payload().to_vec()
                })
                .collect();
            assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        }
    }

    #[test]
    fn recovers_positions_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let storage = FsLogStorage::open(config(dir.path())).unwrap();
            for i in 0..5u8 {
                storage.append(&Frame::encode(1, &[i]).unwrap()).unwrap();
            }
            storage.close().unwrap();
        }

        let storage = FsLogStorage::open(config(dir.path())).unwrap();
        assert_eq!(storage.last_position().unwrap(), Position::new(5));
        assert_eq!(storage.append(b"next").unwrap(), Position::new(6));
        let bytes = storage.read(Position::new(3)).unwrap().unwrap();
        assert_eq!(Frame::decode(&bytes).unwrap().payload(), &[2]);
    }

    #[test]
    fn rotates_segments() {
        let dir = tempdir().unwrap();
        let config = config(dir.path()).with_max_segment_size(4096);
        let storage = FsLogStorage::open(config.clone()).unwrap();
        let payload = [9u8; 1000];
        for _ in 0..10 {
            storage.append(&Frame::encode(1, &payload).unwrap()).unwrap();
        }
        assert!(list_segments(dir.path()).unwrap().len() >= 3);

        for position in 1..=10 {
            let bytes = storage.read(Position::new(position)).unwrap().unwrap();
            assert_eq!(Frame::decode(&bytes).unwrap().payload(), payload);
        }
        drop(storage);

        let storage = FsLogStorage::open(config).unwrap();
        assert_eq!(storage.record_count(), 10);
        assert_eq!(storage.last_position().unwrap(), Position::new(10));
    }

    #[test]
    fn truncates_torn_tail() {
        let dir = tempdir().unwrap();
        {
            let storage = FsLogStorage::open(config(dir.path())).unwrap();
            storage.append(&Frame::encode(1, b"one").unwrap()).unwrap();
            storage.append(&Frame::encode(1, b"two").unwrap()).unwrap();
            storage.close().unwrap();
        }

        // Simulate a crash in the middle of the third append.
        let path = segment_path(dir.path(), 0);
        let entry = encode_entry(Position::new(3), &Frame::encode(1, b"three").unwrap());
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&entry[..entry.len() - 4]).unwrap();
        drop(file);

        let storage = FsLogStorage::open(config(dir.path())).unwrap();
        assert_eq!(storage.last_position().unwrap(), Position::new(2));
        let valid = 2 * (ENTRY_HEADER_LENGTH + Frame::encode(1, b"one").unwrap().len()) as u64;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), valid);

        // The position of the torn record is reused; it never became durable.
        assert_eq!(
            storage.append(&Frame::encode(1, b"three").unwrap()).unwrap(),
            Position::new(3)
        );
    }

    #[test]
    fn corruption_in_older_segment_is_an_error() {
        let dir = tempdir().unwrap();
        let config = config(dir.path()).with_max_segment_size(4096);
        {
            let storage = FsLogStorage::open(config.clone()).unwrap();
            for _ in 0..10 {
                storage.append(&Frame::encode(1, &[1u8; 1000]).unwrap()).unwrap();
            }
        }

        let path = segment_path(dir.path(), 0);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[ENTRY_HEADER_LENGTH + 20] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let err = FsLogStorage::open(config).unwrap_err();
        assert!(matches!(err, QuillError::StorageCorruption { .. }));
    }

    #[test]
    fn second_instance_cannot_lock() {
        let dir = tempdir().unwrap();
        let _storage = FsLogStorage::open(config(dir.path())).unwrap();
        let err = FsLogStorage::open(config(dir.path())).unwrap_err();
        assert!(matches!(err, QuillError::StorageOpen { .. }));
    }

    #[test]
    fn close_and_reopen() {
        let dir = tempdir().unwrap();
        let storage = FsLogStorage::open(config(dir.path())).unwrap();
        storage.append(b"a").unwrap();
        storage.close().unwrap();
        assert!(storage.is_closed());
        assert!(matches!(
            storage.append(b"b"),
            Err(QuillError::StorageClosed)
        ));

        storage.reopen().unwrap();
        assert_eq!(storage.append(b"b").unwrap(), Position::new(2));
    }

    #[test]
    fn delete_removes_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partition-1");
        let storage = FsLogStorage::open(config(&path)).unwrap();
        storage.append(b"a").unwrap();
        storage.delete().unwrap();
        assert!(!path.exists());
        assert_eq!(storage.last_position().unwrap(), Position::NONE);
    }
}
