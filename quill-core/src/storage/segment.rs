//! Segment file naming, entry encoding and recovery scanning.
//!
//! Entry layout (little-endian):
//!
//! ```text
//! [u32 entry length][u32 crc32][u64 position][frame bytes]
//! ```
//!
//! The entry length covers the whole entry. The checksum covers the
//! position and the frame bytes.

use crate::error::{QuillError, Result};
use crate::types::Position;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Size of the per-entry header.
pub(crate) const ENTRY_HEADER_LENGTH: usize = 16;

const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_SUFFIX: &str = ".log";

/// Path of the segment with the given sequence number.
pub(crate) fn segment_path(directory: &Path, sequence: u64) -> PathBuf {
    directory.join(format!("{}{:016x}{}", SEGMENT_PREFIX, sequence, SEGMENT_SUFFIX))
}

/// All segment files in `directory`, oldest first.
pub(crate) fn list_segments(directory: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let entries = std::fs::read_dir(directory).map_err(|e| QuillError::Io {
        path: directory.to_path_buf(),
        cause: e.to_string(),
    })?;

    let mut segments = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(sequence) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|s| s.strip_suffix(SEGMENT_SUFFIX))
            .and_then(|s| u64::from_str_radix(s, 16).ok())
        {
            segments.push((sequence, entry.path()));
        }
    }
    segments.sort_by_key(|(sequence, _)| *sequence);
    Ok(segments)
}

/// Encode one entry.
pub(crate) fn encode_entry(position: Position, frame: &[u8]) -> Vec<u8> {
    let length = ENTRY_HEADER_LENGTH + frame.len();
    let mut entry = Vec::with_capacity(length);
    // Writes into a Vec cannot fail.
    let _ = entry.write_u32::<LittleEndian>(length as u32);
    let _ = entry.write_u32::<LittleEndian>(0);
    let _ = entry.write_u64::<LittleEndian>(position.as_u64());
    entry.extend_from_slice(frame);
    let crc = crc32fast::hash(&entry[8..]);
    entry[4..8].copy_from_slice(&crc.to_le_bytes());
    entry
}

/// Validate a complete entry and return its position.
pub(crate) fn decode_entry(entry: &[u8]) -> std::result::Result<Position, String> {
    if entry.len() < ENTRY_HEADER_LENGTH {
        return Err(format!("entry of {} bytes is shorter than its header", entry.len()));
    }
    let stored_crc = u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]);
    let computed_crc = crc32fast::hash(&entry[8..]);
    if stored_crc != computed_crc {
        return Err(format!(
            "CRC mismatch: expected {}, got {}",
            stored_crc, computed_crc
        ));
    }
    let mut position = [0u8; 8];
    position.copy_from_slice(&entry[8..16]);
    Ok(Position::new(u64::from_le_bytes(position)))
}

/// Location of an entry on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryLocation {
    pub(crate) sequence: u64,
    pub(crate) offset: u64,
    pub(crate) length: u32,
}

/// Result of scanning one segment.
#[derive(Debug)]
pub(crate) struct SegmentScan {
    pub(crate) entries: Vec<(Position, EntryLocation)>,
    /// Bytes up to the end of the last valid entry.
    pub(crate) valid_length: u64,
    /// Why scanning stopped before the end of the file, if it did.
    pub(crate) invalid_tail: Option<String>,
}

/// Scan a segment, validating every entry.
///
/// `expected` is the position the first entry must carry, or
/// [`Position::NONE`] to accept whatever the first entry of the log holds.
pub(crate) fn scan_segment(path: &Path, sequence: u64, mut expected: Position) -> Result<SegmentScan> {
    let io_error = |e: std::io::Error| QuillError::Io {
        path: path.to_path_buf(),
        cause: e.to_string(),
    };
    let file = File::open(path).map_err(io_error)?;
    let file_length = file.metadata().map_err(io_error)?.len();
    let mut reader = BufReader::new(file);

    let mut scan = SegmentScan {
        entries: Vec::new(),
        valid_length: 0,
        invalid_tail: None,
    };

    while scan.valid_length < file_length {
        let offset = scan.valid_length;
        let length = match reader.read_u32::<LittleEndian>() {
            Ok(length) => length as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                scan.invalid_tail = Some("torn entry length".to_string());
                break;
            }
            Err(e) => return Err(io_error(e)),
        };

        if length < ENTRY_HEADER_LENGTH || offset + length as u64 > file_length {
            scan.invalid_tail = Some(format!("invalid entry length {} at offset {}", length, offset));
            break;
        }

        let mut entry = vec![0u8; length];
        entry[0..4].copy_from_slice(&(length as u32).to_le_bytes());
        reader.read_exact(&mut entry[4..]).map_err(io_error)?;

        let position = match decode_entry(&entry) {
            Ok(position) => position,
            Err(cause) => {
                scan.invalid_tail = Some(format!("{} at offset {}", cause, offset));
                break;
            }
        };

        if !expected.is_none() && position != expected {
            scan.invalid_tail = Some(format!(
                "position {} at offset {}, expected {}",
                position, offset, expected
            ));
            break;
        }

        scan.entries.push((
            position,
            EntryLocation {
                sequence,
                offset,
                length: length as u32,
            },
        ));
        scan.valid_length += length as u64;
        expected = position.next();
    }

    Ok(scan)
}

/// Read the frame bytes of the entry at `location`.
pub(crate) fn read_entry(path: &Path, location: EntryLocation, position: Position) -> Result<Vec<u8>> {
    let read_error = |cause: String| QuillError::StorageRead { position, cause };

    let mut file = File::open(path).map_err(|e| read_error(format!("{}: {}", path.display(), e)))?;
    file.seek(SeekFrom::Start(location.offset))
        .map_err(|e| read_error(e.to_string()))?;

    let mut entry = vec![0u8; location.length as usize];
    file.read_exact(&mut entry)
        .map_err(|e| read_error(e.to_string()))?;

    match decode_entry(&entry) {
        Ok(stored) if stored == position => {
            entry.drain(..ENTRY_HEADER_LENGTH);
            Ok(entry)
        }
        Ok(stored) => Err(read_error(format!("entry holds position {}", stored))),
        Err(cause) => Err(QuillError::StorageCorruption {
            path: path.to_path_buf(),
            offset: location.offset,
            cause,
        }),
    }
}
