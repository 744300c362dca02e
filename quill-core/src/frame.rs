//! Binary frame layout shared by the dispatcher and durable storage.
//!
//! ```text
//! 0        4        8          12  13  14       16
//! +--------+--------+----------+---+---+--------+---------------+--------+
//! | length |  lap   | streamId | v | f | rsvd   | payload ...   | pad    |
//! +--------+--------+----------+---+---+--------+---------------+--------+
//! ```
//!
//! All integers are little-endian. `length` is the framed length (header
//! plus payload); a negative value marks a padding region of `-length`
//! bytes. `lap` is only meaningful inside the dispatcher and is zero in
//! stored frames. Bit 0 of the flags byte marks a frame whose durable
//! append failed; it is the only byte ever rewritten after commit.

use crate::error::{QuillError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Size of the fixed frame header.
pub const HEADER_LENGTH: usize = 16;

/// Every frame starts on a multiple of this many bytes.
pub const FRAME_ALIGNMENT: usize = 8;

/// Current frame format version.
pub const FRAME_VERSION: u8 = 1;

/// Flag bit set on frames whose durable append failed.
pub const FLAG_FAILED: u8 = 0b0000_0001;

pub(crate) const LENGTH_OFFSET: usize = 0;
pub(crate) const LAP_OFFSET: usize = 4;
pub(crate) const STREAM_ID_OFFSET: usize = 8;
pub(crate) const VERSION_OFFSET: usize = 12;
pub(crate) const FLAGS_OFFSET: usize = 13;

/// Largest payload a frame can describe: the aligned frame length must fit
/// the signed 32-bit length field.
pub const MAX_PAYLOAD_LENGTH: usize =
    (i32::MAX as usize & !(FRAME_ALIGNMENT - 1)) - HEADER_LENGTH;

/// Round `length` up to the frame alignment.
///
/// `length` must not be within `FRAME_ALIGNMENT` of `usize::MAX`; use
/// [`checked_frame_length`] for untrusted payload lengths.
#[inline]
#[must_use]
pub const fn aligned_length(length: usize) -> usize {
    (length + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1)
}

/// Header plus payload, without alignment padding.
#[inline]
#[must_use]
pub const fn framed_length(payload_length: usize) -> usize {
    HEADER_LENGTH + payload_length
}

/// Aligned frame length for a payload of `payload_length` bytes.
///
/// Fails with [`QuillError::FrameTooLarge`] above [`MAX_PAYLOAD_LENGTH`],
/// before any arithmetic can overflow.
pub fn checked_frame_length(payload_length: usize) -> Result<usize> {
    if payload_length > MAX_PAYLOAD_LENGTH {
        return Err(QuillError::FrameTooLarge {
            requested: payload_length.saturating_add(HEADER_LENGTH),
            max: MAX_PAYLOAD_LENGTH + HEADER_LENGTH,
        });
    }
    Ok(aligned_length(framed_length(payload_length)))
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Routing tag chosen by the producer.
    pub stream_id: i32,
    /// Payload length in bytes.
    pub length: usize,
    /// Whether the durable append of this frame failed.
    pub failed: bool,
}

impl FrameHeader {
    /// Header plus payload.
    #[must_use]
    pub const fn framed_length(&self) -> usize {
        framed_length(self.length)
    }

    /// Bytes the frame occupies including padding.
    #[must_use]
    pub const fn aligned_length(&self) -> usize {
        aligned_length(self.framed_length())
    }
}

/// Encode a header for a payload of `length` bytes.
///
/// Fails with [`QuillError::FrameTooLarge`] if the length does not fit the
/// header's length field.
pub fn encode_header(stream_id: i32, length: usize) -> Result<[u8; HEADER_LENGTH]> {
    checked_frame_length(length)?;
    let mut header = [0u8; HEADER_LENGTH];
    LittleEndian::write_i32(
        &mut header[LENGTH_OFFSET..LAP_OFFSET],
        framed_length(length) as i32,
    );
    write_header_tail(&mut header, stream_id);
    Ok(header)
}

/// Write stream id, version and cleared flags into bytes 8..16.
pub(crate) fn write_header_tail(header: &mut [u8], stream_id: i32) {
    LittleEndian::write_i32(
        &mut header[STREAM_ID_OFFSET..VERSION_OFFSET],
        stream_id,
    );
    header[VERSION_OFFSET] = FRAME_VERSION;
    header[FLAGS_OFFSET] = 0;
    header[FLAGS_OFFSET + 1] = 0;
    header[FLAGS_OFFSET + 2] = 0;
}

/// Write the length and lap word (bytes 0..8).
pub(crate) fn write_length_and_lap(header: &mut [u8], length: i32, lap: u32) {
    LittleEndian::write_i32(&mut header[LENGTH_OFFSET..LAP_OFFSET], length);
    LittleEndian::write_u32(&mut header[LAP_OFFSET..STREAM_ID_OFFSET], lap);
}

/// Decode a frame header.
///
/// Only the header is inspected; use [`Frame::decode`] to also check that
/// the payload is present.
pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader> {
    if bytes.len() < HEADER_LENGTH {
        return Err(QuillError::FrameTruncated {
            required: HEADER_LENGTH,
            available: bytes.len(),
        });
    }

    let framed = LittleEndian::read_i32(&bytes[LENGTH_OFFSET..LAP_OFFSET]);
    if framed < HEADER_LENGTH as i32 {
        return Err(QuillError::FrameLength {
            length: i64::from(framed),
            cause: if framed < 0 {
                "padding is not a frame".to_string()
            } else {
                format!("shorter than the {} byte header", HEADER_LENGTH)
            },
        });
    }

    let version = bytes[VERSION_OFFSET];
    if version != FRAME_VERSION {
        return Err(QuillError::FrameVersion { version });
    }

    Ok(FrameHeader {
        stream_id: LittleEndian::read_i32(&bytes[STREAM_ID_OFFSET..VERSION_OFFSET]),
        length: framed as usize - HEADER_LENGTH,
        failed: bytes[FLAGS_OFFSET] & FLAG_FAILED != 0,
    })
}

/// Set the failed flag of an encoded frame in place.
///
/// Only the flag bit changes; length, stream id and payload stay untouched.
pub fn mark_failed(bytes: &mut [u8]) -> Result<()> {
    if bytes.len() < HEADER_LENGTH {
        return Err(QuillError::FrameTruncated {
            required: HEADER_LENGTH,
            available: bytes.len(),
        });
    }
    bytes[FLAGS_OFFSET] |= FLAG_FAILED;
    Ok(())
}

/// A decoded frame borrowing its payload from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    header: FrameHeader,
    payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Encode a standalone frame, padded to the frame alignment.
    pub fn encode(stream_id: i32, payload: &[u8]) -> Result<Vec<u8>> {
        let header = encode_header(stream_id, payload.len())?;
        let aligned = aligned_length(framed_length(payload.len()));
        let mut bytes = Vec::with_capacity(aligned);
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(payload);
        bytes.resize(aligned, 0);
        Ok(bytes)
    }

    /// Decode a frame from the start of `bytes`.
    ///
    /// Trailing padding is allowed and ignored.
    pub fn decode(bytes: &'a [u8]) -> Result<Self> {
        let header = decode_header(bytes)?;
        let framed = header.framed_length();
        if framed > bytes.len() {
            return Err(QuillError::FrameTruncated {
                required: framed,
                available: bytes.len(),
            });
        }
        Ok(Self {
            header,
            payload: &bytes[HEADER_LENGTH..framed],
        })
    }

    /// The decoded header.
    #[must_use]
    pub fn header(&self) -> FrameHeader {
        self.header
    }

    /// Routing tag.
    #[must_use]
    pub fn stream_id(&self) -> i32 {
        self.header.stream_id
    }

    /// Payload length.
    #[must_use]
    pub fn length(&self) -> usize {
        self.header.length
    }

    /// Bytes the frame occupies including padding.
    #[must_use]
    pub fn aligned_length(&self) -> usize {
        self.header.aligned_length()
    }

    /// Whether the failed flag is set.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.header.failed
    }

    /// Payload bytes.
    #[must_use]
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}
