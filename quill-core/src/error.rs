//! Error types for quill.
//!
//! Every error carries the identifiers needed to locate the failure
//! (position, subscription name, path, partition) and a stable numbered
//! code so operators can grep for it.

use crate::types::{PartitionId, Position, Term};
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for quill operations.
#[derive(Error, Debug)]
pub enum QuillError {
    // =========================================================================
    // Frame Errors (E100-E199)
    // =========================================================================
    /// Input is shorter than the structure being decoded.
    #[error("E101: Frame truncated: need {required} bytes, have {available}")]
    FrameTruncated {
        /// Number of bytes required.
        required: usize,
        /// Number of bytes available.
        available: usize,
    },

    /// Frame carries a format version this build does not understand.
    #[error("E102: Unsupported frame version {version}")]
    FrameVersion {
        /// The version byte found in the header.
        version: u8,
    },

    /// Frame length field is out of range.
    #[error("E103: Invalid frame length {length}: {cause}")]
    FrameLength {
        /// The raw length field.
        length: i64,
        /// Why the length was rejected.
        cause: String,
    },

    /// A subscription met a header it cannot interpret.
    #[error("E104: Corrupt frame at dispatcher position {position} on '{subscription}': {cause}")]
    FrameCorrupt {
        /// The subscription that was reading.
        subscription: String,
        /// The dispatcher position of the frame.
        position: u64,
        /// Description of the corruption.
        cause: String,
    },

    // =========================================================================
    // Dispatcher Errors (E200-E299)
    // =========================================================================
    /// Not enough free capacity for the claim; retry after subscribers advance.
    #[error("E201: Dispatcher blocked: requested {requested} bytes, available {available} bytes")]
    Blocked {
        /// Bytes needed in the buffer, alignment included.
        requested: usize,
        /// Bytes free before the publisher limit.
        available: usize,
    },

    /// Claim exceeds the maximum frame length and can never succeed.
    #[error("E202: Frame of {requested} bytes exceeds maximum frame length {max}")]
    FrameTooLarge {
        /// Bytes needed in the buffer, alignment included.
        requested: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Dispatcher no longer accepts claims.
    #[error("E203: Dispatcher '{dispatcher}' is closed")]
    DispatcherClosed {
        /// The dispatcher name.
        dispatcher: String,
    },

    /// Subscription stopped after a decode error.
    #[error("E204: Subscription '{subscription}' halted at position {position}")]
    SubscriptionHalted {
        /// The subscription name.
        subscription: String,
        /// Position where the subscription stopped.
        position: u64,
    },

    /// A subscription with this name is already open.
    #[error("E205: Subscription '{subscription}' already exists")]
    SubscriptionExists {
        /// The duplicate name.
        subscription: String,
    },

    /// Requested subscription start position is not readable.
    #[error("E206: Cannot open subscription '{subscription}' at position {position}: {cause}")]
    SubscriptionPosition {
        /// The subscription name.
        subscription: String,
        /// The requested position.
        position: u64,
        /// Why the position was rejected.
        cause: String,
    },

    /// Failed to allocate the dispatcher buffer.
    #[error("E207: Failed to allocate dispatcher buffer of {capacity} bytes: {cause}")]
    DispatcherAllocate {
        /// Requested capacity.
        capacity: usize,
        /// Reason for the failure.
        cause: String,
    },

    // =========================================================================
    // Storage Errors (E300-E399)
    // =========================================================================
    /// Durable append failed.
    #[error("E301: Storage append failed at position {position}: {cause}")]
    StorageAppend {
        /// The position the record would have received.
        position: Position,
        /// Reason for the failure.
        cause: String,
    },

    /// Durable read failed.
    #[error("E302: Storage read failed at position {position}: {cause}")]
    StorageRead {
        /// The position being read.
        position: Position,
        /// Reason for the failure.
        cause: String,
    },

    /// Storage could not be opened.
    #[error("E303: Failed to open storage at {path}: {cause}")]
    StorageOpen {
        /// The storage directory.
        path: PathBuf,
        /// Reason for the failure.
        cause: String,
    },

    /// Corrupt entry found outside the recoverable tail.
    #[error("E304: Storage corruption in {path} at offset {offset}: {cause}")]
    StorageCorruption {
        /// The segment file.
        path: PathBuf,
        /// Byte offset of the bad entry.
        offset: u64,
        /// Description of the corruption.
        cause: String,
    },

    /// Storage was closed.
    #[error("E305: Storage is closed")]
    StorageClosed,

    /// Storage assigned a position other than the next expected one.
    #[error("E306: Storage returned position {actual}, expected {expected}")]
    PositionMismatch {
        /// The position the appender expected.
        expected: Position,
        /// The position storage reported.
        actual: Position,
    },

    // =========================================================================
    // Log Stream Errors (E400-E499)
    // =========================================================================
    /// Requested lifecycle transition is not allowed from the current status.
    #[error("E401: Log stream '{stream}' cannot move from {from} to {to}")]
    InvalidStateTransition {
        /// The log stream name.
        stream: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Operation requires an open log stream.
    #[error("E402: Log stream '{stream}' is not open (status {status})")]
    StreamNotOpen {
        /// The log stream name.
        stream: String,
        /// Current status.
        status: String,
    },

    /// Log stream failed and accepts no further writes.
    #[error("E403: Log stream '{stream}' has failed")]
    StreamFailed {
        /// The log stream name.
        stream: String,
    },

    /// Term may only move forward.
    #[error("E404: Term regression: current {current}, requested {requested}")]
    TermRegression {
        /// Stored term.
        current: Term,
        /// Rejected term.
        requested: Term,
    },

    /// Commit position may only move forward.
    #[error("E405: Commit position regression: current {current}, requested {requested}")]
    CommitPositionRegression {
        /// Stored commit position.
        current: Position,
        /// Rejected commit position.
        requested: Position,
    },

    /// A log stream is already installed for the partition.
    #[error("E406: Log stream for {partition} already installed")]
    PartitionExists {
        /// The partition.
        partition: PartitionId,
    },

    /// No log stream is installed for the partition.
    #[error("E407: No log stream installed for {partition}")]
    PartitionNotFound {
        /// The partition.
        partition: PartitionId,
    },

    /// The appender worker is gone.
    #[error("E408: Appender of log stream '{stream}' is not running")]
    AppenderStopped {
        /// The log stream name.
        stream: String,
    },

    // =========================================================================
    // Configuration Errors (E500-E599)
    // =========================================================================
    /// Invalid configuration value.
    #[error("E501: Invalid value for '{field}': {cause}")]
    ConfigValue {
        /// The configuration field with invalid value.
        field: String,
        /// Description of why the value is invalid.
        cause: String,
    },

    // =========================================================================
    // I/O Errors (E900-E999)
    // =========================================================================
    /// Generic I/O error.
    #[error("E901: I/O error at {path}: {cause}")]
    Io {
        /// The path where the I/O error occurred.
        path: PathBuf,
        /// Description of the I/O error.
        cause: String,
    },
}

impl QuillError {
    /// Get the error code (e.g., "E201").
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::FrameTruncated { .. } => "E101",
            Self::FrameVersion { .. } => "E102",
            Self::FrameLength { .. } => "E103",
            Self::FrameCorrupt { .. } => "E104",
            Self::Blocked { .. } => "E201",
            Self::FrameTooLarge { .. } => "E202",
            Self::DispatcherClosed { .. } => "E203",
            Self::SubscriptionHalted { .. } => "E204",
            Self::SubscriptionExists { .. } => "E205",
            Self::SubscriptionPosition { .. } => "E206",
            Self::DispatcherAllocate { .. } => "E207",
            Self::StorageAppend { .. } => "E301",
            Self::StorageRead { .. } => "E302",
            Self::StorageOpen { .. } => "E303",
            Self::StorageCorruption { .. } => "E304",
            Self::StorageClosed => "E305",
            Self::PositionMismatch { .. } => "E306",
            Self::InvalidStateTransition { .. } => "E401",
            Self::StreamNotOpen { .. } => "E402",
            Self::StreamFailed { .. } => "E403",
            Self::TermRegression { .. } => "E404",
            Self::CommitPositionRegression { .. } => "E405",
            Self::PartitionExists { .. } => "E406",
            Self::PartitionNotFound { .. } => "E407",
            Self::AppenderStopped { .. } => "E408",
            Self::ConfigValue { .. } => "E501",
            Self::Io { .. } => "E901",
        }
    }

    /// Check if the caller may simply retry the operation.
    ///
    /// Only backpressure qualifies; everything else needs a decision.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }

    /// Check if this error makes the owning log stream fail.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StorageAppend { .. } | Self::PositionMismatch { .. } | Self::StorageClosed
        )
    }

    /// Check if this error is a frame decoding error.
    #[must_use]
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::FrameTruncated { .. }
                | Self::FrameVersion { .. }
                | Self::FrameLength { .. }
                | Self::FrameCorrupt { .. }
        )
    }
}

/// Result type alias using `QuillError`.
pub type Result<T> = std::result::Result<T, QuillError>;
