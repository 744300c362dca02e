//! Strongly-typed identifiers and positions for log streams.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a record in the durable log.
///
/// Positions are record sequence numbers: the first appended record gets
/// position 1 and every further record increments it by exactly one.
/// [`Position::NONE`] stands for "nothing appended yet".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Position(u64);

impl Position {
    /// No record has been appended.
    pub const NONE: Self = Self(0);

    /// Position of the first record of a log.
    pub const FIRST: Self = Self(1);

    /// Create a position from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Check whether this is [`Position::NONE`].
    #[must_use]
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// The position that the next appended record will receive.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Position {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Leadership epoch of the partition that owns a log stream.
///
/// Supplied by replication; the log stream only stores and exposes it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Term(u64);

impl Term {
    /// Create a term from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "term_{}", self.0)
    }
}

/// Identifier of the partition a log stream belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct PartitionId(u32);

impl PartitionId {
    /// Create a partition ID from a raw value.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition_{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_ordering_and_next() {
        assert!(Position::NONE.is_none());
        assert_eq!(Position::NONE.next(), Position::FIRST);
        assert!(Position::new(3) < Position::new(4));
        assert_eq!(Position::new(41).next().as_u64(), 42);
    }

    #[test]
    fn display_formats() {
        assert_eq!(Position::new(7).to_string(), "7");
        assert_eq!(Term::new(2).to_string(), "term_2");
        assert_eq!(PartitionId::new(1).to_string(), "partition_1");
    }

    #[test]
    fn serde_is_transparent() {
        let json = serde_json::to_string(&Position::new(12)).unwrap();
        assert_eq!(json, "12");
        let parsed: PartitionId = serde_json::from_str("3").unwrap();
        assert_eq!(parsed, PartitionId::new(3));
    }
}
