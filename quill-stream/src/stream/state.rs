//! Lifecycle status and shared position state of a log stream.

use super::conditions::AppendConditions;
use super::metrics::LogStreamMetrics;
use quill_core::error::{QuillError, Result};
use quill_core::types::{PartitionId, Position, Term};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tokio::sync::watch;

/// Log stream lifecycle status.
///
/// ```text
/// Closed -> Opening -> Open -> Closing -> Closed
///                       |
///                       v
///                     Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LogStreamStatus {
    /// No dispatcher or appender; storage handles released.
    Closed = 0,
    /// Wiring the dispatcher and recovering the durable position.
    Opening = 1,
    /// Accepting writes.
    Open = 2,
    /// A durable append failed. No further writes are accepted.
    Failed = 3,
    /// Draining in-flight appends before release.
    Closing = 4,
}

impl LogStreamStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Opening,
            2 => Self::Open,
            3 => Self::Failed,
            4 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Failed => "failed",
            Self::Closing => "closing",
        }
    }
}

impl fmt::Display for LogStreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Appender progress as published on the watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendProgress {
    /// Last durable position.
    pub position: Position,
    /// Stream status at the time of publication.
    pub status: LogStreamStatus,
}

/// State shared between the log stream handle and its appender task.
#[derive(Debug)]
pub(crate) struct StreamShared {
    pub(crate) name: String,
    pub(crate) partition: PartitionId,
    status: AtomicU8,
    term: AtomicU64,
    commit_position: AtomicU64,
    appender_position: AtomicU64,
    progress: watch::Sender<AppendProgress>,
    pub(crate) conditions: AppendConditions,
    pub(crate) metrics: LogStreamMetrics,
}

impl StreamShared {
    pub(crate) fn new(name: String, partition: PartitionId) -> Self {
        let (progress, _) = watch::channel(AppendProgress {
            position: Position::NONE,
            status: LogStreamStatus::Closed,
        });
        Self {
            name,
            partition,
            status: AtomicU8::new(LogStreamStatus::Closed as u8),
            term: AtomicU64::new(0),
            commit_position: AtomicU64::new(0),
            appender_position: AtomicU64::new(0),
            progress,
            conditions: AppendConditions::default(),
            metrics: LogStreamMetrics::default(),
        }
    }

    pub(crate) fn status(&self) -> LogStreamStatus {
        LogStreamStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`, failing if the status is not `from`.
    pub(crate) fn transition(&self, from: LogStreamStatus, to: LogStreamStatus) -> Result<()> {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|actual| QuillError::InvalidStateTransition {
                stream: self.name.clone(),
                from: LogStreamStatus::from_u8(actual).to_string(),
                to: to.to_string(),
            })?;
        tracing::debug!(stream = %self.name, from = %from, to = %to, "Log stream status changed");
        self.publish_progress();
        Ok(())
    }

    /// Move to `Failed` from `Open` or `Closing`. Returns false if the stream
    /// was in neither state.
    pub(crate) fn fail(&self) -> bool {
        let failed = [LogStreamStatus::Open, LogStreamStatus::Closing]
            .into_iter()
            .any(|from| {
                self.status
                    .compare_exchange(
                        from as u8,
                        LogStreamStatus::Failed as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            });
        if failed {
            self.publish_progress();
        }
        failed
    }

    /// Error for operations that need an open stream.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        match self.status() {
            LogStreamStatus::Open => Ok(()),
            LogStreamStatus::Failed => Err(QuillError::StreamFailed {
                stream: self.name.clone(),
            }),
            status => Err(QuillError::StreamNotOpen {
                stream: self.name.clone(),
                status: status.to_string(),
            }),
        }
    }

    pub(crate) fn term(&self) -> Term {
        Term::new(self.term.load(Ordering::Acquire))
    }

    pub(crate) fn set_term(&self, term: Term) -> Result<()> {
        self.ensure_open()?;
        self.term
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (term.as_u64() >= current).then_some(term.as_u64())
            })
            .map_err(|current| QuillError::TermRegression {
                current: Term::new(current),
                requested: term,
            })?;
        Ok(())
    }

    pub(crate) fn commit_position(&self) -> Position {
        Position::new(self.commit_position.load(Ordering::Acquire))
    }

    pub(crate) fn set_commit_position(&self, position: Position) -> Result<()> {
        self.ensure_open()?;
        self.commit_position
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (position.as_u64() >= current).then_some(position.as_u64())
            })
            .map_err(|current| QuillError::CommitPositionRegression {
                current: Position::new(current),
                requested: position,
            })?;
        Ok(())
    }

    pub(crate) fn appender_position(&self) -> Position {
        Position::new(self.appender_position.load(Ordering::Acquire))
    }

    /// Set the durable position. Only the appender and recovery call this.
    pub(crate) fn set_appender_position(&self, position: Position) {
        self.appender_position
            .store(position.as_u64(), Ordering::Release);
        self.publish_progress();
    }

    pub(crate) fn subscribe_progress(&self) -> watch::Receiver<AppendProgress> {
        self.progress.subscribe()
    }

    fn publish_progress(&self) {
        self.progress.send_replace(AppendProgress {
            position: self.appender_position(),
            status: self.status(),
        });
    }
}
