//! Log stream lifecycle controller.

use super::appender::{APPENDER_SUBSCRIPTION, AppenderCommand, LogStorageAppender};
use super::conditions::ConditionId;
use super::metrics::LogStreamMetrics;
use super::reader::LogStreamReader;
use super::state::{AppendProgress, LogStreamStatus, StreamShared};
use super::writer::LogStreamWriter;
use crate::config::LogStreamConfig;
use parking_lot::{Mutex, RwLock};
use quill_core::dispatcher::{Dispatcher, DispatcherMode, Subscription};
use quill_core::error::{QuillError, Result};
use quill_core::storage::{FsLogStorage, LogStorage};
use quill_core::types::{PartitionId, Position, Term};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Handle to a running appender task.
struct AppenderWorker {
    commands: mpsc::Sender<AppenderCommand>,
    task: JoinHandle<()>,
}

impl AppenderWorker {
    /// Ask the task to drain and stop, then wait for it.
    async fn stop(self, stream: &str) -> Result<Position> {
        let (ack, done) = oneshot::channel();
        let sent = self.commands.send(AppenderCommand::Close { ack }).await;
        let position = match sent {
            Ok(()) => done.await.ok(),
            Err(_) => None,
        };

        if let Err(e) = self.task.await {
            tracing::error!(stream = %stream, error = %e, "Appender task did not finish cleanly");
        }

        position.ok_or_else(|| QuillError::AppenderStopped {
            stream: stream.to_string(),
        })
    }
}

/// A partition's append-only log.
///
/// Producers write through the [`write_buffer`](Self::write_buffer) (or a
/// [`LogStreamWriter`]); a single appender task persists committed frames
/// to [`LogStorage`] in commit order. Term and commit position are supplied
/// by replication and only stored here.
///
/// # Example
///
/// ```ignore
/// let stream = LogStream::new(PartitionId::new(1), LogStreamConfig::in_memory())?;
/// stream.open().await?;
///
/// let writer = stream.writer(1)?;
/// writer.write(b"FOO")?;
/// stream.wait_for_position(Position::FIRST).await?;
///
/// stream.close().await?;
/// ```
pub struct LogStream {
    shared: Arc<StreamShared>,
    config: LogStreamConfig,
    storage: Arc<dyn LogStorage>,
    dispatcher: RwLock<Option<Dispatcher>>,
    worker: Mutex<Option<AppenderWorker>>,
}

impl LogStream {
    /// Create a closed log stream over segment-file storage in
    /// `config.storage.directory`.
    pub fn new(partition: PartitionId, config: LogStreamConfig) -> Result<Self> {
        config.validate()?;
        let storage = FsLogStorage::open(config.storage.clone())?;
        Self::with_storage(partition, config, Arc::new(storage))
    }

    /// Create a closed log stream over the given storage.
    pub fn with_storage(
        partition: PartitionId,
        config: LogStreamConfig,
        storage: Arc<dyn LogStorage>,
    ) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(StreamShared::new(partition.to_string(), partition));
        shared.set_appender_position(storage.last_position()?);
        Ok(Self {
            shared,
            config,
            storage,
            dispatcher: RwLock::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Wire the write buffer and start the appender.
    ///
    /// Recovers the durable position from storage so positions continue
    /// where the previous instance stopped. Only allowed from `Closed`.
    pub async fn open(&self) -> Result<()> {
        let _span = crate::log_stream_span!(self.shared.name, "open").entered();
        self.shared
            .transition(LogStreamStatus::Closed, LogStreamStatus::Opening)?;

        if let Err(e) = self.start() {
            tracing::error!(
                stream = %self.shared.name,
                error = %e,
                "Failed to open log stream"
            );
            self.release_dispatcher();
            self.shared
                .transition(LogStreamStatus::Opening, LogStreamStatus::Closed)?;
            return Err(e);
        }

        self.shared
            .transition(LogStreamStatus::Opening, LogStreamStatus::Open)?;
        tracing::info!(
            stream = %self.shared.name,
            partition = %self.shared.partition,
            position = %self.shared.appender_position(),
            term = %self.shared.term(),
            "Log stream opened"
        );
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.storage.reopen()?;
        let position = self.storage.last_position()?;
        self.shared.set_appender_position(position);

        let dispatcher = Dispatcher::new(
            self.shared.name.clone(),
            self.config.dispatcher.with_mode(DispatcherMode::Pipeline),
        )?;
        // First subscription of a pipeline: every later one trails it.
        let subscription = dispatcher.open_subscription(APPENDER_SUBSCRIPTION)?;
        let appender = LogStorageAppender::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.storage),
            dispatcher.clone(),
            subscription,
            self.config.max_frames_per_turn,
        );

        let (commands, receiver) = mpsc::channel(1);
        let task = tokio::spawn(
            appender
                .run(receiver, self.config.idle_poll_interval())
                .instrument(crate::log_stream_span!(self.shared.name, "append")),
        );

        *self.dispatcher.write() = Some(dispatcher);
        *self.worker.lock() = Some(AppenderWorker { commands, task });
        Ok(())
    }

    /// Drain in-flight appends and release the appender, the write buffer
    /// and the storage handles.
    ///
    /// A closed stream can be opened again. A failed stream is released but
    /// stays `Failed`. Closing a closed stream is a no-op.
    pub async fn close(&self) -> Result<()> {
        match self.shared.status() {
            LogStreamStatus::Closed => return Ok(()),
            LogStreamStatus::Open => {
                // Loses only against the appender failing the stream.
                if self
                    .shared
                    .transition(LogStreamStatus::Open, LogStreamStatus::Closing)
                    .is_err()
                    && self.shared.status() != LogStreamStatus::Failed
                {
                    return Err(self.transition_error(LogStreamStatus::Closing));
                }
            }
            LogStreamStatus::Failed => {}
            LogStreamStatus::Opening | LogStreamStatus::Closing => {
                return Err(self.transition_error(LogStreamStatus::Closing));
            }
        }

        if let Some(dispatcher) = self.dispatcher.read().as_ref() {
            dispatcher.close();
        }
        let worker = self.worker.lock().take();
        let position = match worker {
            Some(worker) => match worker.stop(&self.shared.name).await {
                Ok(position) => position,
                Err(e) => {
                    tracing::warn!(stream = %self.shared.name, error = %e, "Appender gone before close");
                    self.shared.appender_position()
                }
            },
            None => self.shared.appender_position(),
        };
        self.release_dispatcher();

        if let Err(e) = self.storage.flush() {
            tracing::warn!(stream = %self.shared.name, error = %e, "Flush on close failed");
        }
        self.storage.close()?;

        if self.shared.status() == LogStreamStatus::Failed {
            tracing::warn!(
                stream = %self.shared.name,
                position = %position,
                "Released failed log stream"
            );
            return Ok(());
        }

        self.shared
            .transition(LogStreamStatus::Closing, LogStreamStatus::Closed)?;
        tracing::info!(
            stream = %self.shared.name,
            partition = %self.shared.partition,
            position = %position,
            "Log stream closed"
        );
        Ok(())
    }

    /// Close the stream and remove its durable data.
    pub async fn delete(&self) -> Result<()> {
        self.close().await?;
        self.storage.delete()?;
        self.shared.set_appender_position(Position::NONE);
        tracing::info!(stream = %self.shared.name, "Log stream deleted");
        Ok(())
    }

    fn release_dispatcher(&self) {
        // Dropping the last handle releases the buffer.
        self.dispatcher.write().take();
    }

    fn transition_error(&self, to: LogStreamStatus) -> QuillError {
        QuillError::InvalidStateTransition {
            stream: self.shared.name.clone(),
            from: self.shared.status().to_string(),
            to: to.to_string(),
        }
    }

    /// Stream name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Owning partition.
    pub fn partition(&self) -> PartitionId {
        self.shared.partition
    }

    /// Stream configuration.
    pub fn config(&self) -> &LogStreamConfig {
        &self.config
    }

    /// Durable storage.
    pub fn storage(&self) -> &Arc<dyn LogStorage> {
        &self.storage
    }

    /// Current lifecycle status.
    pub fn status(&self) -> LogStreamStatus {
        self.shared.status()
    }

    /// Whether the stream accepts writes.
    pub fn is_open(&self) -> bool {
        self.status() == LogStreamStatus::Open
    }

    /// Whether a durable append failed.
    pub fn is_failed(&self) -> bool {
        self.status() == LogStreamStatus::Failed
    }

    /// Position of the last durable record.
    pub fn current_appender_position(&self) -> Position {
        self.shared.appender_position()
    }

    /// Replication-acknowledged position.
    pub fn commit_position(&self) -> Position {
        self.shared.commit_position()
    }

    /// Store a new commit position. Requires an open stream and never moves
    /// backwards. May run ahead of the appender position.
    pub fn set_commit_position(&self, position: Position) -> Result<()> {
        self.shared.set_commit_position(position)?;
        tracing::trace!(stream = %self.shared.name, position = %position, "Commit position updated");
        Ok(())
    }

    /// Highest position that is both committed and locally durable.
    pub fn readable_position(&self) -> Position {
        self.commit_position().min(self.current_appender_position())
    }

    /// Current leadership term.
    pub fn term(&self) -> Term {
        self.shared.term()
    }

    /// Store a new term. Requires an open stream and never moves backwards.
    pub fn set_term(&self, term: Term) -> Result<()> {
        let previous = self.shared.term();
        self.shared.set_term(term)?;
        if term != previous {
            tracing::info!(stream = %self.shared.name, term = %term, "Term changed");
        }
        Ok(())
    }

    /// Register a callback run on the appender's turn after records became
    /// durable, with the new position. The callback must not block.
    pub fn register_on_append_condition<F>(&self, condition: F) -> ConditionId
    where
        F: Fn(Position) + Send + Sync + 'static,
    {
        self.shared.conditions.register(condition)
    }

    /// Remove a registered condition. Returns false if it was not registered.
    pub fn remove_on_append_condition(&self, id: ConditionId) -> bool {
        self.shared.conditions.remove(id)
    }

    /// The write buffer producers claim frames in.
    pub fn write_buffer(&self) -> Result<Dispatcher> {
        self.shared.ensure_open()?;
        self.dispatcher
            .read()
            .clone()
            .ok_or_else(|| QuillError::StreamNotOpen {
                stream: self.shared.name.clone(),
                status: self.shared.status().to_string(),
            })
    }

    /// A writer tagging frames with `stream_id`.
    pub fn writer(&self, stream_id: i32) -> Result<LogStreamWriter> {
        let dispatcher = self.write_buffer()?;
        Ok(LogStreamWriter::new(
            dispatcher,
            Arc::clone(&self.shared),
            stream_id,
        ))
    }

    /// A reader over durable records, positioned at the first record.
    pub fn reader(&self) -> LogStreamReader {
        LogStreamReader::new(Arc::clone(&self.storage), Arc::clone(&self.shared))
    }

    /// Subscribe to the write buffer.
    ///
    /// The subscription only sees frames the appender has handled, so the
    /// failed flag of every delivered frame is final.
    pub fn open_buffer_subscription(&self, name: &str) -> Result<Subscription> {
        self.with_dispatcher(|dispatcher| dispatcher.open_subscription(name))
    }

    /// Subscribe to the write buffer from an earlier dispatcher position.
    pub fn open_buffer_subscription_at(&self, name: &str, position: u64) -> Result<Subscription> {
        self.with_dispatcher(|dispatcher| dispatcher.open_subscription_at(name, position))
    }

    fn with_dispatcher<T>(&self, f: impl FnOnce(&Dispatcher) -> Result<T>) -> Result<T> {
        match self.dispatcher.read().as_ref() {
            Some(dispatcher) => f(dispatcher),
            None => Err(QuillError::StreamNotOpen {
                stream: self.shared.name.clone(),
                status: self.shared.status().to_string(),
            }),
        }
    }

    /// Watch appender progress.
    pub fn subscribe_progress(&self) -> watch::Receiver<AppendProgress> {
        self.shared.subscribe_progress()
    }

    /// Wait until `position` is durable.
    ///
    /// Keeps waiting while the stream is closing, since close drains the
    /// write buffer. Fails if the stream fails or is closed first.
    pub async fn wait_for_position(&self, position: Position) -> Result<Position> {
        let mut progress = self.shared.subscribe_progress();
        let reached = *progress
            .wait_for(|progress| {
                progress.position >= position
                    || !matches!(
                        progress.status,
                        LogStreamStatus::Open | LogStreamStatus::Opening | LogStreamStatus::Closing
                    )
            })
            .await
            .map_err(|_| QuillError::AppenderStopped {
                stream: self.shared.name.clone(),
            })?;

        if reached.position >= position {
            return Ok(reached.position);
        }
        Err(match reached.status {
            LogStreamStatus::Failed => QuillError::StreamFailed {
                stream: self.shared.name.clone(),
            },
            status => QuillError::StreamNotOpen {
                stream: self.shared.name.clone(),
                status: status.to_string(),
            },
        })
    }

    /// Appender counters.
    pub fn metrics(&self) -> &LogStreamMetrics {
        &self.shared.metrics
    }
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("name", &self.shared.name)
            .field("status", &self.status())
            .field("position", &self.current_appender_position())
            .field("term", &self.term())
            .field("commit_position", &self.commit_position())
            .finish()
    }
}
