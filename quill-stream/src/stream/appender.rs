//! The storage appender: drains the write buffer into durable storage.
//!
//! One appender runs per log stream as a single tokio task, so storage
//! appends of a stream are serialized without a lock around the storage
//! call. Each turn polls a bounded number of committed frames, appends them
//! in order and publishes the new durable position once.

use super::state::StreamShared;
use quill_core::dispatcher::{Dispatcher, Fragment, FragmentResult, Subscription};
use quill_core::error::{QuillError, Result};
use quill_core::frame::encode_header;
use quill_core::storage::LogStorage;
use quill_core::types::Position;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

/// Name of the appender's dispatcher subscription.
pub const APPENDER_SUBSCRIPTION: &str = "log-appender";

/// Control messages for a running appender task.
#[derive(Debug)]
pub enum AppenderCommand {
    /// Drain what is readable, then stop and report the final position.
    Close {
        /// Receives the durable position after the drain.
        ack: oneshot::Sender<Position>,
    },
}

/// What one appender turn did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Frames consumed from the write buffer.
    pub frames: usize,
    /// Frames that became durable.
    pub appended: usize,
    /// Frames marked failed without an append attempt.
    pub discarded: usize,
}

/// Single writer persisting committed frames of one log stream.
pub struct LogStorageAppender {
    shared: Arc<StreamShared>,
    storage: Arc<dyn LogStorage>,
    dispatcher: Dispatcher,
    subscription: Subscription,
    max_frames_per_turn: usize,
    position: Position,
    failed: bool,
    scratch: Vec<u8>,
}

impl LogStorageAppender {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        storage: Arc<dyn LogStorage>,
        dispatcher: Dispatcher,
        subscription: Subscription,
        max_frames_per_turn: usize,
    ) -> Self {
        let position = shared.appender_position();
        Self {
            shared,
            storage,
            dispatcher,
            subscription,
            max_frames_per_turn,
            position,
            failed: false,
            scratch: Vec::new(),
        }
    }

    /// Last durable position.
    pub fn position(&self) -> Position {
        self.position
    }

    /// Whether an append failed. A failed appender only discards frames.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Handle up to `max_frames_per_turn` committed frames.
    ///
    /// On an append failure the frame is flagged failed in the buffer, the
    /// stream moves to `Failed`, the write buffer stops accepting claims and
    /// the error is returned. Later frames, in this turn and all following
    /// ones, are flagged failed and discarded. A corrupt frame halts the
    /// subscription and fails the stream the same way, after the frames
    /// before it are published.
    pub fn turn(&mut self) -> Result<TurnOutcome> {
        if self.subscription.is_halted() {
            return Ok(TurnOutcome::default());
        }

        let max_frames = self.max_frames_per_turn;
        let Self {
            storage,
            subscription,
            position,
            failed,
            scratch,
            ..
        } = self;
        let mut outcome = TurnOutcome::default();
        let mut failure = None;

        let polled = subscription.poll(
            |fragment| {
                if *failed {
                    fragment.mark_failed();
                    outcome.discarded += 1;
                    return FragmentResult::Consume;
                }

                match append_fragment(&**storage, fragment, position.next(), scratch) {
                    Ok(appended) => {
                        *position = appended;
                        outcome.appended += 1;
                    }
                    Err(error) => {
                        fragment.mark_failed();
                        *failed = true;
                        failure = Some(error);
                    }
                }
                FragmentResult::Consume
            },
            max_frames,
        );

        // A halted poll still consumed the frames before the corrupt one.
        let (frames, halted) = match polled {
            Ok(frames) => (frames, None),
            Err(error) => {
                self.failed = true;
                let handled = outcome.appended + outcome.discarded + usize::from(failure.is_some());
                (handled, Some(error))
            }
        };
        let failure = failure.or(halted);
        outcome.frames = frames;
        if frames > 0 {
            self.shared
                .metrics
                .record_turn(outcome.appended, outcome.discarded, failure.is_some());
        }

        if outcome.appended > 0 {
            self.shared.set_appender_position(self.position);
            self.shared.conditions.signal(self.position);
            tracing::trace!(
                stream = %self.shared.name,
                position = %self.position,
                appended = outcome.appended,
                "Appended frames"
            );
        }
        if outcome.discarded > 0 {
            tracing::debug!(
                stream = %self.shared.name,
                discarded = outcome.discarded,
                "Discarded frames after append failure"
            );
        }

        match failure {
            Some(error) => {
                self.on_failure(&error);
                Err(error)
            }
            None => Ok(outcome),
        }
    }

    /// Run turns until every readable frame is handled.
    pub fn drain(&mut self) -> usize {
        let mut frames = 0;
        loop {
            match self.turn() {
                Ok(outcome) if outcome.frames == 0 => return frames,
                Ok(outcome) => frames += outcome.frames,
                // The failing frame was consumed; continue discarding.
                Err(_) if !self.subscription.is_halted() => frames += 1,
                Err(_) => return frames,
            }
        }
    }

    /// Appender task body.
    ///
    /// Parks on the subscription's wake-up signal between turns, with
    /// `idle_interval` as a fallback. Stops on [`AppenderCommand::Close`] or
    /// when the command channel closes.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<AppenderCommand>,
        idle_interval: Duration,
    ) {
        let notify = self.subscription.notifier();
        let mut idle = tokio::time::interval(idle_interval);
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(
            stream = %self.shared.name,
            position = %self.position,
            "Appender started"
        );

        loop {
            let frames = self.turn().map(|outcome| outcome.frames).unwrap_or(0);
            if frames >= self.max_frames_per_turn {
                // Budget used up; more frames are likely readable.
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                command = commands.recv() => {
                    let drained = self.drain();
                    tracing::debug!(
                        stream = %self.shared.name,
                        position = %self.position,
                        drained,
                        "Appender stopped"
                    );
                    if let Some(AppenderCommand::Close { ack }) = command {
                        let _ = ack.send(self.position);
                    }
                    return;
                }
                _ = notify.notified() => {}
                _ = idle.tick() => {}
            }
        }
    }

    fn on_failure(&self, error: &QuillError) {
        self.dispatcher.close();
        if self.shared.fail() {
            tracing::error!(
                stream = %self.shared.name,
                partition = %self.shared.partition,
                position = %self.position,
                error = %error,
                code = error.code(),
                "Appender failed, log stream failed"
            );
        }
    }
}

impl std::fmt::Debug for LogStorageAppender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStorageAppender")
            .field("stream", &self.shared.name)
            .field("position", &self.position)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

/// Rebuild the standalone frame in `scratch` and append it.
fn append_fragment(
    storage: &dyn LogStorage,
    fragment: &Fragment<'_>,
    expected: Position,
    scratch: &mut Vec<u8>,
) -> Result<Position> {
    scratch.clear();
    scratch.extend_from_slice(&encode_header(fragment.stream_id(), fragment.length())?);
    scratch.extend_from_slice(fragment.payload());
    scratch.resize(fragment.aligned_length(), 0);

    let actual = storage.append(scratch)?;
    if actual != expected {
        return Err(QuillError::PositionMismatch { expected, actual });
    }
    Ok(actual)
}
