//! Subscriber cursors over the dispatcher.

use super::DispatcherInner;
use super::buffer::RingBuffer;
use crate::error::{QuillError, Result};
use crate::frame::{
    FLAG_FAILED, FLAGS_OFFSET, FRAME_ALIGNMENT, FRAME_VERSION, FrameHeader, HEADER_LENGTH,
    LAP_OFFSET, LENGTH_OFFSET, STREAM_ID_OFFSET, VERSION_OFFSET, aligned_length,
};
use byteorder::{ByteOrder, LittleEndian};
use crossbeam_utils::CachePadded;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

/// What a poll handler wants done with the fragment it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentResult {
    /// Advance past the fragment.
    Consume,
    /// Stop polling; the fragment is delivered again on the next poll.
    Postpone,
}

/// Shared state of one subscription, visible to the dispatcher.
#[derive(Debug)]
pub(crate) struct SubscriptionState {
    pub(crate) name: String,
    position: CachePadded<AtomicU64>,
    halted: AtomicBool,
    pub(crate) notify: Arc<Notify>,
}

impl SubscriptionState {
    pub(crate) fn new(name: String, position: u64) -> Self {
        Self {
            name,
            position: CachePadded::new(AtomicU64::new(position)),
            halted: AtomicBool::new(false),
            notify: Arc::new(Notify::new()),
        }
    }

    pub(crate) fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// Move an unpublished cursor before its subscription is handed out.
    pub(super) fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::Release);
    }
}

/// A committed frame handed to a poll handler.
pub struct Fragment<'a> {
    buffer: &'a RingBuffer,
    offset: usize,
    position: u64,
    stream_id: i32,
    length: usize,
}

impl<'a> Fragment<'a> {
    /// Dispatcher position of the frame.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Routing tag.
    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Payload length.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Bytes the frame occupies in the buffer.
    pub fn aligned_length(&self) -> usize {
        aligned_length(HEADER_LENGTH + self.length)
    }

    /// Payload bytes.
    pub fn payload(&self) -> &'a [u8] {
        // SAFETY: the frame is published and the polling subscription has not
        // advanced past it, so the region cannot be reclaimed. The payload
        // never covers the flags byte.
        unsafe {
            self.buffer
                .region(self.offset + HEADER_LENGTH, self.length)
        }
    }

    /// Whether the failed flag is set.
    pub fn is_failed(&self) -> bool {
        // SAFETY: see `payload`.
        let flags = unsafe { self.buffer.flags(self.offset) };
        flags.load(Ordering::Acquire) & FLAG_FAILED != 0
    }

    /// Set the failed flag in place. Nothing else in the frame changes.
    pub fn mark_failed(&self) {
        // SAFETY: see `payload`.
        let flags = unsafe { self.buffer.flags(self.offset) };
        flags.fetch_or(FLAG_FAILED, Ordering::AcqRel);
    }

    /// Snapshot of the header.
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            stream_id: self.stream_id,
            length: self.length,
            failed: self.is_failed(),
        }
    }
}

impl std::fmt::Debug for Fragment<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fragment")
            .field("position", &self.position)
            .field("stream_id", &self.stream_id)
            .field("length", &self.length)
            .field("failed", &self.is_failed())
            .finish()
    }
}

/// Independent read cursor over a dispatcher.
///
/// Owned by exactly one consumer; dropping it releases the cursor so it no
/// longer holds back producers.
pub struct Subscription {
    dispatcher: Arc<DispatcherInner>,
    state: Arc<SubscriptionState>,
}

impl Subscription {
    pub(super) fn new(dispatcher: Arc<DispatcherInner>, state: Arc<SubscriptionState>) -> Self {
        Self { dispatcher, state }
    }

    /// Subscription name.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Position of the next frame this subscription will read.
    pub fn position(&self) -> u64 {
        self.state.position()
    }

    /// Whether a corrupt frame stopped this subscription.
    pub fn is_halted(&self) -> bool {
        self.state.halted.load(Ordering::Acquire)
    }

    /// Signal notified whenever a frame becomes readable for this
    /// subscription. Holds at most one pending permit.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.state.notify)
    }

    /// Wait until new frames may be readable.
    pub async fn wait(&self) {
        self.state.notify.notified().await;
    }

    /// Deliver up to `max_frames` committed frames in order.
    ///
    /// Failed frames are delivered too; handlers decide via
    /// [`Fragment::is_failed`]. The cursor only moves past a frame after the
    /// handler returned [`FragmentResult::Consume`]. Padding is skipped and
    /// not counted. Returns the number of frames consumed.
    pub fn poll<F>(&mut self, mut handler: F, max_frames: usize) -> Result<usize>
    where
        F: FnMut(&Fragment<'_>) -> FragmentResult,
    {
        if self.is_halted() {
            return Err(QuillError::SubscriptionHalted {
                subscription: self.state.name.clone(),
                position: self.position(),
            });
        }

        let dispatcher = &*self.dispatcher;
        let buffer = &dispatcher.buffer;
        let limit = dispatcher.read_limit(&self.state);
        let start = self.state.position();
        let mut position = start;
        let mut frames = 0;

        while frames < max_frames {
            if limit.is_some_and(|limit| position >= limit) || !buffer.is_published(position) {
                break;
            }

            let offset = buffer.offset(position);
            let remaining = buffer.capacity() - offset;
            // SAFETY: published and not yet consumed by this subscription.
            // Bytes 0..8 hold length and lap; padding may be only 8 bytes.
            let word = unsafe { buffer.region(offset, STREAM_ID_OFFSET) };
            let length = LittleEndian::read_i32(&word[LENGTH_OFFSET..LAP_OFFSET]);

            if length < 0 {
                let padding = length.unsigned_abs() as usize;
                if padding % FRAME_ALIGNMENT != 0 || padding > remaining {
                    return Err(self.halt(position, format!("bad padding length {}", padding)));
                }
                position += padding as u64;
                continue;
            }

            let framed = length as usize;
            if framed < HEADER_LENGTH || aligned_length(framed) > remaining {
                return Err(self.halt(position, format!("bad frame length {}", framed)));
            }

            // SAFETY: as above; stops short of the flags byte.
            let head = unsafe { buffer.region(offset, FLAGS_OFFSET) };
            if head[VERSION_OFFSET] != FRAME_VERSION {
                return Err(self.halt(
                    position,
                    format!("unsupported version {}", head[VERSION_OFFSET]),
                ));
            }

            let fragment = Fragment {
                buffer,
                offset,
                position,
                stream_id: LittleEndian::read_i32(&head[STREAM_ID_OFFSET..VERSION_OFFSET]),
                length: framed - HEADER_LENGTH,
            };

            match handler(&fragment) {
                FragmentResult::Consume => {
                    position += aligned_length(framed) as u64;
                    frames += 1;
                }
                FragmentResult::Postpone => break,
            }
        }

        if position != start {
            self.state.position.store(position, Ordering::Release);
            dispatcher.on_subscription_advanced(&self.state);
        }

        Ok(frames)
    }

    fn halt(&self, position: u64, cause: String) -> QuillError {
        self.state.position.store(position, Ordering::Release);
        self.state.halted.store(true, Ordering::Release);
        self.dispatcher.on_subscription_advanced(&self.state);
        tracing::error!(
            dispatcher = %self.dispatcher.name,
            subscription = %self.state.name,
            position,
            %cause,
            "Corrupt frame, halting subscription"
        );
        QuillError::FrameCorrupt {
            subscription: self.state.name.clone(),
            position,
            cause,
        }
    }

    /// Release the cursor.
    pub fn close(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispatcher.close_subscription(&self.state);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.state.name)
            .field("position", &self.position())
            .finish()
    }
}
