//! Lock-free multi-producer ring buffer.
//!
//! Producers [`claim`](Dispatcher::claim) space with a compare-and-swap on
//! the shared tail, fill the payload and commit. Subscriptions read
//! committed frames in position order. Producers are held back by the
//! slowest subscription: a claim that would overwrite unread data returns
//! [`QuillError::Blocked`] instead of waiting.
//!
//! # Example
//!
//! ```ignore
//! let dispatcher = Dispatcher::new("partition-1", DispatcherConfig::default())?;
//! let mut subscription = dispatcher.open_subscription("reader")?;
//!
//! let mut claim = dispatcher.claim(3, 1)?;
//! claim.write(b"FOO");
//! claim.commit();
//!
//! subscription.poll(|fragment| {
//!     assert_eq!(fragment.payload(), b"FOO");
//!     FragmentResult::Consume
//! }, 10)?;
//! ```

mod buffer;
mod claim;
mod config;
mod epoch;
mod subscription;

pub use claim::ClaimedFragment;
pub use config::{DEFAULT_CAPACITY, DispatcherConfig, DispatcherMode, MAX_CAPACITY, MIN_CAPACITY};
pub use subscription::{Fragment, FragmentResult, Subscription};

use crate::error::{QuillError, Result};
use crate::frame::{
    FRAME_ALIGNMENT, HEADER_LENGTH, aligned_length, framed_length, write_header_tail,
    write_length_and_lap,
};
use arc_swap::ArcSwap;
use buffer::RingBuffer;
use crossbeam_utils::CachePadded;
use epoch::RefreshEpoch;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use subscription::SubscriptionState;

/// Length and lap word at the start of every frame and padding region.
const PUBLISH_WORD_LENGTH: usize = 8;

pub(crate) struct DispatcherInner {
    pub(crate) name: String,
    config: DispatcherConfig,
    pub(crate) buffer: RingBuffer,
    tail: CachePadded<AtomicU64>,
    publisher_limit: CachePadded<AtomicU64>,
    closed: AtomicBool,
    /// Open subscriptions in opening order. Producers and pollers only ever
    /// load the snapshot; open and close swap in a new one.
    subscriptions: ArcSwap<Vec<Arc<SubscriptionState>>>,
    /// Serializes snapshot swaps.
    changes: Mutex<()>,
    refresh_epoch: RefreshEpoch,
}

impl DispatcherInner {
    fn claim(&self, length: usize, stream_id: i32) -> Result<ClaimedFragment<'_>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QuillError::DispatcherClosed {
                dispatcher: self.name.clone(),
            });
        }

        // Bounded before any arithmetic so huge lengths cannot wrap.
        if length > self.config.max_frame_length.saturating_sub(HEADER_LENGTH) {
            return Err(QuillError::FrameTooLarge {
                requested: length.saturating_add(HEADER_LENGTH),
                max: self.config.max_frame_length,
            });
        }
        let aligned = aligned_length(framed_length(length));
        if aligned > self.config.max_frame_length {
            return Err(QuillError::FrameTooLarge {
                requested: aligned,
                max: self.config.max_frame_length,
            });
        }

        let capacity = self.buffer.capacity();
        let mut tail = self.tail.load(Ordering::Acquire);
        loop {
            // A frame never wraps: if it does not fit before the end of the
            // buffer, the remainder is reserved as padding.
            let remaining = capacity - self.buffer.offset(tail);
            let padding = if aligned > remaining { remaining } else { 0 };
            let required = (padding + aligned) as u64;

            let mut limit = self.publisher_limit.load(Ordering::Acquire);
            if tail + required > limit {
                limit = self.refresh_publisher_limit();
                if tail + required > limit {
                    return Err(QuillError::Blocked {
                        requested: required as usize,
                        available: limit.saturating_sub(tail) as usize,
                    });
                }
            }

            match self.tail.compare_exchange_weak(
                tail,
                tail + required,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if padding > 0 {
                        self.publish_padding(tail, padding);
                    }
                    let position = tail + padding as u64;
                    let offset = self.buffer.offset(position);
                    // SAFETY: the CAS above made this region ours.
                    let header = unsafe { self.buffer.region_mut(offset, HEADER_LENGTH) };
                    write_header_tail(header, stream_id);
                    return Ok(ClaimedFragment::new(self, position, length));
                }
                Err(current) => tail = current,
            }
        }
    }

    fn publish_padding(&self, position: u64, length: usize) {
        let offset = self.buffer.offset(position);
        // SAFETY: reserved by the caller's successful CAS; at least 8 bytes
        // remain since every position is frame aligned.
        let word = unsafe { self.buffer.region_mut(offset, PUBLISH_WORD_LENGTH) };
        write_length_and_lap(word, -(length as i32), self.buffer.lap(position));
        self.buffer.publish(position);
    }

    pub(crate) fn commit_frame(&self, position: u64, length: usize) {
        let offset = self.buffer.offset(position);
        // SAFETY: called once by the owning claim before publication.
        let word = unsafe { self.buffer.region_mut(offset, PUBLISH_WORD_LENGTH) };
        write_length_and_lap(
            word,
            framed_length(length) as i32,
            self.buffer.lap(position),
        );
        self.buffer.publish(position);
        self.notify_all();
    }

    pub(crate) fn abort_frame(&self, position: u64, length: usize) {
        self.publish_padding(position, aligned_length(framed_length(length)));
        self.notify_all();
    }

    fn notify_all(&self) {
        for subscription in self.subscriptions.load().iter() {
            subscription.notify.notify_one();
        }
    }

    /// Recompute the publisher limit from the slowest subscription.
    ///
    /// The limit only ever grows. With no subscription it follows the tail.
    fn refresh_publisher_limit(&self) -> u64 {
        // Held until the limit is raised; see `open_subscription`.
        let _section = self.refresh_epoch.enter();
        let subscriptions = self.subscriptions.load();
        let slowest = subscriptions
            .iter()
            .map(|s| s.position())
            .min()
            .unwrap_or_else(|| self.tail.load(Ordering::Acquire));
        let limit = slowest + self.buffer.capacity() as u64;
        let previous = self.publisher_limit.fetch_max(limit, Ordering::AcqRel);
        previous.max(limit)
    }

    /// Oldest position producers may not have overwritten yet.
    fn retained_from(&self) -> u64 {
        self.publisher_limit
            .load(Ordering::Acquire)
            .saturating_sub(self.buffer.capacity() as u64)
    }

    /// Upper bound for a subscription's reads, if any besides publication.
    pub(crate) fn read_limit(&self, state: &Arc<SubscriptionState>) -> Option<u64> {
        if self.config.mode == DispatcherMode::PubSub {
            return None;
        }
        let subscriptions = self.subscriptions.load();
        let index = subscriptions.iter().position(|s| Arc::ptr_eq(s, state))?;
        index.checked_sub(1).map(|i| subscriptions[i].position())
    }

    pub(crate) fn on_subscription_advanced(&self, state: &Arc<SubscriptionState>) {
        self.refresh_publisher_limit();
        if self.config.mode == DispatcherMode::Pipeline {
            let subscriptions = self.subscriptions.load();
            if let Some(index) = subscriptions.iter().position(|s| Arc::ptr_eq(s, state)) {
                if let Some(next) = subscriptions.get(index + 1) {
                    next.notify.notify_one();
                }
            }
        }
    }

    fn open_subscription(
        &self,
        name: &str,
        start: Option<u64>,
    ) -> Result<Arc<SubscriptionState>> {
        let _changes = self.changes.lock();
        let current = self.subscriptions.load_full();
        if current.iter().any(|s| s.name == name) {
            return Err(QuillError::SubscriptionExists {
                subscription: name.to_string(),
            });
        }

        let invalid = |position: u64, cause: String| QuillError::SubscriptionPosition {
            subscription: name.to_string(),
            position,
            cause,
        };
        let tail = self.tail.load(Ordering::Acquire);
        let position = match start {
            None => tail,
            Some(position) => {
                if position % FRAME_ALIGNMENT as u64 != 0 {
                    return Err(invalid(position, "not frame aligned".to_string()));
                }
                if position > tail {
                    return Err(invalid(position, format!("ahead of tail {}", tail)));
                }
                position
            }
        };

        let state = Arc::new(SubscriptionState::new(name.to_string(), position));
        let mut next = Vec::clone(&current);
        next.push(Arc::clone(&state));
        self.subscriptions.store(Arc::new(next));

        // Refreshes from here on see the new cursor; wait out the others so
        // the limit checked below is final for this position.
        self.refresh_epoch.synchronize();
        let retained = self.retained_from();
        if retained > position {
            match start {
                // Every frame before `retained` was read by all other
                // subscriptions, so a tail cursor may start there.
                None => state.set_position(retained),
                Some(_) => {
                    self.subscriptions.store(current);
                    return Err(invalid(
                        position,
                        format!("older than the oldest retained position {}", retained),
                    ));
                }
            }
        }

        tracing::debug!(
            dispatcher = %self.name,
            subscription = name,
            position = state.position(),
            "Opened subscription"
        );
        Ok(state)
    }

    pub(crate) fn close_subscription(&self, state: &Arc<SubscriptionState>) {
        {
            let _changes = self.changes.lock();
            let mut next = Vec::clone(&self.subscriptions.load_full());
            next.retain(|s| !Arc::ptr_eq(s, state));
            self.subscriptions.store(Arc::new(next));
        }
        tracing::debug!(dispatcher = %self.name, subscription = %state.name, "Closed subscription");
        self.refresh_publisher_limit();
        // Pipeline successors may now read further.
        self.notify_all();
    }
}

/// Multi-producer ring buffer with independent subscriber cursors.
///
/// Cheap to clone; clones share the buffer.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Allocate a dispatcher.
    pub fn new(name: impl Into<String>, config: DispatcherConfig) -> Result<Self> {
        config.validate()?;
        let buffer = RingBuffer::allocate(config.capacity)?;
        let name = name.into();

        tracing::debug!(
            dispatcher = %name,
            capacity = config.capacity,
            mode = ?config.mode,
            "Created dispatcher"
        );

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                name,
                config,
                buffer,
                tail: CachePadded::new(AtomicU64::new(0)),
                publisher_limit: CachePadded::new(AtomicU64::new(config.capacity as u64)),
                closed: AtomicBool::new(false),
                subscriptions: ArcSwap::from_pointee(Vec::new()),
                changes: Mutex::new(()),
                refresh_epoch: RefreshEpoch::default(),
            }),
        })
    }

    /// Reserve space for a frame with a payload of `length` bytes.
    ///
    /// Fails with [`QuillError::Blocked`] when the slowest subscription holds
    /// the space, [`QuillError::FrameTooLarge`] when the frame could never
    /// fit and [`QuillError::DispatcherClosed`] after [`close`](Self::close).
    pub fn claim(&self, length: usize, stream_id: i32) -> Result<ClaimedFragment<'_>> {
        self.inner.claim(length, stream_id)
    }

    /// Claim, copy and commit in one step. Returns the frame position.
    pub fn offer(&self, stream_id: i32, payload: &[u8]) -> Result<u64> {
        let mut claim = self.claim(payload.len(), stream_id)?;
        claim.write(payload);
        Ok(claim.commit())
    }

    /// Open a subscription starting at the current tail.
    pub fn open_subscription(&self, name: &str) -> Result<Subscription> {
        let state = self.inner.open_subscription(name, None)?;
        Ok(Subscription::new(Arc::clone(&self.inner), state))
    }

    /// Open a subscription at an earlier position for replay.
    ///
    /// The position must be a frame boundary that is still retained.
    pub fn open_subscription_at(&self, name: &str, position: u64) -> Result<Subscription> {
        let state = self.inner.open_subscription(name, Some(position))?;
        Ok(Subscription::new(Arc::clone(&self.inner), state))
    }

    /// Reject further claims. Committed frames stay readable.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(dispatcher = %self.inner.name, "Closed dispatcher");
            self.inner.notify_all();
        }
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Dispatcher name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.inner.buffer.capacity()
    }

    /// Subscription topology.
    pub fn mode(&self) -> DispatcherMode {
        self.inner.config.mode
    }

    /// Largest aligned frame a claim may reserve.
    pub fn max_frame_length(&self) -> usize {
        self.inner.config.max_frame_length
    }

    /// Position the next claim starts at.
    pub fn tail_position(&self) -> u64 {
        self.inner.tail.load(Ordering::Acquire)
    }

    /// Position producers may not claim beyond.
    pub fn publisher_limit(&self) -> u64 {
        self.inner.publisher_limit.load(Ordering::Acquire)
    }

    /// Number of open subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.load().len()
    }

    /// Mutable view of the header of the frame at `position`.
    ///
    /// # Safety
    ///
    /// The frame must be published and no subscription may read it while
    /// the returned slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn header_mut(&self, position: u64) -> &mut [u8] {
        let offset = self.inner.buffer.offset(position);
        // SAFETY: exclusive per the caller's contract.
        unsafe { self.inner.buffer.region_mut(offset, HEADER_LENGTH) }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.name)
            .field("capacity", &self.capacity())
            .field("tail", &self.tail_position())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::thread;

    fn small(mode: DispatcherMode) -> Dispatcher {
        let config = DispatcherConfig::default()
            .with_capacity(MIN_CAPACITY)
            .with_mode(mode);
        Dispatcher::new("test", config).unwrap()
    }

    fn drain(subscription: &mut Subscription) -> Vec<(i32, Vec<u8>, bool)> {
        let mut frames = Vec::new();
        subscription
            .poll(
                |fragment| {
                    frames.push((
                        fragment.stream_id(),
                        fragment.payload().to_vec(),
                        fragment.is_failed(),
                    ));
                    FragmentResult::Consume
                },
                usize::MAX,
            )
            .unwrap();
        frames
    }

    #[test]
    fn claim_commit_poll() {
        let dispatcher = small(DispatcherMode::PubSub);
        let mut subscription = dispatcher.open_subscription("reader").unwrap();

        let mut claim = dispatcher.claim(3, 1).unwrap();
        assert_eq!(claim.position(), 0);
        claim.write(b"FOO");
        assert_eq!(claim.commit(), 0);

        let position = dispatcher.offer(2, b"BAR").unwrap();
        assert_eq!(position, 24);
        assert_eq!(dispatcher.tail_position(), 48);

        let frames = drain(&mut subscription);
        assert_eq!(
            frames,
            vec![(1, b"FOO".to_vec(), false), (2, b"BAR".to_vec(), false)]
        );
        assert_eq!(subscription.position(), 48);
    }

    #[test]
    fn uncommitted_claim_hides_later_frames() {
        let dispatcher = small(DispatcherMode::PubSub);
        let mut subscription = dispatcher.open_subscription("reader").unwrap();

        let mut first = dispatcher.claim(4, 1).unwrap();
        dispatcher.offer(1, b"second").unwrap();

        assert!(drain(&mut subscription).is_empty());

        first.write(b"abcd");
        first.commit();
        let frames = drain(&mut subscription);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].1, b"abcd");
        assert_eq!(frames[1].1, b"second");
    }

    #[test]
    fn aborted_claims_are_skipped() {
        let dispatcher = small(DispatcherMode::PubSub);
        let mut subscription = dispatcher.open_subscription("reader").unwrap();

        dispatcher.claim(10, 1).unwrap().abort();
        {
            let _dropped = dispatcher.claim(10, 1).unwrap();
        }
        dispatcher.offer(1, b"kept").unwrap();

        let frames = drain(&mut subscription);
        assert_eq!(frames, vec![(1, b"kept".to_vec(), false)]);
    }

    #[test]
    fn blocked_when_subscriber_lags() {
        let dispatcher = small(DispatcherMode::PubSub);
        let mut subscription = dispatcher.open_subscription("slow").unwrap();
        let payload = [7u8; 1000];

        // 1016 bytes per frame, four fit into 4096.
        for _ in 0..4 {
            dispatcher.offer(1, &payload).unwrap();
        }
        let err = dispatcher.offer(1, &payload).unwrap_err();
        assert!(err.is_retriable());
        assert!(matches!(err, QuillError::Blocked { .. }));

        // Nothing committed was damaged.
        let frames = drain(&mut subscription);
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|(_, p, _)| p.as_slice() == payload));

        dispatcher.offer(1, &payload).unwrap();
    }

    #[test]
    fn frame_too_large_is_not_retriable() {
        let dispatcher = small(DispatcherMode::PubSub);
        let err = dispatcher.claim(MIN_CAPACITY, 1).unwrap_err();
        assert!(matches!(err, QuillError::FrameTooLarge { .. }));
        assert!(!err.is_retriable());
    }

    #[test]
    fn huge_claims_are_rejected_before_reserving() {
        let dispatcher = small(DispatcherMode::PubSub);
        let largest = dispatcher.max_frame_length() - HEADER_LENGTH;
        for length in [largest + 1, usize::MAX - 3, usize::MAX, isize::MAX as usize] {
            assert!(matches!(
                dispatcher.claim(length, 1),
                Err(QuillError::FrameTooLarge { .. })
            ));
        }
        assert_eq!(dispatcher.tail_position(), 0);

        let claim = dispatcher.claim(largest, 1).unwrap();
        assert_eq!(claim.len(), largest);
        claim.abort();
    }

    #[test]
    fn wraps_with_padding() {
        let dispatcher = small(DispatcherMode::PubSub);
        let mut subscription = dispatcher.open_subscription("reader").unwrap();

        let mut expected = Vec::new();
        for i in 0..40u32 {
            let payload = vec![i as u8; 300 + i as usize];
            dispatcher.offer(i as i32, &payload).unwrap();
            expected.push((i as i32, payload, false));
            // Keep up so the producer never blocks.
            let frames = drain(&mut subscription);
            assert_eq!(frames, vec![expected.last().cloned().unwrap()]);
        }
        assert!(dispatcher.tail_position() > MIN_CAPACITY as u64 * 2);
    }

    #[test]
    fn claims_fail_after_close() {
        let dispatcher = small(DispatcherMode::PubSub);
        let mut subscription = dispatcher.open_subscription("reader").unwrap();
        dispatcher.offer(1, b"before").unwrap();
        dispatcher.close();

        let err = dispatcher.claim(1, 1).unwrap_err();
        assert!(matches!(err, QuillError::DispatcherClosed { .. }));
        assert_eq!(drain(&mut subscription).len(), 1);
    }

    #[test]
    fn failed_flag_is_visible_to_later_pipeline_stages() {
        let dispatcher = small(DispatcherMode::Pipeline);
        let mut head = dispatcher.open_subscription("head").unwrap();
        let mut tail = dispatcher.open_subscription("tail").unwrap();

        dispatcher.offer(1, b"ok").unwrap();
        dispatcher.offer(1, b"bad").unwrap();

        // The second stage sees nothing until the first consumed.
        assert!(drain(&mut tail).is_empty());

        head.poll(
            |fragment| {
                if fragment.payload() == b"bad" {
                    fragment.mark_failed();
                }
                FragmentResult::Consume
            },
            10,
        )
        .unwrap();

        let frames = drain(&mut tail);
        assert_eq!(
            frames,
            vec![(1, b"ok".to_vec(), false), (1, b"bad".to_vec(), true)]
        );
    }

    #[test]
    fn postpone_leaves_cursor() {
        let dispatcher = small(DispatcherMode::PubSub);
        let mut subscription = dispatcher.open_subscription("reader").unwrap();
        dispatcher.offer(1, b"one").unwrap();
        dispatcher.offer(1, b"two").unwrap();

        let consumed = subscription
            .poll(
                |fragment| {
                    if fragment.payload() == b"two" {
                        FragmentResult::Postpone
                    } else {
                        FragmentResult::Consume
                    }
                },
                10,
            )
            .unwrap();
        assert_eq!(consumed, 1);
        assert_eq!(drain(&mut subscription), vec![(1, b"two".to_vec(), false)]);
    }

    #[test]
    fn max_frames_bounds_a_poll() {
        let dispatcher = small(DispatcherMode::PubSub);
        let mut subscription = dispatcher.open_subscription("reader").unwrap();
        for _ in 0..5 {
            dispatcher.offer(1, b"x").unwrap();
        }
        let consumed = subscription.poll(|_| FragmentResult::Consume, 2).unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(drain(&mut subscription).len(), 3);
    }

    #[test]
    fn subscriptions_are_independent() {
        let dispatcher = small(DispatcherMode::PubSub);
        let mut a = dispatcher.open_subscription("a").unwrap();
        dispatcher.offer(1, b"first").unwrap();
        let mut b = dispatcher.open_subscription("b").unwrap();
        dispatcher.offer(1, b"second").unwrap();

        assert_eq!(drain(&mut a).len(), 2);
        assert_eq!(drain(&mut b), vec![(1, b"second".to_vec(), false)]);

        let err = dispatcher.open_subscription("a").unwrap_err();
        assert!(matches!(err, QuillError::SubscriptionExists { .. }));
    }

    #[test]
    fn replay_from_retained_position() {
        let dispatcher = small(DispatcherMode::PubSub);
        let mut live = dispatcher.open_subscription("live").unwrap();
        dispatcher.offer(1, b"one").unwrap();
        dispatcher.offer(1, b"two").unwrap();

        let mut replay = dispatcher.open_subscription_at("replay", 24).unwrap();
        assert_eq!(drain(&mut replay), vec![(1, b"two".to_vec(), false)]);
        drain(&mut live);

        let err = dispatcher.open_subscription_at("bad", 3).unwrap_err();
        assert!(matches!(err, QuillError::SubscriptionPosition { .. }));
        let err = dispatcher.open_subscription_at("ahead", 4096).unwrap_err();
        assert!(matches!(err, QuillError::SubscriptionPosition { .. }));
    }

    #[test]
    fn reclaimed_replay_position_is_rejected() {
        let dispatcher = small(DispatcherMode::PubSub);
        let payload = [0u8; 1000];
        for _ in 0..5 {
            dispatcher.offer(1, &payload).unwrap();
        }
        // Without subscriptions the fifth claim reclaimed the first lap.
        assert!(dispatcher.publisher_limit() > MIN_CAPACITY as u64);

        let err = dispatcher.open_subscription_at("old", 0).unwrap_err();
        assert!(matches!(err, QuillError::SubscriptionPosition { .. }));
        assert_eq!(dispatcher.subscription_count(), 0);

        let subscription = dispatcher.open_subscription("tail").unwrap();
        assert_eq!(subscription.position(), dispatcher.tail_position());
        assert_eq!(dispatcher.subscription_count(), 1);
    }

    #[test]
    fn subscriptions_churn_while_producers_commit() {
        let dispatcher = small(DispatcherMode::PubSub);
        let mut reader = dispatcher.open_subscription("reader").unwrap();
        let producer = {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || {
                let mut sent = 0u32;
                while sent < 2_000 {
                    match dispatcher.offer(1, &sent.to_le_bytes()) {
                        Ok(_) => sent += 1,
                        Err(e) if e.is_retriable() => thread::yield_now(),
                        Err(e) => panic!("offer failed: {e}"),
                    }
                }
            })
        };

        let mut received = Vec::new();
        let mut round = 0;
        while received.len() < 2_000 {
            // Short-lived subscriptions come and go under the producer.
            let name = format!("churn-{}", round % 3);
            if let Ok(extra) = dispatcher.open_subscription(&name) {
                extra.close();
            }
            round += 1;
            reader
                .poll(
                    |fragment| {
                        let bytes: [u8; 4] = fragment.payload().try_into().unwrap();
                        received.push(u32::from_le_bytes(bytes));
                        FragmentResult::Consume
                    },
                    64,
                )
                .unwrap();
        }
        producer.join().unwrap();

        assert_eq!(received, (0..2_000u32).collect::<Vec<_>>());
        assert_eq!(dispatcher.subscription_count(), 1);
    }

    #[test]
    fn closing_subscription_releases_producers() {
        let dispatcher = small(DispatcherMode::PubSub);
        let subscription = dispatcher.open_subscription("idle").unwrap();
        let payload = [0u8; 1000];
        for _ in 0..4 {
            dispatcher.offer(1, &payload).unwrap();
        }
        assert!(dispatcher.offer(1, &payload).is_err());

        subscription.close();
        assert_eq!(dispatcher.subscription_count(), 0);
        dispatcher.offer(1, &payload).unwrap();
    }

    #[test]
    fn corrupt_header_halts_subscription() {
        let dispatcher = small(DispatcherMode::PubSub);
        let mut subscription = dispatcher.open_subscription("reader").unwrap();

        let mut claim = dispatcher.claim(8, 1).unwrap();
        let position = claim.position();
        claim.write(b"12345678");
        claim.commit();

        // Overwrite the version byte of the published frame.
        unsafe { dispatcher.header_mut(position)[12] = 42 };

        let err = subscription.poll(|_| FragmentResult::Consume, 10).unwrap_err();
        assert!(matches!(err, QuillError::FrameCorrupt { .. }));
        assert!(subscription.is_halted());

        let err = subscription.poll(|_| FragmentResult::Consume, 10).unwrap_err();
        assert!(matches!(err, QuillError::SubscriptionHalted { .. }));
    }

    #[test]
    fn concurrent_producers_keep_per_producer_order() {
        const PRODUCERS: i32 = 4;
        const PER_PRODUCER: u32 = 2_000;

        let config = DispatcherConfig::default().with_capacity(64 * 1024);
        let dispatcher = Dispatcher::new("mp", config).unwrap();
        let mut subscription = dispatcher.open_subscription("reader").unwrap();

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let dispatcher = dispatcher.clone();
                thread::spawn(move || {
                    let mut sequence = 0u32;
                    while sequence < PER_PRODUCER {
                        match dispatcher.offer(producer, &sequence.to_le_bytes()) {
                            Ok(_) => sequence += 1,
                            Err(e) if e.is_retriable() => thread::yield_now(),
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                    }
                })
            })
            .collect();

        let mut next: HashMap<i32, u32> = HashMap::new();
        let mut total = 0u32;
        while total < PRODUCERS as u32 * PER_PRODUCER {
            total += subscription
                .poll(
                    |fragment| {
                        let sequence =
                            u32::from_le_bytes(fragment.payload().try_into().unwrap());
                        let expected = next.entry(fragment.stream_id()).or_insert(0);
                        assert_eq!(sequence, *expected);
                        *expected += 1;
                        FragmentResult::Consume
                    },
                    128,
                )
                .unwrap() as u32;
        }

        for producer in producers {
            producer.join().unwrap();
        }
        assert!(next.values().all(|&n| n == PER_PRODUCER));
    }

    #[tokio::test]
    async fn commit_wakes_waiting_subscriber() {
        let dispatcher = small(DispatcherMode::PubSub);
        let subscription = dispatcher.open_subscription("reader").unwrap();
        let notify = subscription.notifier();

        let producer = dispatcher.clone();
        tokio::spawn(async move {
            producer.offer(1, b"wake").unwrap();
        });

        tokio::time::timeout(std::time::Duration::from_secs(5), notify.notified())
            .await
            .unwrap();
    }
}
