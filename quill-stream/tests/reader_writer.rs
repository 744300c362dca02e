//! Integration tests for writing frames and reading records back.

mod common;

use common::{memory_stream, wait_for};
use quill_core::dispatcher::FragmentResult;
use quill_core::error::QuillError;
use quill_core::types::Position;

#[tokio::test]
async fn reader_returns_durable_records_in_order() {
    let (stream, _storage) = memory_stream();
    stream.open().await.unwrap();

    let orders = stream.writer(1).unwrap();
    let payments = stream.writer(2).unwrap();
    orders.write(b"order-1").unwrap();
    payments.write(b"payment-1").unwrap();
    orders.write(b"order-2").unwrap();

    // Nothing is durable before the appender ran.
    assert_eq!(stream.reader().count(), 0);

    wait_for(&stream, Position::new(3)).await;
    let records: Vec<_> = stream.reader().map(|r| r.unwrap()).collect();
    let summary: Vec<_> = records
        .iter()
        .map(|r| (r.position.as_u64(), r.stream_id, r.payload.as_slice()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (1, 1, &b"order-1"[..]),
            (2, 2, &b"payment-1"[..]),
            (3, 1, &b"order-2"[..]),
        ]
    );

    stream.close().await.unwrap();
}

#[tokio::test]
async fn reader_continues_after_more_appends() {
    let (stream, _storage) = memory_stream();
    stream.open().await.unwrap();
    let writer = stream.writer(1).unwrap();
    let mut reader = stream.reader();

    writer.write(b"a").unwrap();
    wait_for(&stream, Position::FIRST).await;
    assert_eq!(reader.next().unwrap().unwrap().payload, b"a");
    assert!(reader.next().is_none());

    writer.write(b"b").unwrap();
    wait_for(&stream, Position::new(2)).await;
    assert_eq!(reader.next().unwrap().unwrap().payload, b"b");
    assert_eq!(reader.position(), Position::new(3));

    stream.close().await.unwrap();
}

#[tokio::test]
async fn seek_positions_the_reader() {
    let (stream, _storage) = memory_stream();
    stream.open().await.unwrap();
    let writer = stream.writer(1).unwrap();
    for i in 1..=5u8 {
        writer.write(&[i]).unwrap();
    }
    wait_for(&stream, Position::new(5)).await;

    let mut reader = stream.reader();
    assert!(reader.seek(Position::new(3)).unwrap());
    assert_eq!(reader.next().unwrap().unwrap().payload, vec![3]);

    reader.seek_to_last().unwrap();
    assert_eq!(reader.next().unwrap().unwrap().position, Position::new(5));
    assert!(reader.next().is_none());

    reader.seek_to_first().unwrap();
    assert_eq!(reader.position(), Position::FIRST);

    assert!(!reader.seek(Position::new(9)).unwrap());
    assert!(reader.next().is_none());

    stream.close().await.unwrap();
}

#[tokio::test]
async fn buffer_subscription_trails_the_appender() {
    let (stream, _storage) = memory_stream();
    stream.open().await.unwrap();
    let mut audit = stream.open_buffer_subscription("audit").unwrap();
    let writer = stream.writer(4).unwrap();
    writer.write(b"one").unwrap();
    writer.write(b"two").unwrap();

    let mut seen = Vec::new();
    let mut collect = |fragment: &quill_core::dispatcher::Fragment<'_>| {
        seen.push((fragment.stream_id(), fragment.payload().to_vec(), fragment.is_failed()));
        FragmentResult::Consume
    };
    assert_eq!(audit.poll(&mut collect, 16).unwrap(), 0);

    wait_for(&stream, Position::new(2)).await;
    assert_eq!(audit.poll(&mut collect, 16).unwrap(), 2);
    assert_eq!(
        seen,
        vec![(4, b"one".to_vec(), false), (4, b"two".to_vec(), false)]
    );

    stream.close().await.unwrap();
}

#[tokio::test]
async fn write_with_retry_waits_for_slow_subscriber() {
    let (stream, _storage) = memory_stream();
    stream.open().await.unwrap();
    let mut slow = stream.open_buffer_subscription("slow").unwrap();
    let writer = stream.writer(1).unwrap();
    let payload = vec![7u8; 512];

    let mut written = 0u64;
    loop {
        match writer.write(&payload) {
            Ok(_) => written += 1,
            Err(e) => {
                assert!(matches!(e, QuillError::Blocked { .. }));
                break;
            }
        }
    }
    assert!(written > 0);

    let (retried, drained) = tokio::join!(writer.write_with_retry(&payload, 10_000), async {
        let appended = wait_for(&stream, Position::new(written)).await;
        let mut frames = 0;
        while frames < written as usize {
            frames += slow.poll(|_| FragmentResult::Consume, 64).unwrap();
            tokio::task::yield_now().await;
        }
        (appended, frames)
    });
    retried.unwrap();
    assert_eq!(drained.0, Position::new(written));
    assert_eq!(drained.1, written as usize);

    wait_for(&stream, Position::new(written + 1)).await;
    stream.close().await.unwrap();
}

#[tokio::test]
async fn claimed_frames_are_appended() {
    let (stream, storage) = memory_stream();
    stream.open().await.unwrap();
    let writer = stream.writer(9).unwrap();

    let mut claim = writer.claim(4).unwrap();
    claim.buffer_mut().copy_from_slice(b"ping");
    claim.commit();
    // An aborted claim leaves padding that is never appended.
    writer.claim(8).unwrap().abort();
    writer.write(b"pong").unwrap();

    wait_for(&stream, Position::new(2)).await;
    assert_eq!(storage.len(), 2);
    let payloads: Vec<_> = stream.reader().map(|r| r.unwrap().payload).collect();
    assert_eq!(payloads, vec![b"ping".to_vec(), b"pong".to_vec()]);

    stream.close().await.unwrap();
}

#[tokio::test]
async fn oversized_claims_are_rejected() {
    let (stream, storage) = memory_stream();
    stream.open().await.unwrap();
    let writer = stream.writer(1).unwrap();
    let tail = stream.write_buffer().unwrap().tail_position();

    for length in [usize::MAX, usize::MAX - 7, i32::MAX as usize] {
        assert!(matches!(
            writer.claim(length),
            Err(QuillError::FrameTooLarge { .. })
        ));
    }
    assert_eq!(stream.write_buffer().unwrap().tail_position(), tail);

    writer.write(b"fits").unwrap();
    wait_for(&stream, Position::FIRST).await;
    assert_eq!(storage.len(), 1);

    stream.close().await.unwrap();
}
