use dmxp_dispatcher::Dispatcher::{
    Admission, Dispatcher, DispatcherBuilder, Fragment, FragmentOutcome, Subscription,
};
use dmxp_dispatcher::{DispatcherError, IdleConfig};
use std::thread;

const PARTITION_SIZE: usize = 64 * 1024;

fn fast_idle() -> IdleConfig {
    IdleConfig {
        min_park_micros: 1,
        max_park_micros: 100,
    }
}

fn dispatcher_with(subscriptions: &[&str]) -> Dispatcher {
    DispatcherBuilder::new()
        .with_name("test")
        .with_buffer_size(3 * PARTITION_SIZE)
        .with_subscriptions(subscriptions.iter().copied())
        .with_idle(fast_idle())
        .build()
        .unwrap()
}

fn drain(subscription: &mut Subscription) -> Vec<(Vec<u8>, i32)> {
    let mut received = Vec::new();
    subscription.poll(
        &mut |fragment: &Fragment<'_>| {
            received.push((fragment.payload().to_vec(), fragment.stream_id()));
            FragmentOutcome::Consume
        },
        usize::MAX,
    );
    received
}

/// Offer until admitted, draining `subscription` whenever the limit blocks.
fn offer_draining(
    dispatcher: &Dispatcher,
    subscription: &mut Subscription,
    message: &[u8],
    received: &mut Vec<Vec<u8>>,
) -> i64 {
    loop {
        match dispatcher.offer(message).unwrap() {
            Admission::Admitted(position) => return position,
            Admission::PaddingAtEnd => continue,
            Admission::Backpressured => {
                subscription.poll(
                    &mut |fragment: &Fragment<'_>| {
                        received.push(fragment.payload().to_vec());
                        FragmentOutcome::Consume
                    },
                    usize::MAX,
                );
                dispatcher.update_publisher_limit();
            }
        }
    }
}

#[test]
fn offered_messages_are_polled_in_order() {
    let dispatcher = dispatcher_with(&["reader"]);
    let mut reader = dispatcher.take_subscription("reader").unwrap();

    let mut last_position = 0;
    for i in 0..100u32 {
        let payload = format!("message-{i}");
        let position = dispatcher
            .offer_with_stream(payload.as_bytes(), (i % 3) as i32)
            .unwrap()
            .position();
        assert!(position > last_position);
        last_position = position;
    }
    assert_eq!(dispatcher.publisher_position(), last_position);

    let received = drain(&mut reader);
    assert_eq!(received.len(), 100);
    for (i, (payload, stream_id)) in received.iter().enumerate() {
        assert_eq!(payload, format!("message-{i}").as_bytes());
        assert_eq!(*stream_id, (i % 3) as i32);
    }
    assert_eq!(reader.position(), last_position);
    assert!(!reader.has_available());
}

#[test]
fn empty_payload_round_trips() {
    let dispatcher = dispatcher_with(&["reader"]);
    let mut reader = dispatcher.take_subscription("reader").unwrap();
    assert!(dispatcher.offer(&[]).unwrap().is_admitted());
    assert!(dispatcher.offer(b"x").unwrap().is_admitted());

    let received = drain(&mut reader);
    assert_eq!(received, vec![(vec![], 0), (b"x".to_vec(), 0)]);
}

#[test]
fn fragment_position_matches_offer_position() {
    let dispatcher = dispatcher_with(&["reader"]);
    let mut reader = dispatcher.take_subscription("reader").unwrap();
    let offered: Vec<i64> = (0..5)
        .map(|_| dispatcher.offer(b"abc").unwrap().position())
        .collect();

    let mut seen = Vec::new();
    reader.poll(
        &mut |fragment: &Fragment<'_>| {
            seen.push(fragment.position());
            FragmentOutcome::Consume
        },
        10,
    );
    assert_eq!(seen, offered);
}

#[test]
fn committed_claim_reads_like_an_offer() {
    let dispatcher = dispatcher_with(&["reader"]);
    let mut reader = dispatcher.take_subscription("reader").unwrap();

    let mut claim = dispatcher.claim(5, 7).unwrap().admitted().unwrap();
    claim.buffer_mut().copy_from_slice(b"hello");
    let position = claim.position();
    // nothing visible before commit
    assert!(drain(&mut reader).is_empty());
    claim.commit();

    assert_eq!(drain(&mut reader), vec![(b"hello".to_vec(), 7)]);
    assert_eq!(reader.position(), position);
}

#[test]
fn aborted_claim_is_skipped_but_advances() {
    let dispatcher = dispatcher_with(&["reader"]);
    let mut reader = dispatcher.take_subscription("reader").unwrap();

    dispatcher.offer(b"before").unwrap();
    let claim = dispatcher.claim(64, 0).unwrap().admitted().unwrap();
    let aborted_position = claim.position();
    claim.abort();
    // an unfinished claim aborts itself on drop
    drop(dispatcher.claim(16, 0).unwrap().admitted().unwrap());
    let last = dispatcher.offer(b"after").unwrap().position();

    let received = drain(&mut reader);
    assert_eq!(
        received,
        vec![(b"before".to_vec(), 0), (b"after".to_vec(), 0)]
    );
    assert!(reader.position() > aborted_position);
    assert_eq!(reader.position(), last);
}

#[test]
fn pending_claim_blocks_later_frames_until_committed() {
    let dispatcher = dispatcher_with(&["reader"]);
    let mut reader = dispatcher.take_subscription("reader").unwrap();

    let mut claim = dispatcher.claim(4, 0).unwrap().admitted().unwrap();
    dispatcher.offer(b"second").unwrap();
    assert!(drain(&mut reader).is_empty());

    claim.buffer_mut().copy_from_slice(b"1st!");
    claim.commit();
    assert_eq!(
        drain(&mut reader),
        vec![(b"1st!".to_vec(), 0), (b"second".to_vec(), 0)]
    );
}

#[test]
fn oversized_frames_are_rejected() {
    let dispatcher = dispatcher_with(&[]);
    let max = dispatcher.max_frame_length();
    assert_eq!(max, PARTITION_SIZE / 16);

    let err = dispatcher.offer(&vec![0u8; max]).unwrap_err();
    assert!(matches!(err, DispatcherError::FrameTooLarge { .. }));
    assert!(err.is_caller_misuse());
    assert!(matches!(
        dispatcher.claim(max, 0),
        Err(DispatcherError::FrameTooLarge { .. })
    ));

    // the largest payload that still fits
    assert!(dispatcher.offer(&vec![0u8; max - 16]).unwrap().is_admitted());
}

#[test]
fn backpressure_starts_at_window_and_clears_after_reading() {
    let dispatcher = dispatcher_with(&["slow"]);
    let mut slow = dispatcher.take_subscription("slow").unwrap();
    let window = dispatcher.layout().window_length as i64;

    let message = [7u8; 100];
    let mut admitted = 0;
    let refusal = loop {
        match dispatcher.offer(&message).unwrap() {
            Admission::Admitted(_) => admitted += 1,
            refused => break refused,
        }
    };
    assert_eq!(refusal, Admission::Backpressured);
    assert_eq!(refusal.sentinel(), Some(-1));
    assert!(dispatcher.publisher_position() - slow.position() >= window);

    // the conductor cannot move the limit while the reader stands still
    thread::sleep(std::time::Duration::from_millis(10));
    assert_eq!(dispatcher.offer(&message).unwrap(), Admission::Backpressured);

    assert_eq!(drain(&mut slow).len(), admitted);
    dispatcher.update_publisher_limit();
    assert!(dispatcher.offer(&message).unwrap().is_admitted());
}

#[test]
fn reading_continues_across_partitions() {
    let dispatcher = dispatcher_with(&["reader"]);
    let mut reader = dispatcher.take_subscription("reader").unwrap();

    // many partition rotations, so every partition is reused and cleaned
    let mut expected = Vec::new();
    let mut received = Vec::new();
    for i in 0..4_000u32 {
        let len = fastrand::usize(4..1_500);
        let mut payload = vec![(i % 251) as u8; len];
        payload[..4].copy_from_slice(&i.to_le_bytes());
        offer_draining(&dispatcher, &mut reader, &payload, &mut received);
        expected.push(payload);
    }
    received.extend(drain(&mut reader).into_iter().map(|(payload, _)| payload));

    assert!(dispatcher.active_partition_id() >= 6);
    assert_eq!(received.len(), expected.len());
    assert!(received == expected);
    assert_eq!(reader.position(), dispatcher.publisher_position());
}

#[test]
fn wide_window_never_cleans_unread_frames() {
    // a window just short of a partition lets production rotate while the
    // reader is still inside the partition that gets recycled next
    let dispatcher = DispatcherBuilder::new()
        .with_name("wide-window")
        .with_buffer_size(3 * PARTITION_SIZE)
        .with_window_length(PARTITION_SIZE - 8)
        .with_subscriptions(["reader"])
        .with_idle(fast_idle())
        .build()
        .unwrap();
    let mut reader = dispatcher.take_subscription("reader").unwrap();
    let total = 3_000u32;

    let mut received = Vec::new();
    let mut read_one = |reader: &mut Subscription| {
        reader.poll(
            &mut |fragment: &Fragment<'_>| {
                received.push(u32::from_le_bytes(fragment.payload()[..4].try_into().unwrap()));
                FragmentOutcome::Consume
            },
            1,
        )
    };

    for i in 0..total {
        // large frames near the end of a partition cross it early
        let tail = (dispatcher.publisher_position() & 0xFFFF_FFFF) as usize;
        let len = if tail > PARTITION_SIZE - 1_200 { 3_000 } else { 100 };
        let mut payload = vec![0u8; len];
        payload[..4].copy_from_slice(&i.to_le_bytes());

        let mut stalled = 0;
        loop {
            match dispatcher.offer(&payload).unwrap() {
                Admission::Admitted(_) => break,
                Admission::PaddingAtEnd => {}
                Admission::Backpressured => {
                    if read_one(&mut reader) == 0 {
                        stalled += 1;
                        assert!(stalled < 10_000, "reader wedged at {:#x}", reader.position());
                    }
                    dispatcher.update_publisher_limit();
                }
            }
        }
    }
    while reader.position() < dispatcher.publisher_position() {
        assert_ne!(read_one(&mut reader), 0, "reader wedged at {:#x}", reader.position());
    }

    assert!(dispatcher.active_partition_id() >= 3);
    assert_eq!(received.len(), total as usize);
    assert!(received.iter().copied().eq(0..total));
}

#[test]
fn partition_end_is_padded_once() {
    let dispatcher = dispatcher_with(&["reader"]);
    let mut reader = dispatcher.take_subscription("reader").unwrap();
    let frame = vec![1u8; 1_000 - 12];
    let mut received = Vec::new();

    let mut paddings = 0;
    let mut offered = 0;
    while dispatcher.active_partition_id() == 0 {
        match dispatcher.offer(&frame).unwrap() {
            Admission::Admitted(_) => offered += 1,
            Admission::PaddingAtEnd => paddings += 1,
            Admission::Backpressured => {
                received.extend(drain(&mut reader));
                dispatcher.update_publisher_limit();
            }
        }
    }
    assert_eq!(paddings, 1);

    // next frame lands at the start of partition 1
    let position = dispatcher.offer(&frame).unwrap().position();
    assert_eq!(position, (1i64 << 32) | 1_000);
    received.extend(drain(&mut reader));
    assert_eq!(received.len(), offered + 1);
}

#[test]
fn closed_dispatcher_rejects_publishes() {
    let dispatcher = dispatcher_with(&["reader"]);
    let mut reader = dispatcher.take_subscription("reader").unwrap();
    dispatcher.offer(b"pending").unwrap();

    dispatcher.close();
    dispatcher.close();
    assert!(dispatcher.is_closed());
    assert!(matches!(dispatcher.offer(b"x"), Err(DispatcherError::Closed)));
    assert!(matches!(dispatcher.claim(1, 0), Err(DispatcherError::Closed)));
    assert!(reader.is_closed());
    assert!(drain(&mut reader).is_empty());
}

#[test]
fn concurrent_producers_keep_per_producer_order() {
    let dispatcher = dispatcher_with(&["reader"]);
    let mut reader = dispatcher.take_subscription("reader").unwrap();
    let producers = 4u32;
    let per_producer = 2_000u32;

    let mut seen = Vec::with_capacity((producers * per_producer) as usize);
    thread::scope(|scope| {
        for producer in 0..producers {
            let dispatcher = &dispatcher;
            scope.spawn(move || {
                for seq in 0..per_producer {
                    let mut payload = [0u8; 8];
                    payload[..4].copy_from_slice(&producer.to_le_bytes());
                    payload[4..].copy_from_slice(&seq.to_le_bytes());
                    while !dispatcher.offer(&payload).unwrap().is_admitted() {
                        thread::yield_now();
                    }
                }
            });
        }

        while seen.len() < (producers * per_producer) as usize {
            reader.poll(
                &mut |fragment: &Fragment<'_>| {
                    let bytes = fragment.payload();
                    let producer = u32::from_le_bytes(bytes[..4].try_into().unwrap());
                    let seq = u32::from_le_bytes(bytes[4..].try_into().unwrap());
                    seen.push((producer, seq));
                    FragmentOutcome::Consume
                },
                64,
            );
        }
    });

    let mut next_seq = vec![0u32; producers as usize];
    for (producer, seq) in seen {
        assert_eq!(next_seq[producer as usize], seq, "producer {producer} out of order");
        next_seq[producer as usize] += 1;
    }
    assert!(next_seq.iter().all(|n| *n == per_producer));
}
