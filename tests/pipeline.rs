use dmxp_dispatcher::Dispatcher::{Dispatcher, DispatcherBuilder, Fragment, FragmentOutcome, Subscription};
use dmxp_dispatcher::DispatchMode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

const PARTITION_SIZE: usize = 64 * 1024;

fn pipeline(stages: &[&str]) -> Dispatcher {
    DispatcherBuilder::new()
        .with_name("pipeline")
        .with_buffer_size(3 * PARTITION_SIZE)
        .with_mode(DispatchMode::Pipeline)
        .with_subscriptions(stages.iter().copied())
        .build()
        .unwrap()
}

fn read(subscription: &mut Subscription, max_fragments: usize) -> Vec<u32> {
    let mut values = Vec::new();
    subscription.poll(
        &mut |fragment: &Fragment<'_>| {
            values.push(u32::from_le_bytes(fragment.payload().try_into().unwrap()));
            FragmentOutcome::Consume
        },
        max_fragments,
    );
    values
}

#[test]
fn later_stage_only_sees_what_earlier_stage_consumed() {
    let dispatcher = pipeline(&["a", "b"]);
    let mut a = dispatcher.take_subscription("a").unwrap();
    let mut b = dispatcher.take_subscription("b").unwrap();
    for i in 0..10u32 {
        dispatcher.offer(&i.to_le_bytes()).unwrap();
    }

    assert!(read(&mut b, 100).is_empty());
    assert!(!b.has_available());

    assert_eq!(read(&mut a, 4), vec![0, 1, 2, 3]);
    assert_eq!(b.limit(), a.position());
    assert_eq!(read(&mut b, 100), vec![0, 1, 2, 3]);
    assert!(read(&mut b, 100).is_empty());

    assert_eq!(read(&mut a, 100), (4..10).collect::<Vec<_>>());
    assert_eq!(read(&mut b, 100), (4..10).collect::<Vec<_>>());
    assert_eq!(b.position(), dispatcher.publisher_position());
}

#[test]
fn postponed_fragment_holds_back_next_stage() {
    let dispatcher = pipeline(&["a", "b"]);
    let mut a = dispatcher.take_subscription("a").unwrap();
    let mut b = dispatcher.take_subscription("b").unwrap();
    for i in 0..3u32 {
        dispatcher.offer(&i.to_le_bytes()).unwrap();
    }

    a.peek_and_consume(
        &mut |fragment: &Fragment<'_>| {
            if fragment.payload() == 1u32.to_le_bytes() {
                FragmentOutcome::Postpone
            } else {
                FragmentOutcome::Consume
            }
        },
        10,
    );
    assert_eq!(read(&mut b, 10), vec![0]);
}

#[test]
fn publisher_limit_follows_last_stage() {
    let dispatcher = pipeline(&["a", "b"]);
    let mut a = dispatcher.take_subscription("a").unwrap();
    let window = dispatcher.layout().window_length as i64;

    let frame = [0u8; 500];
    while dispatcher.offer(&frame).unwrap().is_admitted() {}
    assert!(dispatcher.publisher_position() >= window);

    // the first stage draining everything does not free the producer
    while !read_raw(&mut a).is_empty() {}
    dispatcher.update_publisher_limit();
    assert!(!dispatcher.offer(&frame).unwrap().is_admitted());

    let mut b = dispatcher.take_subscription("b").unwrap();
    while !read_raw(&mut b).is_empty() {}
    dispatcher.update_publisher_limit();
    assert!(dispatcher.offer(&frame).unwrap().is_admitted());
}

fn read_raw(subscription: &mut Subscription) -> Vec<usize> {
    let mut lengths = Vec::new();
    subscription.poll(
        &mut |fragment: &Fragment<'_>| {
            lengths.push(fragment.len());
            FragmentOutcome::Consume
        },
        16,
    );
    lengths
}

#[test]
fn three_stage_pipeline_with_block_reads() {
    let dispatcher = pipeline(&["parse", "apply", "ack"]);
    let total = 5_000u32;
    let acked = AtomicUsize::new(0);

    thread::scope(|scope| {
        for stage in ["parse", "apply"] {
            let mut subscription = dispatcher.take_subscription(stage).unwrap();
            let dispatcher = &dispatcher;
            scope.spawn(move || {
                let mut next = 0u32;
                while next < total && !dispatcher.is_closed() {
                    let Some(block) = subscription.peek_block(4096, false) else {
                        thread::yield_now();
                        continue;
                    };
                    for fragment in block.fragments() {
                        assert_eq!(u32::from_le_bytes(fragment.payload().try_into().unwrap()), next);
                        next += 1;
                    }
                    block.mark_completed();
                }
            });
        }

        let mut ack = dispatcher.take_subscription("ack").unwrap();
        let acked = &acked;
        let dispatcher = &dispatcher;
        scope.spawn(move || {
            let mut values = Vec::new();
            while values.len() < total as usize {
                let batch = read(&mut ack, 64);
                if batch.is_empty() {
                    thread::yield_now();
                }
                values.extend(batch);
            }
            assert!(values.iter().copied().eq(0..total));
            acked.store(values.len(), Ordering::Release);
            assert_eq!(ack.position(), dispatcher.publisher_position());
        });

        for i in 0..total {
            while !dispatcher.offer(&i.to_le_bytes()).unwrap().is_admitted() {
                thread::yield_now();
            }
        }
    });

    assert_eq!(acked.load(Ordering::Acquire), total as usize);
}
