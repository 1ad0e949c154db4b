// Run with: RUST_LOG=debug cargo run --example pubsub -- <num_messages>
//
// One producer thread, two subscribers reading every message at different
// speeds. The slower one drives backpressure; the producer counts refusals.
use dmxp_dispatcher::Dispatcher::{Admission, DispatcherBuilder, Fragment, FragmentOutcome, Subscription};
use std::env;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

fn reader(mut subscription: Subscription, running: Arc<AtomicBool>, total: u64, pause: Duration) -> u64 {
    let mut received = 0u64;
    let mut checksum = 0u64;
    while received < total && running.load(Ordering::Acquire) {
        let read = subscription.poll(
            &mut |fragment: &Fragment<'_>| {
                checksum = checksum.wrapping_add(u64::from_le_bytes(fragment.payload()[..8].try_into().unwrap_or_default()));
                FragmentOutcome::Consume
            },
            64,
        );
        received += read as u64;
        if read == 0 || !pause.is_zero() {
            thread::sleep(pause.max(Duration::from_micros(50)));
        }
    }
    println!(
        "{}: received {received} messages, checksum {checksum}",
        subscription.name()
    );
    received
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <num_messages>", args[0]);
        std::process::exit(1);
    }
    let total: u64 = args[1].parse()?;

    let dispatcher = Arc::new(
        DispatcherBuilder::new()
            .with_name("pubsub-demo")
            .with_subscriptions(["fast"])
            .build()?,
    );
    let fast = dispatcher.take_subscription("fast")?;
    let slow = dispatcher.open_subscription("slow").await?;

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_for_handler.store(false, Ordering::SeqCst);
    })?;

    let backpressured = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    let producer = {
        let dispatcher = Arc::clone(&dispatcher);
        let running = Arc::clone(&running);
        let backpressured = Arc::clone(&backpressured);
        thread::spawn(move || {
            let mut message = [0u8; 100];
            for value in 0..total {
                message[..8].copy_from_slice(&value.to_le_bytes());
                loop {
                    if !running.load(Ordering::Acquire) {
                        return;
                    }
                    match dispatcher.offer(&message) {
                        Ok(Admission::Admitted(_)) => break,
                        Ok(Admission::PaddingAtEnd) => {}
                        Ok(Admission::Backpressured) => {
                            backpressured.fetch_add(1, Ordering::Relaxed);
                            thread::yield_now();
                        }
                        Err(err) => {
                            eprintln!("producer: {err}");
                            return;
                        }
                    }
                }
            }
        })
    };

    let readers = [
        (fast, Duration::ZERO),
        (slow, Duration::from_micros(200)),
    ]
    .map(|(subscription, pause)| {
        let running = Arc::clone(&running);
        thread::spawn(move || reader(subscription, running, total, pause))
    });

    producer.join().map_err(|_| "producer panicked")?;
    for handle in readers {
        handle.join().map_err(|_| "reader panicked")?;
    }

    println!(
        "published {total} messages in {:.2?}, {} backpressured offers",
        start.elapsed(),
        backpressured.load(Ordering::Relaxed)
    );
    println!("{dispatcher:?}");
    dispatcher.close();
    Ok(())
}
