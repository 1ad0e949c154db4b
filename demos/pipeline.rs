// Run with: RUST_LOG=info cargo run --example pipeline -- <num_messages>
//
// Two-stage hand-off: "validate" flags odd records failed, "commit" only
// ever sees records validate has released, and reads them in blocks.
use dmxp_dispatcher::Dispatcher::{DispatcherBuilder, Fragment, FragmentOutcome};
use dmxp_dispatcher::DispatchMode;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
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
            .with_name("pipeline-demo")
            .with_mode(DispatchMode::Pipeline)
            .with_subscriptions(["validate", "commit"])
            .build()?,
    );
    let mut validate = dispatcher.take_subscription("validate")?;
    let mut commit = dispatcher.take_subscription("commit")?;

    let running = Arc::new(AtomicBool::new(true));
    let running_for_handler = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_for_handler.store(false, Ordering::SeqCst);
    })?;

    let validator = {
        let running = Arc::clone(&running);
        thread::spawn(move || {
            let mut seen = 0u64;
            while seen < total && running.load(Ordering::Acquire) {
                let read = validate.poll(
                    &mut |fragment: &Fragment<'_>| {
                        if fragment.stream_id() % 2 == 1 {
                            FragmentOutcome::Failed
                        } else {
                            FragmentOutcome::Consume
                        }
                    },
                    128,
                );
                seen += read as u64;
                if read == 0 {
                    thread::yield_now();
                }
            }
            seen
        })
    };

    let committer = {
        let running = Arc::clone(&running);
        thread::spawn(move || {
            let (mut committed, mut rejected, mut blocks) = (0u64, 0u64, 0u64);
            while committed + rejected < total && running.load(Ordering::Acquire) {
                let Some(block) = commit.peek_block(16 * 1024, false) else {
                    thread::yield_now();
                    continue;
                };
                for fragment in block.fragments() {
                    if fragment.is_failed() {
                        rejected += 1;
                    } else {
                        committed += 1;
                    }
                }
                blocks += 1;
                block.mark_completed();
            }
            println!("commit: {committed} committed, {rejected} rejected, {blocks} blocks");
        })
    };

    for value in 0..total {
        let record = value.to_le_bytes();
        loop {
            if !running.load(Ordering::Acquire) {
                break;
            }
            let admission = dispatcher.offer_with_stream(&record, (value % 2) as i32)?;
            if admission.is_admitted() {
                break;
            }
            thread::yield_now();
        }
    }

    let validated = validator.join().map_err(|_| "validator panicked")?;
    committer.join().map_err(|_| "committer panicked")?;
    println!("validate: {validated} records");
    println!("{dispatcher:?}");
    Ok(())
}
