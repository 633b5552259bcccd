//! Tideline Lease Stress Test
//!
//! Opens several independent [`EventStore`] instances (each with its own
//! connection pool) on one database file and lets them compete for the same
//! consumer subscription while a producer keeps committing.
//!
//! Passes when every event is handled exactly once and the subscription
//! watermark ends on the last event.
//!
//! # Examples
//!
//! ```bash
//! # Default: 4 instances x 2 workers, 2000 events
//! cargo run --release --bin lease_stress
//!
//! # Heavier contention with small batches
//! cargo run --release --bin lease_stress -- --instances 8 --workers 4 --limit 3
//!
//! RUST_LOG=tideline=debug cargo run --bin lease_stress
//!
//! # Against an existing database; it must hold no events unless --reset
//! cargo run --bin lease_stress -- --config stress.toml --reset
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::Parser;
use serde_json::json;
use tempfile::TempDir;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tideline::consumer::{Consumer, ConsumerConfig, EventHandler};
use tideline::{
    CommittedEvent, EventId, EventMetadata, EventStore, Message, PollOptions, Result, StoreConfig,
};

const CONSUMER: &str = "stress";

#[derive(Debug, Parser)]
#[command(name = "lease_stress", about = "Competing-consumer stress test for tideline")]
struct Args {
    /// Store instances sharing the database file
    #[arg(short, long, default_value_t = 4)]
    instances: usize,

    /// Competing consumers per instance
    #[arg(short, long, default_value_t = 2)]
    workers: usize,

    /// Events to commit
    #[arg(short, long, default_value_t = 2000)]
    events: usize,

    /// Streams the events are spread over
    #[arg(short, long, default_value_t = 50)]
    streams: usize,

    /// Maximum events per lease
    #[arg(short, long, default_value_t = 10)]
    limit: usize,

    /// Lease timeout in milliseconds
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,

    /// TOML store config; the database path defaults to a temp file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Wipe the configured database first. Without it, a --config database
    /// must hold no events or subscriptions.
    #[arg(long)]
    reset: bool,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 120)]
    deadline_secs: u64,
}

/// Counts how often each event id was handled.
struct Tally {
    seen: Arc<Mutex<HashMap<EventId, u32>>>,
    batches: Arc<AtomicU64>,
}

#[async_trait]
impl EventHandler for Tally {
    async fn handle(&self, events: &[CommittedEvent]) -> Result<Option<EventId>> {
        {
            let mut seen = match self.seen.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for event in events {
                *seen.entry(event.id).or_insert(0) += 1;
            }
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        tokio::task::yield_now().await;
        Ok(None)
    }
}

/// Store config plus the temp dir backing it, if the binary created one.
/// The directory is removed when the `TempDir` drops.
fn store_config(args: &Args) -> Result<(StoreConfig, Option<TempDir>)> {
    let (config, scratch) = match &args.config {
        Some(path) => (StoreConfig::from_file(path)?, None),
        None => {
            let dir = tempfile::Builder::new()
                .prefix("tideline-stress-")
                .tempdir()
                .map_err(|e| tideline::Error::Config(format!("cannot create temp dir: {e}")))?;
            (StoreConfig::new(dir.path().join("stress.db")), Some(dir))
        }
    };
    Ok((config.with_pool_size(args.workers + 1), scratch))
}

/// Makes sure the run starts from an empty log without touching data the
/// caller did not ask to lose.
async fn prepare(store: &EventStore, config: &StoreConfig, args: &Args, scratch: bool) -> Result<()> {
    if scratch {
        return Ok(());
    }
    if args.reset {
        warn!(path = %config.path.display(), "resetting database");
        return store.reset().await;
    }
    let events: i64 = store.stats().await?.iter().map(|s| s.count).sum();
    let subscriptions = store.subscriptions().await?.len();
    if events > 0 || subscriptions > 0 {
        return Err(tideline::Error::InvalidArgument(format!(
            "database holds {events} events and {subscriptions} subscriptions; pass --reset to wipe it"
        )));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tideline=info")))
        .init();

    let args = Args::parse();
    let (config, scratch) = match store_config(&args) {
        Ok(pair) => pair,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let outcome = run(&args, config, scratch.is_some()).await;
    drop(scratch);
    match outcome {
        Ok(true) => {
            println!("Lease stress test PASSED ✓");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("Lease stress test FAILED");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(error = %err, "lease stress test aborted");
            ExitCode::FAILURE
        }
    }
}

/// Runs the workload; `Ok(false)` means an invariant was violated.
async fn run(args: &Args, config: StoreConfig, scratch: bool) -> Result<bool> {
    println!("Tideline Lease Stress Test");
    println!("==========================");
    println!("Instances:   {}", args.instances);
    println!("Workers:     {} per instance", args.workers);
    println!("Events:      {}", args.events);
    println!("Streams:     {}", args.streams);
    println!("Lease limit: {}", args.limit);
    println!("Database:    {}", config.path.display());
    println!();

    let mut stores = Vec::with_capacity(args.instances);
    for _ in 0..args.instances.max(1) {
        stores.push(EventStore::open(config.clone()).await?);
    }
    prepare(&stores[0], &config, args, scratch).await?;

    let seen = Arc::new(Mutex::new(HashMap::new()));
    let batches = Arc::new(AtomicU64::new(0));
    let finished = Arc::new(AtomicBool::new(false));
    let poll = PollOptions::new(Duration::from_millis(args.timeout_ms)).limit(args.limit);

    let start = Instant::now();

    let mut workers = Vec::new();
    for store in &stores {
        for _ in 0..args.workers.max(1) {
            let consumer = Consumer::new(
                store.clone(),
                ConsumerConfig::new(CONSUMER).with_poll(poll.clone()),
                Tally {
                    seen: Arc::clone(&seen),
                    batches: Arc::clone(&batches),
                },
            );
            let finished = Arc::clone(&finished);
            workers.push(tokio::spawn(async move {
                while !finished.load(Ordering::Acquire) {
                    if let Err(err) = consumer.drain().await {
                        error!(error = %err, "drain failed");
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            }));
        }
    }

    let producer = {
        let store = stores[0].clone();
        let events = args.events;
        let streams = args.streams.max(1);
        tokio::spawn(async move {
            for i in 0..events {
                let message = Message::new("Stressed", json!({ "n": i }));
                store
                    .commit(format!("stress-{}", i % streams), vec![message], EventMetadata::default(), None)
                    .await?;
            }
            Ok::<_, tideline::Error>(())
        })
    };
    match producer.await {
        Ok(result) => result?,
        Err(err) => return Err(tideline::Error::InvalidArgument(format!("producer panicked: {err}"))),
    }
    info!(events = args.events, elapsed = ?start.elapsed(), "producer finished");

    let last = EventId::from_raw(args.events as i64 - 1);
    let deadline = start + Duration::from_secs(args.deadline_secs);
    let mut watermark = EventId::NONE;
    while Instant::now() < deadline {
        watermark = stores[0]
            .subscriptions()
            .await?
            .into_iter()
            .find(|s| s.consumer == CONSUMER)
            .map(|s| s.watermark)
            .unwrap_or(EventId::NONE);
        if watermark >= last {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    finished.store(true, Ordering::Release);
    for worker in workers {
        let _ = worker.await;
    }
    let elapsed = start.elapsed();

    let seen = match seen.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    let duplicates = seen.values().filter(|&&n| n > 1).count();
    let missing = (0..args.events as i64)
        .filter(|id| !seen.contains_key(&EventId::from_raw(*id)))
        .count();

    println!("Results");
    println!("-------");
    println!("Batches:         {}", batches.load(Ordering::Relaxed));
    println!("Handled events:  {}", seen.len());
    println!("Duplicates:      {duplicates}");
    println!("Missing:         {missing}");
    println!("Watermark:       {watermark}");
    println!("Duration:        {elapsed:?}");
    println!(
        "Throughput:      {:.2} events/sec",
        seen.len() as f64 / elapsed.as_secs_f64()
    );
    println!();

    for store in stores {
        store.shutdown().await;
    }

    Ok(duplicates == 0 && missing == 0 && watermark >= last)
}
