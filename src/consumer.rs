//! Competing-consumer runtime.
//!
//! A [`Consumer`] drives the poll → handle → ack cycle for one named
//! consumer. Any number of `Consumer`s with the same name, in this process or
//! others, may run against the same log; the lease protocol guarantees only
//! one of them holds a batch at a time.
//!
//! ```text
//!            change notification ──┐
//!            idle interval ────────┤
//!                                  ▼
//!   ┌──────────────────────── drain ─────────────────────────┐
//!   │  poll ──► None ──► done                                 │
//!   │    │                                                    │
//!   │    ▼                                                    │
//!   │  handler.handle(events)                                 │
//!   │    ├── Ok ──► ack ──► true  ──► poll again              │
//!   │    │              └─► false ──► lease lost, done        │
//!   │    └── Err ──► lease left to expire, redelivered later  │
//!   └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Delivery is at-least-once. Handlers must tolerate seeing a batch again
//! after a crash or a handler error; [`ProjectorHandler`] gets this for free
//! from the projection watermark.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::EventStore;
use crate::error::{Error, Result};
use crate::projection::{Projection, ProjectionStore};
use crate::types::{CommittedEvent, EventId, PollOptions};

/// Default fallback interval between drains when no notification arrives.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(1);

/// Processes one leased batch.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handles `events`, oldest first.
    ///
    /// Returns the watermark to acknowledge, or `None` for the whole batch.
    /// An error leaves the lease unacknowledged.
    async fn handle(&self, events: &[CommittedEvent]) -> Result<Option<EventId>>;
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Subscription name shared by every competing instance.
    pub name: String,
    pub poll: PollOptions,
    pub idle_interval: Duration,
}

impl ConsumerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            poll: PollOptions::default(),
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }

    pub fn with_poll(mut self, poll: PollOptions) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }
}

struct Pump {
    store: EventStore,
    handler: Arc<dyn EventHandler>,
    config: ConsumerConfig,
    pumping: AtomicBool,
}

/// Resets the pumping flag when a drain ends, however it ends.
struct PumpGuard<'a>(&'a AtomicBool);

impl Drop for PumpGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Pump {
    async fn drain(&self) -> Result<usize> {
        if self.pumping.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        let _guard = PumpGuard(&self.pumping);

        let name = &self.config.name;
        let mut acked = 0;
        while let Some(lease) = self.store.poll(name.as_str(), self.config.poll.clone()).await? {
            let watermark = match self.handler.handle(&lease.events).await {
                Ok(watermark) => watermark,
                Err(err) => {
                    error!(consumer = %name, lease = %lease.lease, error = %err, "handler failed, lease left to expire");
                    return Err(err);
                }
            };

            if !self.store.ack(&lease, watermark).await? {
                warn!(consumer = %name, lease = %lease.lease, "lease lost before ack, batch may be redelivered");
                break;
            }
            acked += lease.events.len();
            debug!(consumer = %name, count = lease.events.len(), "batch acknowledged");
        }
        Ok(acked)
    }
}

/// One competing-consumer instance.
pub struct Consumer {
    pump: Arc<Pump>,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task_handle: Option<JoinHandle<()>>,
}

impl Consumer {
    pub fn new(store: EventStore, config: ConsumerConfig, handler: impl EventHandler) -> Self {
        Self {
            pump: Arc::new(Pump {
                store,
                handler: Arc::new(handler),
                config,
                pumping: AtomicBool::new(false),
            }),
            running: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            task_handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.pump.config.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Polls and handles batches until no lease is granted. Returns the
    /// number of events acknowledged.
    ///
    /// Returns `Ok(0)` at once if a drain is already in progress on this
    /// consumer.
    pub async fn drain(&self) -> Result<usize> {
        self.pump.drain().await
    }

    /// Spawns a task that drains on every change notification and at least
    /// once per idle interval.
    pub fn start(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidArgument(format!(
                "consumer '{}' is already running",
                self.name()
            )));
        }

        let pump = Arc::clone(&self.pump);
        let running = Arc::clone(&self.running);
        let wake = Arc::clone(&self.wake);
        self.task_handle = Some(tokio::spawn(run_consumer_loop(pump, running, wake)));

        info!(consumer = %self.name(), "consumer started");
        Ok(())
    }

    /// Stops the background task after its current drain finishes.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();

        if let Some(handle) = self.task_handle.take() {
            if let Err(err) = handle.await {
                error!(consumer = %self.name(), error = %err, "consumer task panicked");
            }
        }
        info!(consumer = %self.name(), "consumer stopped");
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

async fn run_consumer_loop(pump: Arc<Pump>, running: Arc<AtomicBool>, wake: Arc<Notify>) {
    let mut notifications = pump.store.listen();
    let mut idle = tokio::time::interval(pump.config.idle_interval.max(Duration::from_millis(1)));
    idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            received = notifications.recv() => match received {
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(consumer = %pump.config.name, skipped, "notifications lagged");
                }
                Err(RecvError::Closed) => {
                    notifications = pump.store.listen();
                }
            },
            _ = idle.tick() => {}
            _ = wake.notified() => {}
        }

        if !running.load(Ordering::SeqCst) {
            break;
        }
        if let Err(err) = pump.drain().await {
            warn!(consumer = %pump.config.name, error = %err, "drain failed");
        }
    }
}

// =============================================================================
// Projector Glue
// =============================================================================

/// Maps one committed event to the projection writes it causes.
pub trait Projector: Send + Sync + 'static {
    fn project(&self, event: &CommittedEvent) -> Option<Projection>;
}

impl<F> Projector for F
where
    F: Fn(&CommittedEvent) -> Option<Projection> + Send + Sync + 'static,
{
    fn project(&self, event: &CommittedEvent) -> Option<Projection> {
        self(event)
    }
}

/// [`EventHandler`] that commits each event's projection with the event's
/// global id as watermark, so redelivered batches are no-ops.
pub struct ProjectorHandler<P> {
    projector: P,
    store: ProjectionStore,
}

impl<P: Projector> ProjectorHandler<P> {
    pub fn new(projector: P, store: ProjectionStore) -> Self {
        Self { projector, store }
    }
}

#[async_trait]
impl<P: Projector> EventHandler for ProjectorHandler<P> {
    async fn handle(&self, events: &[CommittedEvent]) -> Result<Option<EventId>> {
        for event in events {
            match self.projector.project(event) {
                Some(projection) if !projection.is_empty() => {
                    self.store.commit(projection, event.id).await?;
                }
                _ => {}
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::StoreConfig;
    use crate::notify::ChangeNotifier;
    use crate::projection::{ColumnType, ProjectionSchema};
    use crate::types::{EventFilter, EventMetadata, Message};
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<EventId>>,
        fail_once: AtomicBool,
    }

    #[async_trait]
    impl EventHandler for Arc<Recorder> {
        async fn handle(&self, events: &[CommittedEvent]) -> Result<Option<EventId>> {
            if self.fail_once.swap(false, Ordering::SeqCst) {
                return Err(Error::InvalidArgument("boom".to_string()));
            }
            self.seen.lock().unwrap().extend(events.iter().map(|e| e.id));
            Ok(None)
        }
    }

    async fn store_with_clock(dir: &TempDir, clock: ManualClock) -> EventStore {
        EventStore::open_with(
            StoreConfig::new(dir.path().join("consumer.db")).with_pool_size(2),
            Arc::new(clock),
            ChangeNotifier::default(),
        )
        .await
        .unwrap()
    }

    async fn append(store: &EventStore, n: usize) {
        for i in 0..n {
            store
                .commit("s", vec![Message::new("Tick", json!(i))], EventMetadata::default(), None)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_drain_handles_everything_once() {
        let dir = TempDir::new().unwrap();
        let store = store_with_clock(&dir, ManualClock::default()).await;
        append(&store, 7).await;

        let recorder = Arc::new(Recorder::default());
        let consumer = Consumer::new(
            store.clone(),
            ConsumerConfig::new("counter").with_poll(PollOptions::default().limit(3)),
            Arc::clone(&recorder),
        );

        assert_eq!(consumer.drain().await.unwrap(), 7);
        assert_eq!(consumer.drain().await.unwrap(), 0);
        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen, (0..7).map(EventId::from_raw).collect::<Vec<_>>());

        let subs = store.subscriptions().await.unwrap();
        assert_eq!(subs[0].watermark, EventId::from_raw(6));
        assert!(subs[0].lease.is_none());
    }

    #[tokio::test]
    async fn test_handler_error_redelivers_after_expiry() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::default();
        let store = store_with_clock(&dir, clock.clone()).await;
        append(&store, 2).await;

        let recorder = Arc::new(Recorder::default());
        recorder.fail_once.store(true, Ordering::SeqCst);
        let consumer = Consumer::new(
            store,
            ConsumerConfig::new("flaky").with_poll(PollOptions::new(Duration::from_secs(10))),
            Arc::clone(&recorder),
        );

        assert!(consumer.drain().await.is_err());
        // Still leased by the failed attempt.
        assert_eq!(consumer.drain().await.unwrap(), 0);

        clock.advance(Duration::from_secs(10));
        assert_eq!(consumer.drain().await.unwrap(), 2);
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_started_consumer_wakes_on_commit() {
        let dir = TempDir::new().unwrap();
        let store = store_with_clock(&dir, ManualClock::default()).await;

        let recorder = Arc::new(Recorder::default());
        let mut consumer = Consumer::new(
            store.clone(),
            ConsumerConfig::new("live").with_idle_interval(Duration::from_secs(3600)),
            Arc::clone(&recorder),
        );
        consumer.start().unwrap();
        assert!(consumer.start().is_err());

        append(&store, 3).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while recorder.seen.lock().unwrap().len() < 3 {
            assert!(tokio::time::Instant::now() < deadline, "consumer never caught up");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        consumer.stop().await;
        assert!(!consumer.is_running());
    }

    #[tokio::test]
    async fn test_projector_handler_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::default();
        let store = store_with_clock(&dir, clock.clone()).await;
        append(&store, 3).await;

        let totals = ProjectionStore::new(
            store.pool().clone(),
            ProjectionSchema::new("totals").column_with_default("sum", ColumnType::Integer, json!(0)),
        )
        .unwrap();
        totals.seed().await.unwrap();

        let handler = ProjectorHandler::new(
            |event: &CommittedEvent| {
                Some(Projection::new().upsert_id(event.stream.clone(), json!({ "sum": event.data })))
            },
            totals.clone(),
        );

        let events = store.query_all(EventFilter::new()).await.unwrap();
        handler.handle(&events).await.unwrap();
        handler.handle(&events[..1]).await.unwrap();

        let records = totals.load(["s"]).await.unwrap();
        assert_eq!(records[0].state["sum"], json!(2));
        assert_eq!(records[0].watermark, EventId::from_raw(2));
    }
}
