//! # Async API for Tideline
//!
//! [`EventStore`] is the public handle to one event log. It wraps the
//! synchronous SQL in [`writer`], [`reader`] and [`lease`] with the
//! [`ConnectionPool`], so every operation is an `async fn` that waits for a
//! free connection instead of blocking the runtime.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       EventStore (Clone)                    │
//! │                                                             │
//! │  commit ──► writer::commit ──┐        ┌──► ChangeNotifier   │
//! │  query  ──► reader::query_each ─┐     │    (after COMMIT)   │
//! │  poll   ──► lease::poll ─────┐  │     │                     │
//! │  ack    ──► lease::ack  ─────┤  │     │                     │
//! │                              ▼  ▼     │                     │
//! │                        ConnectionPool ┘                     │
//! └──────────────────────────────┬──────────────────────────────┘
//!                                ▼
//!                         SQLite file (WAL)
//!                   shared with other instances
//! ```
//!
//! ## Many Instances, One Log
//!
//! Every instance opened on the same file and table sees the same log. They
//! may live in one process or in many; correctness comes from the immediate
//! transactions in the commit and lease paths, not from anything held in
//! memory here.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::notify::{ChangeNotifier, Notification};
use crate::pool::ConnectionPool;
use crate::schema::EventTables;
use crate::stream::RowStream;
use crate::types::{
    CommittedEvent, EventFilter, EventId, EventMetadata, Lease, Message, PollOptions, StoreStat,
    Subscription, Version,
};
use crate::{lease, reader, writer};

// =============================================================================
// EventStore - The Main Async Handle
// =============================================================================

/// Async handle to one event log.
///
/// # Thread Safety
///
/// `EventStore` is `Clone`, `Send` and `Sync`. All clones share the same
/// pool, clock and notifier.
///
/// # Example
///
/// ```rust,no_run
/// use serde_json::json;
/// use tideline::{EventStore, EventMetadata, Message, PollOptions, StoreConfig};
///
/// # async fn run() -> tideline::Result<()> {
/// let store = EventStore::open(StoreConfig::new("calc.db")).await?;
///
/// store
///     .commit("Calc/A", vec![Message::new("DigitPressed", json!({ "digit": "1" }))], EventMetadata::default(), None)
///     .await?;
///
/// if let Some(lease) = store.poll("worker-1", PollOptions::default()).await? {
///     // process lease.events ...
///     store.ack(&lease, None).await?;
/// }
///
/// store.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EventStore {
    pool: ConnectionPool,
    tables: Arc<EventTables>,
    clock: Arc<dyn Clock>,
    notifier: ChangeNotifier,
}

impl EventStore {
    /// Opens the log described by `config` with the system clock and a
    /// private notifier, creating its tables if needed.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let notifier = ChangeNotifier::new(config.notify_capacity);
        Self::open_with(config, Arc::new(SystemClock), notifier).await
    }

    /// Opens the log with an injected clock and a shared notifier.
    ///
    /// Instances built with clones of one notifier hear each other's commits
    /// through [`EventStore::listen`].
    pub async fn open_with(
        config: StoreConfig,
        clock: Arc<dyn Clock>,
        notifier: ChangeNotifier,
    ) -> Result<Self> {
        config.validate()?;
        let tables = Arc::new(EventTables::new(&config.table)?);
        let pool = ConnectionPool::open(
            &config.path,
            config.pool_size,
            config.busy_timeout(),
            config.stream_buffer,
        )?;

        let store = Self {
            pool,
            tables,
            clock,
            notifier,
        };
        store.seed().await?;

        info!(path = %config.path.display(), table = %config.table, "event store opened");
        Ok(store)
    }

    /// Name of the events table, also the notification channel.
    pub fn table(&self) -> &str {
        self.tables.name()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// Creates the events and subscriptions tables. Idempotent; `open`
    /// already calls it.
    pub async fn seed(&self) -> Result<()> {
        let tables = Arc::clone(&self.tables);
        self.pool.run(move |conn| tables.seed(conn)).await
    }

    /// Appends `events` to `stream` in one transaction.
    ///
    /// See [`writer::commit`] for the concurrency checks. On success every
    /// listener of this table is notified; a notification that reaches
    /// nobody is not an error.
    pub async fn commit(
        &self,
        stream: impl Into<String>,
        events: Vec<Message>,
        metadata: EventMetadata,
        expected: Option<Version>,
    ) -> Result<Vec<CommittedEvent>> {
        let stream = stream.into();
        let tables = Arc::clone(&self.tables);
        let now = self.clock.now();

        let committed = self
            .pool
            .run(move |conn| writer::commit(conn, &tables, &stream, events, &metadata, expected, now))
            .await?;

        if let (Some(first), Some(last)) = (committed.first(), committed.last()) {
            debug!(
                stream = %first.stream,
                count = committed.len(),
                first_id = %first.id,
                version = %last.version,
                "events committed"
            );
            self.notifier.notify(Notification {
                channel: self.tables.name().to_string(),
                name: first.name.clone(),
                id: first.id,
                last_id: last.id,
            });
        }

        Ok(committed)
    }

    /// Lazily streams the events matching `filter`.
    ///
    /// Each call re-scans the store; the returned stream cannot be restarted.
    pub async fn query(&self, filter: EventFilter) -> Result<RowStream<CommittedEvent>> {
        let tables = Arc::clone(&self.tables);
        self.pool
            .stream(move |conn, sink| {
                reader::query_each(conn, &tables, &filter, |event| sink.push(event)).map(|_| ())
            })
            .await
    }

    /// Collects the events matching `filter` into a `Vec`.
    pub async fn query_all(&self, filter: EventFilter) -> Result<Vec<CommittedEvent>> {
        let tables = Arc::clone(&self.tables);
        self.pool
            .run(move |conn| reader::query(conn, &tables, &filter))
            .await
    }

    /// Current version of `stream`, [`Version::NONE`] when empty.
    pub async fn stream_version(&self, stream: impl Into<String>) -> Result<Version> {
        let stream = stream.into();
        let tables = Arc::clone(&self.tables);
        self.pool
            .run(move |conn| reader::stream_version(conn, &tables, &stream))
            .await
    }

    /// Per-event-name counts and id/time ranges.
    pub async fn stats(&self) -> Result<Vec<StoreStat>> {
        let tables = Arc::clone(&self.tables);
        self.pool.run(move |conn| reader::stats(conn, &tables)).await
    }

    /// Deletes every event and subscription. Never call this outside tests.
    pub async fn reset(&self) -> Result<()> {
        let tables = Arc::clone(&self.tables);
        self.pool.run(move |conn| writer::reset(conn, &tables)).await?;
        warn!(table = %self.tables.name(), "event store reset");
        Ok(())
    }

    // =========================================================================
    // Competing Consumers
    // =========================================================================

    /// Leases the next batch of unacknowledged events for `consumer`.
    ///
    /// `None` is the normal "no work for you" answer: either another poller
    /// holds an unexpired lease, or nothing is past the watermark.
    pub async fn poll(&self, consumer: impl Into<String>, options: PollOptions) -> Result<Option<Lease>> {
        let consumer = consumer.into();
        let tables = Arc::clone(&self.tables);
        let now = self.clock.now();
        self.pool
            .run(move |conn| lease::poll(conn, &tables, &consumer, &options, now))
            .await
    }

    /// Releases `lease`, advancing the watermark to `watermark` or, when
    /// `None`, to the last event in the lease.
    ///
    /// `false` means the lease was stale: it expired or was reassigned, and
    /// any local progress on it should be discarded.
    pub async fn ack(&self, lease: &Lease, watermark: Option<EventId>) -> Result<bool> {
        let consumer = lease.consumer.clone();
        let token = lease.lease.clone();
        let watermark = watermark.or_else(|| lease.last_id()).unwrap_or(lease.watermark);
        let tables = Arc::clone(&self.tables);
        let now = self.clock.now();
        self.pool
            .run(move |conn| lease::ack(conn, &tables, &consumer, &token, watermark, now))
            .await
    }

    /// Every consumer subscription of this log.
    pub async fn subscriptions(&self) -> Result<Vec<Subscription>> {
        let tables = Arc::clone(&self.tables);
        self.pool
            .run(move |conn| lease::subscriptions(conn, &tables))
            .await
    }

    /// Receiver for this table's commit notifications.
    pub fn listen(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe(self.tables.name())
    }

    /// Finishes queued work and stops the connection threads. Other clones
    /// get [`crate::Error::PoolClosed`] afterwards.
    pub async fn shutdown(self) {
        self.pool.shutdown().await;
    }
}

// =============================================================================
// Tests
// =============================================================================
