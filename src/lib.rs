//! # Tideline - Event Log and Projections on SQLite
//!
//! Tideline is an event-sourcing persistence layer built on SQLite. It provides:
//!
//! - **Append-only event log**: streams, per-stream versions, ordered global ids
//! - **Optimistic concurrency**: expected-version and actor command-count checks
//! - **Competing consumers**: lease-based poll/ack so many processes share work
//! - **Projections**: watermark-gated read models, idempotent under redelivery
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Async API Layer                          │
//! │     EventStore (commit, query, poll, ack)   ProjectionStore     │
//! └──────────────┬──────────────────────────────────┬───────────────┘
//!                │                                  │
//!                ▼                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Connection Pool                           │
//! │          (N threads, one rusqlite connection each)              │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐ │
//! │  │   writer    │  │   reader    │  │  lease / projection     │ │
//! │  │ (IMMEDIATE) │  │ (streaming) │  │  (IMMEDIATE, CAS)       │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    SQLite (WAL, shared file)                    │
//! │         events │ events_subscriptions │ projection tables       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Contiguous versions**: per stream, versions run `0, 1, 2, ...` with no gaps
//! 2. **Monotonic ids**: global ids strictly increase and are never reused
//! 3. **Check and write together**: every precondition is evaluated in the
//!    same transaction as the write it guards
//! 4. **One lease at a time**: a consumer never has two unexpired leases
//! 5. **Watermarks never regress**: neither a subscription's nor a
//!    projection record's
//!
//! ## Module Organization
//!
//! - [`error`]: Error type for all failure modes
//! - [`types`]: Domain types (EventId, Version, CommittedEvent, Lease, ...)
//! - [`clock`]: Injected wall clock
//! - [`config`]: Store configuration
//! - [`schema`]: SQLite DDL and database initialization
//! - [`pool`]: Connection pool
//! - [`stream`]: Lazy row streams
//! - [`notify`]: Change notifications
//! - [`writer`]: Commit with concurrency checks
//! - [`reader`]: Queries and stats
//! - [`lease`]: Poll and ack
//! - [`api`]: Async API (main entry point)
//! - [`projection`]: Read models
//! - [`consumer`]: Competing-consumer runtime

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for Tideline operations.
pub mod error;

/// Domain types for event sourcing.
///
/// Uses the newtype pattern for ids and versions so the two can't be mixed up.
pub mod types;

/// Wall clock abstraction.
///
/// Lease expiry is the only place the store reads the time, so tests swap in
/// a [`ManualClock`](clock::ManualClock) to make expiry deterministic.
pub mod clock;

/// Store configuration, from code or TOML.
pub mod config;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Bounded connection pool.
///
/// Each connection lives on its own OS thread; async callers hand it closures
/// and await the result.
pub mod pool;

/// Lazy, finite, non-restartable result streams.
pub mod stream;

/// Best-effort change notifications.
pub mod notify;

/// Event commit.
///
/// Version check, actor check and inserts all run in one `IMMEDIATE`
/// transaction, so two writers racing on one stream cannot both pass the
/// check.
pub mod writer;

/// Read operations for the event log.
pub mod reader;

/// Competing-consumer leases.
pub mod lease;

/// Async API for Tideline.
///
/// The main entry point is [`EventStore`](api::EventStore).
pub mod api;

/// Watermark-gated projections.
pub mod projection;

/// Poll/handle/ack loop built on [`EventStore`].
pub mod consumer;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::EventStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StoreConfig;
pub use error::{Error, Result};
pub use notify::{ChangeNotifier, Notification};
pub use pool::ConnectionPool;
pub use schema::Database;
pub use stream::RowStream;

pub use types::{
    Actor, Causation, CommandCause, CommittedEvent, EventCause, EventFilter, EventId,
    EventMetadata, Lease, Message, PollOptions, StoreStat, Subscription, Version, SNAPSHOT_EVENT,
};

pub use consumer::{Consumer, ConsumerConfig, EventHandler, Projector, ProjectorHandler};
pub use projection::{ProjectionSchema, ProjectionStore};
