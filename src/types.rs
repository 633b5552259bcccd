//! # Domain Types for Tideline
//!
//! This module defines the core types of the event log: ids, versions,
//! committed events, commit metadata, query filters and the records of the
//! lease protocol.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Global ids and stream versions are both `i64` on disk, but they mean very
//! different things. Wrapping them in [`EventId`] and [`Version`] means a
//! watermark can never be handed to an expected-version check by mistake.
//!
//! ## Invariants
//!
//! - [`EventId`]: strictly increasing across all streams, never reused, first id is `0`
//! - [`Version`]: contiguous per stream, first event is `0`, an empty stream is [`Version::NONE`]
//! - A consumer watermark of [`EventId::NONE`] means "nothing acknowledged yet"

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the full-state snapshot event. A loading query for a stream
/// starts scanning at the last event with this name.
pub const SNAPSHOT_EVENT: &str = "__snapshot__";

// =============================================================================
// Global Ids
// =============================================================================

/// Position of an event in the global log.
///
/// Assigned by the store at commit time. Also used as a watermark: a
/// consumer's watermark is the id of the last event it acknowledged, and a
/// projection record's watermark is the id of the last commit applied to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(i64);

impl EventId {
    /// The first id ever assigned.
    pub const FIRST: EventId = EventId(0);

    /// Sentinel watermark for "nothing processed yet".
    pub const NONE: EventId = EventId(-1);

    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> i64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_none(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Stream Versions
// =============================================================================

/// Zero-based, contiguous position of an event within its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Version of the first event in a stream.
    pub const FIRST: Version = Version(0);

    /// Current version of a stream with no events.
    pub const NONE: Version = Version(-1);

    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> i64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_none(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Events
// =============================================================================

/// An event that has not been committed yet: a name and a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    pub data: Value,
}

impl Message {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// An immutable fact in the log.
///
/// Only [`crate::EventStore::commit`] creates these. `id` and `version` are
/// assigned inside the commit transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedEvent {
    pub id: EventId,
    pub name: String,
    pub data: Value,
    pub stream: String,
    pub version: Version,
    pub created: DateTime<Utc>,
    pub actor: Option<String>,
    pub metadata: EventMetadata,
}

// =============================================================================
// Metadata
// =============================================================================

/// Correlation and causation attached to every event of one commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default)]
    pub correlation: String,
    #[serde(default)]
    pub causation: Causation,
}

impl EventMetadata {
    pub fn new(correlation: impl Into<String>) -> Self {
        Self {
            correlation: correlation.into(),
            causation: Causation::default(),
        }
    }

    /// Records the command that produced the events.
    pub fn with_command(mut self, command: CommandCause) -> Self {
        self.causation.command = Some(command);
        self
    }

    /// Records the event that triggered the events (policies, process managers).
    pub fn with_event(mut self, event: EventCause) -> Self {
        self.causation.event = Some(event);
        self
    }

    /// The acting user, if the causing command carried one.
    pub fn actor(&self) -> Option<&Actor> {
        self.causation.command.as_ref().and_then(|c| c.actor.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Causation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandCause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventCause>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandCause {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
}

impl CommandCause {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actor: None,
        }
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }
}

/// The identity behind a command.
///
/// When `expected_count` is set, the commit is accepted only if exactly that
/// many events are already attributed to this actor. A retried submission
/// of an already-accepted command then fails instead of duplicating events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "expectedCount", skip_serializing_if = "Option::is_none")]
    pub expected_count: Option<i64>,
}

impl Actor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            expected_count: None,
        }
    }

    pub fn expecting(mut self, count: i64) -> Self {
        self.expected_count = Some(count);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCause {
    pub name: String,
    pub stream: String,
    pub id: EventId,
}

// =============================================================================
// Query Filter
// =============================================================================

/// Filter for [`crate::EventStore::query`].
///
/// All bounds are exclusive. Results come back in ascending id order unless
/// [`EventFilter::backward`] is set.
///
/// # Example
///
/// ```rust
/// use tideline::types::{EventFilter, EventId};
///
/// let filter = EventFilter::new()
///     .stream("Calc/A")
///     .after(EventId::from_raw(1))
///     .limit(100);
/// assert_eq!(filter.limit, Some(100));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub stream: Option<String>,
    pub actor: Option<String>,
    pub names: Vec<String>,
    pub correlation: Option<String>,
    pub after: Option<EventId>,
    pub before: Option<EventId>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Seek to the last [`SNAPSHOT_EVENT`] of `stream` and scan forward from it.
    pub loading: bool,
    pub backward: bool,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn correlation(mut self, correlation: impl Into<String>) -> Self {
        self.correlation = Some(correlation.into());
        self
    }

    pub fn after(mut self, id: EventId) -> Self {
        self.after = Some(id);
        self
    }

    pub fn before(mut self, id: EventId) -> Self {
        self.before = Some(id);
        self
    }

    /// Events created strictly after `at`.
    ///
    /// Creation times are stored in whole milliseconds. Sub-millisecond
    /// bounds are still compared exactly: `at` = 1.5ms matches 2ms, not 1ms.
    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    /// Events created strictly before `at`; `at` = 1.5ms matches 1ms but
    /// not 2ms. See [`EventFilter::created_after`] on precision.
    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn loading(mut self) -> Self {
        self.loading = true;
        self
    }

    pub fn backward(mut self) -> Self {
        self.backward = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Per-event-name aggregates returned by [`crate::EventStore::stats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStat {
    pub name: String,
    pub first_id: EventId,
    pub last_id: EventId,
    pub first_created: DateTime<Utc>,
    pub last_created: DateTime<Utc>,
    pub count: i64,
}

// =============================================================================
// Consumer Leases
// =============================================================================

/// The persisted state of one named consumer.
///
/// `lease` and `expires` are both set while a lease is outstanding and both
/// cleared by a successful ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub consumer: String,
    pub watermark: EventId,
    pub lease: Option<String>,
    pub expires: Option<DateTime<Utc>>,
}

/// A time-bounded grant of a batch of events to one consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub consumer: String,
    /// Watermark at the time the lease was granted.
    pub watermark: EventId,
    /// Opaque token; only an ack presenting this token can release the lease.
    pub lease: String,
    pub expires: DateTime<Utc>,
    pub events: Vec<CommittedEvent>,
}

impl Lease {
    /// Highest event id in the leased batch.
    pub fn last_id(&self) -> Option<EventId> {
        self.events.iter().map(|e| e.id).max()
    }
}

/// Options for [`crate::EventStore::poll`].
#[derive(Debug, Clone, PartialEq)]
pub struct PollOptions {
    /// Only lease events with these names. Empty means all names.
    pub names: Vec<String>,
    pub limit: Option<usize>,
    /// How long the lease stays valid.
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            limit: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl PollOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    pub fn names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
