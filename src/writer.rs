//! # Commit Path for Tideline
//!
//! This module appends events to the log. Both concurrency guards and the
//! inserts run in ONE immediate transaction:
//!
//! ```text
//! BEGIN IMMEDIATE                      ← takes the database write lock
//! │
//! ├─ current = last version of stream
//! ├─ expected given and ≠ current?      → ROLLBACK, Error::Concurrency
//! ├─ actor expects N prior events and
//! │  COUNT(actor) ≠ N?                  → ROLLBACK, Error::ActorConcurrency
//! ├─ next_id = MAX(id) + 1
//! ├─ INSERT each event (id++, version++)
//! │
//! COMMIT
//! ```
//!
//! ## Why IMMEDIATE?
//!
//! A deferred transaction would read the version under a shared lock and only
//! upgrade on the first insert, so two writers could both pass the version
//! check. `BEGIN IMMEDIATE` takes the write lock before the read, which makes
//! read-check-insert a compare-and-swap across every connection and process
//! sharing the file. Commits to different streams still serialize on that
//! lock, but never conflict with one another.
//!
//! Notification is not part of this module: the caller announces the commit
//! only after `commit` has returned successfully.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::warn;

use crate::clock::{from_millis, to_millis};
use crate::error::{Error, Result};
use crate::reader::stream_version;
use crate::schema::EventTables;
use crate::types::{CommittedEvent, EventId, EventMetadata, Message, Version};

/// Appends `events` to `stream` atomically.
///
/// # Arguments
///
/// * `expected` - When `Some`, the commit succeeds only if the stream's
///   current version equals it. `Some(Version::NONE)` asserts the stream is empty.
/// * `now` - Timestamp written to every event of this commit, truncated to
///   milliseconds.
///
/// # Errors
///
/// - `Error::InvalidArgument` for an empty batch or an empty stream name
/// - `Error::Concurrency` if `expected` does not match
/// - `Error::ActorConcurrency` if the actor's expected count does not match
/// - `Error::Sqlite` on any storage failure; nothing is written
pub fn commit(
    conn: &mut Connection,
    tables: &EventTables,
    stream: &str,
    events: Vec<Message>,
    metadata: &EventMetadata,
    expected: Option<Version>,
    now: DateTime<Utc>,
) -> Result<Vec<CommittedEvent>> {
    if events.is_empty() {
        return Err(Error::InvalidArgument("commit requires at least one event".to_string()));
    }
    if stream.is_empty() {
        return Err(Error::InvalidArgument("stream must not be empty".to_string()));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    // Stream concurrency
    let current = stream_version(&tx, tables, stream)?;
    if let Some(expected) = expected {
        if expected != current {
            warn!(stream, %expected, actual = %current, "stream version conflict");
            return Err(Error::Concurrency {
                stream: stream.to_string(),
                expected,
                actual: current,
                events,
            });
        }
    }

    // Actor concurrency
    let actor = metadata.actor();
    if let Some((actor, expected_count)) = actor.and_then(|a| a.expected_count.map(|n| (a, n))) {
        let actual: i64 = tx.query_row(
            &format!("SELECT COUNT(id) FROM {} WHERE actor = ?1", tables.events),
            params![actor.id],
            |row| row.get(0),
        )?;
        if actual != expected_count {
            warn!(actor = %actor.id, expected = expected_count, actual, "actor count conflict");
            return Err(Error::ActorConcurrency {
                actor: actor.id.clone(),
                expected: expected_count,
                actual,
                event: events[0].name.clone(),
            });
        }
    }

    let next_id: i64 = tx.query_row(
        &format!("SELECT COALESCE(MAX(id), -1) + 1 FROM {}", tables.events),
        [],
        |row| row.get(0),
    )?;

    let actor_id = actor.map(|a| a.id.clone());
    let metadata_json = serde_json::to_string(metadata)?;
    // Stored at millisecond precision; hand back exactly what was stored.
    let created_ms = to_millis(now);
    let created = from_millis(created_ms)?;

    let mut committed = Vec::with_capacity(events.len());
    {
        let mut insert = tx.prepare(&format!(
            "INSERT INTO {} (id, name, data, stream, version, created, actor, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            tables.events
        ))?;

        let mut id = EventId::from_raw(next_id);
        let mut version = current.next();
        for Message { name, data } in events {
            insert.execute(params![
                id.as_raw(),
                name,
                serde_json::to_string(&data)?,
                stream,
                version.as_raw(),
                created_ms,
                actor_id,
                metadata_json,
            ])?;

            committed.push(CommittedEvent {
                id,
                name,
                data,
                stream: stream.to_string(),
                version,
                created,
                actor: actor_id.clone(),
                metadata: metadata.clone(),
            });

            id = id.next();
            version = version.next();
        }
    }

    tx.commit()?;
    Ok(committed)
}

/// Deletes every event and every subscription of this log.
///
/// Destructive; meant for tests and environment resets only.
pub fn reset(conn: &mut Connection, tables: &EventTables) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(&format!("DELETE FROM {}", tables.events), [])?;
    tx.execute(&format!("DELETE FROM {}", tables.subscriptions), [])?;
    tx.commit()?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader;
    use crate::schema::Database;
    use crate::types::{Actor, CommandCause, EventFilter};
    use serde_json::json;

    fn setup() -> (Database, EventTables) {
        let mut db = Database::open_in_memory().unwrap();
        let tables = EventTables::new("events").unwrap();
        tables.seed(db.connection_mut()).unwrap();
        (db, tables)
    }

    fn msgs(names: &[&str]) -> Vec<Message> {
        names.iter().map(|n| Message::new(*n, json!({}))).collect()
    }

    fn count(db: &Database, tables: &EventTables) -> usize {
        reader::query(db.connection(), tables, &EventFilter::new()).unwrap().len()
    }

    #[test]
    fn test_assigns_contiguous_ids_and_versions() {
        let (mut db, tables) = setup();
        let meta = EventMetadata::default();
        let now = Utc::now();

        let first = commit(db.connection_mut(), &tables, "a", msgs(&["X", "Y"]), &meta, None, now).unwrap();
        let other = commit(db.connection_mut(), &tables, "b", msgs(&["X"]), &meta, None, now).unwrap();
        let second = commit(db.connection_mut(), &tables, "a", msgs(&["Z"]), &meta, None, now).unwrap();

        let pairs = |events: &[CommittedEvent]| {
            events.iter().map(|e| (e.id.as_raw(), e.version.as_raw())).collect::<Vec<_>>()
        };
        assert_eq!(pairs(&first), vec![(0, 0), (1, 1)]);
        assert_eq!(pairs(&other), vec![(2, 0)]);
        assert_eq!(pairs(&second), vec![(3, 2)]);
    }

    #[test]
    fn test_expected_version() {
        let (mut db, tables) = setup();
        let meta = EventMetadata::default();
        let now = Utc::now();

        // Empty stream
        commit(db.connection_mut(), &tables, "s", msgs(&["A"]), &meta, Some(Version::NONE), now).unwrap();

        // Version 0 is checked like any other
        let err = commit(db.connection_mut(), &tables, "s", msgs(&["B"]), &meta, Some(Version::from_raw(3)), now)
            .unwrap_err();
        match err {
            Error::Concurrency { stream, expected, actual, events } => {
                assert_eq!(stream, "s");
                assert_eq!(expected, Version::from_raw(3));
                assert_eq!(actual, Version::FIRST);
                assert_eq!(events.len(), 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(count(&db, &tables), 1);

        commit(db.connection_mut(), &tables, "s", msgs(&["B"]), &meta, Some(Version::FIRST), now).unwrap();
        assert_eq!(count(&db, &tables), 2);
    }

    #[test]
    fn test_actor_expected_count() {
        let (mut db, tables) = setup();
        let now = Utc::now();
        let meta = |n: i64| {
            EventMetadata::new("c")
                .with_command(CommandCause::new("Press").with_actor(Actor::new("u1", "User").expecting(n)))
        };

        commit(db.connection_mut(), &tables, "s", msgs(&["A"]), &meta(0), None, now).unwrap();
        commit(db.connection_mut(), &tables, "t", msgs(&["B"]), &meta(1), None, now).unwrap();

        // A retried submission still expects 1 prior event.
        let err = commit(db.connection_mut(), &tables, "t", msgs(&["B"]), &meta(1), None, now).unwrap_err();
        assert!(matches!(
            err,
            Error::ActorConcurrency { ref actor, expected: 1, actual: 2, .. } if actor == "u1"
        ));
        assert_eq!(count(&db, &tables), 2);

        let stored = reader::query(db.connection(), &tables, &EventFilter::new().actor("u1")).unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[test]
    fn test_rejects_empty_input() {
        let (mut db, tables) = setup();
        let meta = EventMetadata::default();
        let now = Utc::now();
        assert!(matches!(
            commit(db.connection_mut(), &tables, "s", vec![], &meta, None, now),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            commit(db.connection_mut(), &tables, "", msgs(&["A"]), &meta, None, now),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_reset_clears_everything() {
        let (mut db, tables) = setup();
        commit(db.connection_mut(), &tables, "s", msgs(&["A"]), &EventMetadata::default(), None, Utc::now())
            .unwrap();
        db.connection()
            .execute("INSERT INTO events_subscriptions (consumer, watermark) VALUES ('w', 0)", [])
            .unwrap();

        reset(db.connection_mut(), &tables).unwrap();
        assert_eq!(count(&db, &tables), 0);
        let subs: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM events_subscriptions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(subs, 0);

        let again = commit(db.connection_mut(), &tables, "s", msgs(&["A"]), &EventMetadata::default(), None, Utc::now())
            .unwrap();
        assert_eq!(again[0].id, EventId::FIRST);
        assert_eq!(again[0].version, Version::FIRST);
    }
}
