//! # Read Operations for Tideline
//!
//! Direct SQL reads over the events table. Every function here takes a plain
//! `&Connection`, so the same code serves the async pool (where a query
//! streams rows through a [`RowSink`](crate::stream::RowSink)) and the
//! lease manager (which reads inside its own poll transaction).
//!
//! ## Query Building
//!
//! [`EventFilter`] fields map one-to-one onto `WHERE` clauses; every value is
//! bound as a parameter. Only table names are spliced into the SQL, and those
//! were validated when the [`EventTables`] was built.
//!
//! ```text
//! SELECT ... FROM {table}
//! WHERE 1 = 1
//!   [AND id >= (last snapshot of stream, or 0)]   -- loading
//!   [AND id > ?] [AND id < ?]                      -- after / before
//!   [AND stream = ?] [AND actor = ?]
//!   [AND name IN (?, ...)]
//!   [AND created > ?] [AND created < ?]
//!   [AND json_extract(metadata, '$.correlation') = ?]
//! ORDER BY id ASC|DESC
//! [LIMIT ?]
//! ```

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::clock::{from_millis, to_millis};
use crate::error::{Error, Result};
use crate::schema::EventTables;
use crate::types::{
    CommittedEvent, EventFilter, EventId, EventMetadata, StoreStat, Version, SNAPSHOT_EVENT,
};

const EVENT_COLUMNS: &str = "id, name, data, stream, version, created, actor, metadata";

// =============================================================================
// Row Decoding
// =============================================================================

/// An events-table row before its JSON columns are parsed.
///
/// Parsing happens outside the rusqlite row closure so JSON failures surface
/// as [`Error::Json`] rather than being squeezed into a `rusqlite::Error`.
struct EventRow {
    id: i64,
    name: String,
    data: String,
    stream: String,
    version: i64,
    created: i64,
    actor: Option<String>,
    metadata: String,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            data: row.get(2)?,
            stream: row.get(3)?,
            version: row.get(4)?,
            created: row.get(5)?,
            actor: row.get(6)?,
            metadata: row.get(7)?,
        })
    }
}

impl TryFrom<EventRow> for CommittedEvent {
    type Error = Error;

    fn try_from(row: EventRow) -> Result<Self> {
        let metadata: EventMetadata = serde_json::from_str(&row.metadata)?;
        Ok(CommittedEvent {
            id: EventId::from_raw(row.id),
            name: row.name,
            data: serde_json::from_str(&row.data)?,
            stream: row.stream,
            version: Version::from_raw(row.version),
            created: from_millis(row.created)?,
            actor: row.actor,
            metadata,
        })
    }
}

// =============================================================================
// Query
// =============================================================================

/// Builds the SQL text and bound parameters for `filter`.
fn build_query(tables: &EventTables, filter: &EventFilter) -> Result<(String, Vec<SqlValue>)> {
    let events = &tables.events;
    let mut sql = format!("SELECT {EVENT_COLUMNS} FROM {events} WHERE 1 = 1");
    let mut values: Vec<SqlValue> = Vec::new();

    if filter.loading {
        let stream = filter.stream.as_ref().ok_or_else(|| {
            Error::InvalidArgument("a loading query requires a stream".to_string())
        })?;
        values.push(SqlValue::Text(stream.clone()));
        values.push(SqlValue::Text(SNAPSHOT_EVENT.to_string()));
        sql.push_str(&format!(
            " AND id >= COALESCE((SELECT id FROM {events} WHERE stream = ?{} AND name = ?{} \
             ORDER BY id DESC LIMIT 1), 0)",
            values.len() - 1,
            values.len()
        ));
    }

    let mut push = |clause: &str, value: SqlValue| {
        values.push(value);
        sql.push_str(&format!(" AND {clause} ?{}", values.len()));
    };

    if let Some(after) = filter.after {
        push("id >", SqlValue::Integer(after.as_raw()));
    }
    if let Some(before) = filter.before {
        push("id <", SqlValue::Integer(before.as_raw()));
    }
    if let Some(stream) = &filter.stream {
        push("stream =", SqlValue::Text(stream.clone()));
    }
    if let Some(actor) = &filter.actor {
        push("actor =", SqlValue::Text(actor.clone()));
    }
    if let Some(at) = filter.created_after {
        push("created >", SqlValue::Integer(to_millis(at)));
    }
    if let Some(at) = filter.created_before {
        push("created <", SqlValue::Integer(millis_ceil(at)));
    }
    if let Some(correlation) = &filter.correlation {
        push(
            "json_extract(metadata, '$.correlation') =",
            SqlValue::Text(correlation.clone()),
        );
    }

    if !filter.names.is_empty() {
        let start = values.len();
        values.extend(filter.names.iter().cloned().map(SqlValue::Text));
        let placeholders = (start + 1..=values.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" AND name IN ({placeholders})"));
    }

    sql.push_str(if filter.backward {
        " ORDER BY id DESC"
    } else {
        " ORDER BY id ASC"
    });

    if let Some(limit) = filter.limit {
        values.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        sql.push_str(&format!(" LIMIT ?{}", values.len()));
    }

    Ok((sql, values))
}

/// Scans events matching `filter`, handing each to `visit` as it is read.
///
/// Stops early when `visit` returns `false`. Returns the number of events
/// delivered.
pub fn query_each<F>(
    conn: &Connection,
    tables: &EventTables,
    filter: &EventFilter,
    mut visit: F,
) -> Result<usize>
where
    F: FnMut(CommittedEvent) -> bool,
{
    let (sql, values) = build_query(tables, filter)?;
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(values))?;

    let mut count = 0;
    while let Some(row) = rows.next()? {
        let event = CommittedEvent::try_from(EventRow::from_row(row)?)?;
        count += 1;
        if !visit(event) {
            break;
        }
    }
    Ok(count)
}

/// Collects every event matching `filter`.
pub fn query(conn: &Connection, tables: &EventTables, filter: &EventFilter) -> Result<Vec<CommittedEvent>> {
    let mut events = Vec::new();
    query_each(conn, tables, filter, |e| {
        events.push(e);
        true
    })?;
    Ok(events)
}

// =============================================================================
// Stream Version
// =============================================================================

/// Version of the last event in `stream`, or [`Version::NONE`] if it is empty.
pub fn stream_version(conn: &Connection, tables: &EventTables, stream: &str) -> Result<Version> {
    let version: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT version FROM {} WHERE stream = ?1 ORDER BY version DESC LIMIT 1",
                tables.events
            ),
            params![stream],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.map(Version::from_raw).unwrap_or(Version::NONE))
}

// =============================================================================
// Stats
// =============================================================================

/// Per-event-name aggregates, ordered by name.
pub fn stats(conn: &Connection, tables: &EventTables) -> Result<Vec<StoreStat>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT name, MIN(id), MAX(id), MIN(created), MAX(created), COUNT(id) \
         FROM {} GROUP BY name ORDER BY name",
        tables.events
    ))?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(name, first_id, last_id, first_created, last_created, count)| {
            Ok(StoreStat {
                name,
                first_id: EventId::from_raw(first_id),
                last_id: EventId::from_raw(last_id),
                first_created: from_millis(first_created)?,
                last_created: from_millis(last_created)?,
                count,
            })
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

/// Smallest whole millisecond not earlier than `at`.
///
/// Stored times are whole milliseconds, so `created < at` holds exactly when
/// `created < millis_ceil(at)`; `created > at` likewise uses the floor.
fn millis_ceil(at: DateTime<Utc>) -> i64 {
    let floor = to_millis(at);
    if at.timestamp_subsec_nanos() % 1_000_000 == 0 {
        floor
    } else {
        floor.saturating_add(1)
    }
}
