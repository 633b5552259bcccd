//! # SQLite Schema for Tideline
//!
//! This module defines the event log's tables and handles connection setup.
//! One database file may hold several independent logs; each log is a pair of
//! tables named after its namespace.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  {table}                                {table}_subscriptions           │
//! │  ┌──────────────────────┐               ┌─────────────────────┐         │
//! │  │ id (PK, global)      │◄── watermark ─│ consumer (PK)       │         │
//! │  │ name                 │               │ watermark           │         │
//! │  │ data (JSON)          │               │ lease (nullable)    │         │
//! │  │ stream ─┐            │               │ expires (nullable)  │         │
//! │  │ version ┴ UNIQUE     │               └─────────────────────┘         │
//! │  │ created (ms)         │                                               │
//! │  │ actor (nullable)     │               tideline_metadata               │
//! │  │ metadata (JSON)      │               ┌─────────────────────┐         │
//! │  └──────────────────────┘               │ key (PK), value     │         │
//! │                                         └─────────────────────┘         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why `id INTEGER PRIMARY KEY` without AUTOINCREMENT?
//!
//! The commit transaction assigns ids itself (`MAX(id) + 1`) while it holds
//! the write lock, so the first id is `0` and ids are contiguous. A reset
//! clears the table; subscriptions are cleared with it, so a stale watermark
//! never skips re-used ids.
//!
//! ### Why a UNIQUE index on `(stream, version)`?
//!
//! The version check inside the commit is the primary guard. The unique index
//! is the backstop: even a buggy caller cannot create two events with the same
//! version in one stream.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior};

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

/// Database-wide key/value table holding the schema version.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS tideline_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Identifiers
// =============================================================================

/// Checks that `name` is safe to splice into SQL as a table or column name.
///
/// Accepts `[A-Za-z_][A-Za-z0-9_]*`, at most 64 characters.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                && name.len() <= 64
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::Schema(format!("invalid identifier: '{name}'")))
    }
}

/// Double-quotes an identifier that already passed [`validate_identifier`].
pub fn quote_identifier(name: &str) -> String {
    format!("\"{name}\"")
}

// =============================================================================
// Event Log Tables
// =============================================================================

/// Quoted table names of one event log namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTables {
    name: String,
    pub(crate) events: String,
    pub(crate) subscriptions: String,
}

impl EventTables {
    pub fn new(table: &str) -> Result<Self> {
        validate_identifier(table)?;
        Ok(Self {
            name: table.to_string(),
            events: quote_identifier(table),
            subscriptions: quote_identifier(&format!("{table}_subscriptions")),
        })
    }

    /// Unquoted namespace name; also the change-notification channel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates the events and subscriptions tables and their indexes.
    ///
    /// Idempotent, and safe to run from several processes at once: all DDL
    /// runs in one immediate transaction.
    pub fn seed(&self, conn: &mut Connection) -> Result<()> {
        let name = &self.name;
        let events = &self.events;
        let subscriptions = &self.subscriptions;

        let ddl = format!(
            r#"
CREATE TABLE IF NOT EXISTS {events} (
    id       INTEGER PRIMARY KEY,
    name     TEXT NOT NULL,
    data     TEXT NOT NULL,
    stream   TEXT NOT NULL,
    version  INTEGER NOT NULL,
    created  INTEGER NOT NULL,
    actor    TEXT,
    metadata TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS "{name}_stream_version" ON {events}(stream, version);
CREATE INDEX IF NOT EXISTS "{name}_actor" ON {events}(actor);
CREATE INDEX IF NOT EXISTS "{name}_name" ON {events}(name);
CREATE INDEX IF NOT EXISTS "{name}_created" ON {events}(created);

CREATE TABLE IF NOT EXISTS {subscriptions} (
    consumer  TEXT PRIMARY KEY,
    watermark INTEGER NOT NULL,
    lease     TEXT,
    expires   INTEGER
);
"#
        );

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(CREATE_METADATA)?;
        verify_or_set_version(&tx)?;
        tx.execute_batch(&ddl)?;
        tx.commit()?;
        Ok(())
    }
}

/// Verifies the schema version, or sets it if this is a new database.
fn verify_or_set_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO tideline_metadata (key, value) VALUES ('schema_version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    let stored: String = conn.query_row(
        "SELECT value FROM tideline_metadata WHERE key = 'schema_version'",
        [],
        |row| row.get(0),
    )?;

    match stored.parse::<i32>() {
        Ok(v) if v == SCHEMA_VERSION => Ok(()),
        _ => Err(Error::Schema(format!(
            "schema version mismatch: database has version {stored}, but this build requires {SCHEMA_VERSION}"
        ))),
    }
}

// =============================================================================
// Database Connection
// =============================================================================

/// A configured SQLite connection.
///
/// # Rust Pattern: Newtype Wrapper
///
/// Wrapping [`Connection`] guarantees the pragmas below were applied before
/// any statement runs on it.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (creating if needed) the database file at `path`.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::configure(conn, busy_timeout)
    }

    /// Private in-memory database, mostly for unit tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(conn, Duration::from_secs(5))
    }

    fn configure(conn: Connection, busy_timeout: Duration) -> Result<Self> {
        // Set before the WAL switch, which itself needs the lock briefly.
        conn.busy_timeout(busy_timeout)?;

        // WAL: readers never block the writer and see committed data only.
        conn.execute_batch("PRAGMA journal_mode = WAL")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;

        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn names_of(conn: &Connection, kind: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = ?1 AND name NOT LIKE 'sqlite_%'")
            .expect("should prepare");
        stmt.query_map([kind], |row| row.get(0))
            .expect("should query")
            .collect::<std::result::Result<Vec<_>, _>>()
            .expect("should collect")
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("events").is_ok());
        assert!(validate_identifier("_calc_2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("2events").is_err());
        assert!(validate_identifier("events; DROP TABLE x").is_err());
        assert!(validate_identifier("evénts").is_err());
        assert!(validate_identifier(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_seed_creates_tables_and_indexes() {
        let mut db = Database::open_in_memory().expect("should create db");
        let tables = EventTables::new("calc").unwrap();
        tables.seed(db.connection_mut()).expect("should seed");

        let names = names_of(db.connection(), "table");
        assert!(names.contains(&"calc".to_string()));
        assert!(names.contains(&"calc_subscriptions".to_string()));
        assert!(names.contains(&"tideline_metadata".to_string()));

        let indexes = names_of(db.connection(), "index");
        assert!(indexes.contains(&"calc_stream_version".to_string()));
        assert!(indexes.contains(&"calc_actor".to_string()));
    }

    #[test]
    fn test_seed_is_idempotent() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("test.db");
        let tables = EventTables::new("events").unwrap();

        for _ in 0..2 {
            let mut db = Database::open(&path, Duration::from_secs(1)).expect("open should work");
            tables.seed(db.connection_mut()).expect("seed should work");
        }

        let db = Database::open(&path, Duration::from_secs(1)).unwrap();
        assert_eq!(names_of(db.connection(), "table").len(), 3);
    }

    #[test]
    fn test_schema_version_mismatch() {
        let mut db = Database::open_in_memory().unwrap();
        db.connection()
            .execute_batch(CREATE_METADATA)
            .unwrap();
        db.connection()
            .execute(
                "INSERT INTO tideline_metadata (key, value) VALUES ('schema_version', '99')",
                [],
            )
            .unwrap();

        let err = EventTables::new("events")
            .unwrap()
            .seed(db.connection_mut())
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_unique_stream_version() {
        let mut db = Database::open_in_memory().unwrap();
        EventTables::new("events").unwrap().seed(db.connection_mut()).unwrap();

        let insert = "INSERT INTO events (id, name, data, stream, version, created, metadata) \
                      VALUES (?1, 'E', 'null', 's', 0, 0, '{}')";
        db.connection().execute(insert, [0]).unwrap();
        assert!(db.connection().execute(insert, [1]).is_err());
    }
}
