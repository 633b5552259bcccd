//! # Error Handling for Tideline
//!
//! This module defines the error types used throughout the crate. A single
//! error enum ([`Error`]) represents every failure mode, so callers can match
//! on one type whether they are committing events, polling for work or
//! writing projections.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations.
//! This provides:
//! - Automatic `Display` implementation from the `#[error(...)]` attributes
//! - Automatic `From` implementations from the `#[from]` attributes
//! - Proper error source chaining via `#[source]`
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Concurrency | Stream version mismatch, actor count mismatch | Reload state, retry |
//! | Caller | Empty commit, unknown projection column | Fix the call |
//! | Internal | SQLite error, corrupt JSON, pool closed | Log and investigate |
//!
//! ## What Is Not an Error
//!
//! Two outcomes of the lease protocol look like failures but are normal results:
//!
//! - `poll` returning `None`: a lease is already outstanding, or there is no new work.
//! - `ack` returning `false`: the lease is stale, expired or was reassigned.
//!
//! Neither is surfaced through this enum. The store never retries on its own;
//! retry policy belongs to the caller.

use thiserror::Error;

use crate::types::{Message, Version};

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in tideline operations.
///
/// # Example
///
/// ```rust,ignore
/// use tideline::{Error, Result};
///
/// async fn place_order(store: &EventStore) -> Result<()> {
///     match store.commit(stream, events, meta, Some(version)).await {
///         Err(err) if err.is_concurrency() => {
///             // reload the aggregate and try again
///         }
///         other => { other?; }
///     }
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Concurrency Errors (Client can retry with updated data)
    // =========================================================================

    /// Optimistic concurrency conflict: the stream moved since it was last read.
    ///
    /// # When This Happens
    ///
    /// A commit supplied an expected version and the stream's current version,
    /// read inside the commit transaction, was different. Nothing was appended.
    ///
    /// # Recovery
    ///
    /// 1. Re-read the stream to get current state
    /// 2. Re-apply business logic with new data
    /// 3. Retry the commit with the updated expected version
    #[error("concurrency conflict on stream '{stream}': expected version {expected}, but found {actual}")]
    Concurrency {
        /// The stream where the conflict occurred
        stream: String,
        /// The version the caller expected
        expected: Version,
        /// The version found in the store
        actual: Version,
        /// The events that were rejected
        events: Vec<Message>,
    },

    /// Actor command-count mismatch: the command is not the N-th one expected
    /// from this actor.
    ///
    /// # When This Happens
    ///
    /// Commit metadata carried an actor with an expected count, and the number
    /// of events already attributed to that actor differed. This is how a
    /// retried client submission is detected and rejected.
    ///
    /// # Recovery
    ///
    /// Treat as a duplicate submission, or refresh the actor's count and retry.
    #[error("actor concurrency conflict for '{actor}' on '{event}': expected {expected} prior events, but found {actual}")]
    ActorConcurrency {
        /// The actor id from the commit metadata
        actor: String,
        /// The count the caller expected
        expected: i64,
        /// The count found in the store
        actual: i64,
        /// Name of the first rejected event
        event: String,
    },

    // =========================================================================
    // Caller Errors
    // =========================================================================

    /// The request is malformed and can never succeed as given.
    ///
    /// Examples: committing zero events, a loading query without a stream, a
    /// projection upsert with nothing to write, a reference to a column the
    /// projection does not define.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be read or failed validation.
    #[error("config error: {0}")]
    Config(String),

    // =========================================================================
    // Internal Errors (Investigate and fix)
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// # When This Happens
    ///
    /// This wraps any error from the `rusqlite` crate:
    /// - Database file is locked beyond the busy timeout
    /// - Disk is full
    /// - A constraint was violated (for example a racing duplicate stream version)
    ///
    /// The enclosing transaction is rolled back when its handle is dropped, so
    /// no partial write is ever visible.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored or supplied JSON document could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Schema mismatch, invalid identifier or a row that does not decode.
    #[error("schema error: {0}")]
    Schema(String),

    /// The connection pool has shut down and accepts no more work.
    #[error("connection pool is closed")]
    PoolClosed,
}

impl Error {
    /// True for the two optimistic-concurrency variants, the ones a caller
    /// would typically answer with reload-and-retry.
    pub fn is_concurrency(&self) -> bool {
        matches!(self, Error::Concurrency { .. } | Error::ActorConcurrency { .. })
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify error messages are formatted correctly.
    #[test]
    fn test_error_display() {
        let conflict = Error::Concurrency {
            stream: "Calc/A".to_string(),
            expected: Version::from_raw(1),
            actual: Version::from_raw(3),
            events: vec![],
        };
        assert_eq!(
            conflict.to_string(),
            "concurrency conflict on stream 'Calc/A': expected version 1, but found 3"
        );

        let actor = Error::ActorConcurrency {
            actor: "user-7".to_string(),
            expected: 2,
            actual: 3,
            event: "OrderPlaced".to_string(),
        };
        assert_eq!(
            actor.to_string(),
            "actor concurrency conflict for 'user-7' on 'OrderPlaced': expected 2 prior events, but found 3"
        );

        assert_eq!(Error::PoolClosed.to_string(), "connection pool is closed");
    }

    #[test]
    fn test_is_concurrency() {
        let conflict = Error::Concurrency {
            stream: "s".to_string(),
            expected: Version::NONE,
            actual: Version::from_raw(0),
            events: vec![],
        };
        assert!(conflict.is_concurrency());
        assert!(!Error::PoolClosed.is_concurrency());
        assert!(!Error::InvalidArgument("x".into()).is_concurrency());
    }

    /// Verify that rusqlite errors convert automatically.
    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();

        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
    }

    #[test]
    fn test_toml_error_conversion() {
        let toml_err = toml::from_str::<toml::Value>("= broken").unwrap_err();
        let our_err: Error = toml_err.into();
        assert!(matches!(our_err, Error::Config(_)));
    }
}
