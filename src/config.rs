//! Store configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! path = "events.db"
//! table = "orders"
//! pool_size = 8
//! busy_timeout_ms = 5000
//! ```

use std::path::{Path, PathBuf};
use std::thread::available_parallelism;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::validate_identifier;

/// Minimum number of pooled connections.
const MIN_POOL_SIZE: usize = 1;

/// Maximum number of pooled connections picked by default.
const MAX_DEFAULT_POOL_SIZE: usize = 16;

/// Configuration for [`crate::EventStore::open`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file. Every store instance sharing this file shares
    /// the same log.
    pub path: PathBuf,

    /// Name of the events table. The subscriptions table is
    /// `{table}_subscriptions`.
    pub table: String,

    /// Number of pooled connections (one OS thread each).
    pub pool_size: usize,

    /// How long a connection waits on a locked database before failing.
    pub busy_timeout_ms: u64,

    /// Rows buffered between a connection thread and a query stream.
    pub stream_buffer: usize,

    /// Capacity of the change-notification broadcast channel.
    pub notify_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tideline.db"),
            table: "events".to_string(),
            pool_size: default_pool_size(),
            busy_timeout_ms: 5_000,
            stream_buffer: 256,
            notify_capacity: 1024,
        }
    }
}

impl StoreConfig {
    /// Default config pointing at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size < MIN_POOL_SIZE {
            return Err(Error::Config("pool_size must be at least 1".to_string()));
        }
        if self.stream_buffer == 0 {
            return Err(Error::Config("stream_buffer must be at least 1".to_string()));
        }
        if self.notify_capacity == 0 {
            return Err(Error::Config("notify_capacity must be at least 1".to_string()));
        }
        validate_identifier(&self.table).map_err(|e| Error::Config(e.to_string()))?;
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_pool_size() -> usize {
    available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_POOL_SIZE)
        .clamp(MIN_POOL_SIZE, MAX_DEFAULT_POOL_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = StoreConfig::from_toml_str("").unwrap();
        assert_eq!(config.table, "events");
        assert_eq!(config.busy_timeout(), Duration::from_secs(5));
        assert!(config.pool_size >= 1);
    }

    #[test]
    fn parses_overrides() {
        let config = StoreConfig::from_toml_str(
            r#"
            path = "/tmp/orders.db"
            table = "orders"
            pool_size = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.path, PathBuf::from("/tmp/orders.db"));
        assert_eq!(config.table, "orders");
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.stream_buffer, 256);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            StoreConfig::from_toml_str("pool_size = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            StoreConfig::from_toml_str(r#"table = "drop table""#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            StoreConfig::from_toml_str("pool_size = \"many\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.toml");
        std::fs::write(&path, "table = \"ledger\"\n").unwrap();
        assert_eq!(StoreConfig::from_file(&path).unwrap().table, "ledger");
        assert!(StoreConfig::from_file(dir.path().join("missing.toml")).is_err());
    }
}
