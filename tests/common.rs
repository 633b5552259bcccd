#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tideline::{ChangeNotifier, EventStore, ManualClock, Message, StoreConfig};

pub fn temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub fn config(path: &Path) -> StoreConfig {
    StoreConfig::new(path).with_pool_size(2)
}

pub async fn temp_store(name: &str) -> (tempfile::TempDir, EventStore) {
    let (dir, path) = temp_db_file(name);
    let store = EventStore::open(config(&path)).await.expect("open store");
    (dir, store)
}

/// Store on `path` driven by `clock`. Stores opened with clones of the same
/// clock agree on lease expiry.
pub async fn store_with_clock(path: &Path, clock: &ManualClock) -> EventStore {
    EventStore::open_with(config(path), Arc::new(clock.clone()), ChangeNotifier::default())
        .await
        .expect("open store")
}

pub fn calculator_messages() -> Vec<Message> {
    vec![
        Message::new("DigitPressed", json!({ "digit": "1" })),
        Message::new("OperatorPressed", json!({ "operator": "+" })),
        Message::new("DigitPressed", json!({ "digit": "2" })),
        Message::new("EqualsPressed", json!(null)),
    ]
}

pub async fn eventually<T, F, Fut>(timeout: Duration, interval: Duration, mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f().await {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
