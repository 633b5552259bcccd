mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tideline::{
    CommittedEvent, Consumer, ConsumerConfig, EventHandler, EventId, EventMetadata, EventStore,
    ManualClock, Message, PollOptions, Result,
};

async fn commit_ticks(store: &EventStore, stream: &str, n: usize) {
    for i in 0..n {
        store
            .commit(stream, vec![Message::new("Tick", json!(i))], EventMetadata::default(), None)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn worker_poll_and_ack_by_global_id() {
    let (_dir, store) = common::temp_store("worker.db").await;
    commit_ticks(&store, "jobs", 3).await;

    let lease = store
        .poll("worker-1", PollOptions::new(Duration::from_millis(5000)).limit(10))
        .await
        .unwrap()
        .expect("lease granted");
    assert_eq!(lease.watermark, EventId::NONE);
    assert_eq!(lease.events.len(), 3);
    assert!(!lease.lease.is_empty());

    assert!(store.ack(&lease, Some(EventId::from_raw(2))).await.unwrap());

    let subs = store.subscriptions().await.unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].consumer, "worker-1");
    assert_eq!(subs[0].watermark, EventId::from_raw(2));
    assert!(subs[0].lease.is_none());
    assert!(subs[0].expires.is_none());
}

#[tokio::test]
async fn second_poll_is_refused_while_lease_is_valid() {
    let (_dir, store) = common::temp_store("double.db").await;
    commit_ticks(&store, "jobs", 2).await;

    let first = store.poll("w", PollOptions::default()).await.unwrap();
    assert!(first.is_some());
    assert!(store.poll("w", PollOptions::default()).await.unwrap().is_none());

    // Other consumers are independent.
    assert!(store.poll("other", PollOptions::default()).await.unwrap().is_some());
}

#[tokio::test]
async fn mismatched_ack_changes_nothing() {
    let (_dir, store) = common::temp_store("mismatch.db").await;
    commit_ticks(&store, "jobs", 3).await;

    let lease = store.poll("w", PollOptions::default().limit(1)).await.unwrap().unwrap();
    let mut forged = lease.clone();
    forged.lease = "not-the-token".to_string();

    assert!(!store.ack(&forged, Some(EventId::from_raw(2))).await.unwrap());
    let subs = store.subscriptions().await.unwrap();
    assert_eq!(subs[0].watermark, EventId::NONE);
    assert_eq!(subs[0].lease.as_deref(), Some(lease.lease.as_str()));

    assert!(store.ack(&lease, None).await.unwrap());
    assert_eq!(store.subscriptions().await.unwrap()[0].watermark, EventId::FIRST);
    // Already released.
    assert!(!store.ack(&lease, None).await.unwrap());
}

#[tokio::test]
async fn expired_lease_is_granted_again_and_old_ack_fails() {
    let clock = ManualClock::default();
    let (_dir, path) = common::temp_db_file("expiry.db");
    let store = common::store_with_clock(&path, &clock).await;
    commit_ticks(&store, "jobs", 4).await;

    let options = PollOptions::new(Duration::from_secs(5)).limit(2);
    let crashed = store.poll("w", options.clone()).await.unwrap().unwrap();

    clock.advance(Duration::from_secs(4));
    assert!(store.poll("w", options.clone()).await.unwrap().is_none());

    clock.advance(Duration::from_secs(1));
    let retry = store.poll("w", options.clone()).await.unwrap().unwrap();
    let ids = |events: &[CommittedEvent]| events.iter().map(|e| e.id).collect::<Vec<_>>();
    assert_eq!(ids(&retry.events), ids(&crashed.events));
    assert_ne!(retry.lease, crashed.lease);

    assert!(!store.ack(&crashed, None).await.unwrap());
    assert!(store.ack(&retry, None).await.unwrap());

    let next = store.poll("w", options).await.unwrap().unwrap();
    assert_eq!(next.watermark, EventId::from_raw(1));
    assert_eq!(next.events[0].id, EventId::from_raw(2));
}

#[tokio::test]
async fn poll_filters_by_name_and_watermark_never_regresses() {
    let (_dir, store) = common::temp_store("names.db").await;
    store
        .commit("Calc/A", common::calculator_messages(), EventMetadata::default(), None)
        .await
        .unwrap();

    let options = PollOptions::default().names(["DigitPressed"]);
    let lease = store.poll("digits", options.clone()).await.unwrap().unwrap();
    let ids: Vec<i64> = lease.events.iter().map(|e| e.id.as_raw()).collect();
    assert_eq!(ids, vec![0, 2]);
    assert!(store.ack(&lease, None).await.unwrap());

    // Nothing new for this consumer.
    assert!(store.poll("digits", options.clone()).await.unwrap().is_none());

    store
        .commit("Calc/A", vec![Message::new("DigitPressed", json!({ "digit": "3" }))], EventMetadata::default(), None)
        .await
        .unwrap();
    let lease = store.poll("digits", options).await.unwrap().unwrap();
    assert!(store.ack(&lease, Some(EventId::FIRST)).await.unwrap());
    assert_eq!(store.subscriptions().await.unwrap()[0].watermark, EventId::from_raw(2));
}

#[tokio::test]
async fn racing_instances_never_share_a_lease() {
    let (_dir, path) = common::temp_db_file("compete.db");
    let stores = [
        EventStore::open(common::config(&path)).await.unwrap(),
        EventStore::open(common::config(&path)).await.unwrap(),
        EventStore::open(common::config(&path)).await.unwrap(),
    ];
    commit_ticks(&stores[0], "jobs", 5).await;

    let polls = stores.iter().map(|s| s.poll("shared", PollOptions::default()));
    let granted: Vec<_> = futures::future::join_all(polls)
        .await
        .into_iter()
        .filter_map(|r| r.unwrap())
        .collect();
    assert_eq!(granted.len(), 1);
    assert_eq!(granted[0].events.len(), 5);
}

/// Records every handled event id, failing the test on a duplicate.
#[derive(Clone, Default)]
struct Exactly {
    seen: Arc<Mutex<HashSet<EventId>>>,
}

#[async_trait]
impl EventHandler for Exactly {
    async fn handle(&self, events: &[CommittedEvent]) -> Result<Option<EventId>> {
        let mut seen = self.seen.lock().unwrap();
        for event in events {
            assert!(seen.insert(event.id), "event {} handled twice", event.id);
        }
        Ok(None)
    }
}

#[tokio::test]
async fn competing_consumers_share_work_without_duplicates() {
    let (_dir, path) = common::temp_db_file("consumers.db");
    let producer = EventStore::open(common::config(&path)).await.unwrap();
    let handler = Exactly::default();

    let mut consumers = Vec::new();
    for _ in 0..3 {
        let store = EventStore::open(common::config(&path)).await.unwrap();
        let mut consumer = Consumer::new(
            store,
            ConsumerConfig::new("projector")
                .with_poll(PollOptions::default().limit(4))
                .with_idle_interval(Duration::from_millis(20)),
            handler.clone(),
        );
        consumer.start().unwrap();
        consumers.push(consumer);
    }

    commit_ticks(&producer, "jobs", 40).await;

    common::eventually(Duration::from_secs(10), Duration::from_millis(20), || {
        let producer = producer.clone();
        async move {
            let subs = producer.subscriptions().await.ok()?;
            subs.iter()
                .find(|s| s.consumer == "projector" && s.watermark == EventId::from_raw(39))
                .map(|_| ())
        }
    })
    .await;

    for consumer in &mut consumers {
        consumer.stop().await;
    }
    assert_eq!(handler.seen.lock().unwrap().len(), 40);
}
