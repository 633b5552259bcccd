//! Change notifications.
//!
//! After a commit, the store announces the new events on a broadcast channel
//! keyed by the event table name. Listeners use this to wake up instead of
//! busy-polling. Delivery is best-effort: a lagging or missing receiver loses
//! notifications, never events, because consumers always resume from their
//! persisted watermark.
//!
//! The [`ChangeNotifier`] is an explicit context object. Store instances that
//! should hear each other's commits are built with clones of the same
//! notifier; instances with separate notifiers (or in separate processes) only
//! meet through the database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::EventId;

/// Default capacity of each channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Announcement of one successful commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Event table the commit went to.
    pub channel: String,
    /// Name of the first committed event.
    pub name: String,
    /// Global id of the first committed event.
    pub id: EventId,
    /// Global id of the last committed event.
    pub last_id: EventId,
}

/// Registry of broadcast channels, one per event table.
///
/// Clones share the registry. Channels are created on first use and live
/// until [`ChangeNotifier::close`] or until every clone is dropped.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Notification>>>>,
    capacity: usize,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<Notification>>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Receiver for every notification sent on `channel` from now on.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Notification> {
        self.channels()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Sends `notification` on its channel. Returns how many receivers got it.
    pub fn notify(&self, notification: Notification) -> usize {
        let sender = self.channels().get(&notification.channel).cloned();
        match sender {
            Some(sender) => match sender.send(notification) {
                Ok(n) => n,
                Err(broadcast::error::SendError(dropped)) => {
                    trace!(channel = %dropped.channel, id = %dropped.id, "no listeners for notification");
                    0
                }
            },
            None => {
                trace!(channel = %notification.channel, id = %notification.id, "no listeners for notification");
                0
            }
        }
    }

    /// Drops `channel`; its receivers see the channel close once drained.
    pub fn close(&self, channel: &str) {
        self.channels().remove(channel);
    }

    pub fn receiver_count(&self, channel: &str) -> usize {
        self.channels()
            .get(channel)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(channel: &str, id: i64) -> Notification {
        Notification {
            channel: channel.to_string(),
            name: "Created".to_string(),
            id: EventId::from_raw(id),
            last_id: EventId::from_raw(id),
        }
    }

    #[tokio::test]
    async fn delivers_only_on_matching_channel() {
        let notifier = ChangeNotifier::default();
        let mut orders = notifier.subscribe("orders");
        let mut users = notifier.subscribe("users");

        assert_eq!(notifier.notify(note("orders", 4)), 1);
        assert_eq!(orders.recv().await.unwrap().id, EventId::from_raw(4));
        assert!(users.try_recv().is_err());
    }

    #[test]
    fn notify_without_listeners_is_harmless() {
        let notifier = ChangeNotifier::default();
        assert_eq!(notifier.notify(note("nobody", 0)), 0);

        let rx = notifier.subscribe("gone");
        drop(rx);
        assert_eq!(notifier.notify(note("gone", 1)), 0);
    }

    #[tokio::test]
    async fn clones_share_channels_and_close_ends_them() {
        let notifier = ChangeNotifier::default();
        let mut rx = notifier.clone().subscribe("events");
        assert_eq!(notifier.receiver_count("events"), 1);

        notifier.close("events");
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
