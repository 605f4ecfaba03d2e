//! Fire-and-forget sync notifications for any interested UI.

use serde::Serialize;
use tokio::sync::broadcast;

use xpsync_shared::constants::NOTIFICATION_CHANNEL_CAPACITY;
use xpsync_shared::{EventId, Stream};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncNotification {
    Started {
        stream: Stream,
        count: usize,
    },
    /// Carries the server's authoritative totals, if it sent any.
    Succeeded {
        stream: Stream,
        accepted_ids: Vec<EventId>,
        total_xp: Option<u64>,
        totals: serde_json::Map<String, serde_json::Value>,
    },
    Failed {
        stream: Stream,
        reason: String,
    },
}

/// Broadcast side of the notification channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<SyncNotification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.tx.subscribe()
    }

    pub fn emit(&self, notification: SyncNotification) {
        // An error only means nobody is listening.
        if self.tx.send(notification).is_err() {
            tracing::trace!("sync notification dropped, no subscribers");
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
