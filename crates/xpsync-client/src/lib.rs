//! # xpsync-client
//!
//! Offline-first delivery of XP and quest events.
//!
//! Producers hand events to an [`Outbox`], which persists them in the
//! [`DurableStore`] before anything touches the network. The
//! [`SyncManager`] flushes every outbox on a timer, on host lifecycle
//! signals and on demand. Delivery is at-least-once; the server
//! deduplicates by event id.
//!
//! [`SyncClient`] wires the pieces together for a host process.

pub mod auth;
pub mod category;
pub mod config;
pub mod events;
pub mod hygiene;
pub mod lifecycle;
pub mod manager;
pub mod outbox;
pub mod transport;

mod error;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::info;

use xpsync_shared::{Event, Stream};
use xpsync_store::{BackendKind, DurableStore, PutOutcome};

pub use auth::{CredentialProvider, StaticCredentials};
pub use category::CategorySpec;
pub use config::SyncConfig;
pub use error::ClientError;
pub use events::{Notifier, SyncNotification};
pub use hygiene::HygieneReport;
pub use lifecycle::LifecycleEvent;
pub use manager::{FlushReport, SyncManager, SyncState};
pub use outbox::{BeaconOutcome, FlushOutcome, Outbox, OutboxConfig, OutboxError, OutboxStatus};
pub use transport::{HttpTransport, SyncResponse, SyncTransport, TransportError};

/// One store, one outbox per stream, one manager.
pub struct SyncClient {
    store: Arc<DurableStore>,
    xp: Arc<Outbox>,
    quest: Arc<Outbox>,
    manager: Arc<SyncManager>,
    auth: Arc<dyn CredentialProvider>,
}

impl SyncClient {
    pub fn build(
        config: &SyncConfig,
        auth: Arc<dyn CredentialProvider>,
        transport: Arc<dyn SyncTransport>,
    ) -> Result<Self, ClientError> {
        let store = Arc::new(DurableStore::open(&config.data_dir)?);
        info!(
            backend = ?store.backend_kind(),
            data_dir = %config.data_dir.display(),
            "durable store ready"
        );
        Ok(Self::with_store(config, store, auth, transport))
    }

    /// Build against the HTTP sync API at `config.base_url`.
    pub fn connect(config: &SyncConfig, auth: Arc<dyn CredentialProvider>) -> Result<Self, ClientError> {
        let transport = Arc::new(HttpTransport::new(&config.base_url, config.request_timeout)?);
        Self::build(config, auth, transport)
    }

    pub fn with_store(
        config: &SyncConfig,
        store: Arc<DurableStore>,
        auth: Arc<dyn CredentialProvider>,
        transport: Arc<dyn SyncTransport>,
    ) -> Self {
        let notifier = Notifier::new();
        let outbox_config = OutboxConfig::from(config);
        let make = |spec: CategorySpec| {
            Arc::new(Outbox::new(
                spec,
                store.clone(),
                transport.clone(),
                auth.clone(),
                notifier.clone(),
                outbox_config.clone(),
            ))
        };
        let [xp, quest] = Stream::ALL.map(|stream| make(CategorySpec::for_stream(stream)));
        let manager = Arc::new(SyncManager::new(
            vec![xp.clone(), quest.clone()],
            config,
            notifier,
        ));

        Self {
            store,
            xp,
            quest,
            manager,
            auth,
        }
    }

    pub fn xp(&self) -> &Arc<Outbox> {
        &self.xp
    }

    pub fn quest(&self) -> &Arc<Outbox> {
        &self.quest
    }

    pub fn outbox(&self, stream: Stream) -> &Arc<Outbox> {
        match stream {
            Stream::Xp => &self.xp,
            Stream::Quest => &self.quest,
        }
    }

    pub fn manager(&self) -> &Arc<SyncManager> {
        &self.manager
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.store.backend_kind()
    }

    /// Route `event` to the outbox of its stream.
    pub async fn enqueue(&self, event: Event) -> Result<PutOutcome, OutboxError> {
        self.outbox(event.stream()).enqueue(event).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.manager.subscribe()
    }

    /// Purge events of other principals, then start the timer and the
    /// lifecycle listener.
    pub async fn start(
        &self,
        lifecycle: Option<mpsc::Receiver<LifecycleEvent>>,
    ) -> Result<HygieneReport, ClientError> {
        let report = hygiene::purge_foreign_events(self.manager.outboxes(), self.auth.as_ref()).await?;
        self.manager.initialize(lifecycle);
        Ok(report)
    }

    /// Stop background work with one last forced flush.
    pub async fn shutdown(&self) -> FlushReport {
        self.manager.cleanup().await
    }

    /// Final flush before an intentional sign-out. Whatever could not be
    /// delivered stays queued; returns how many events that is.
    pub async fn logout(&self) -> Result<usize, ClientError> {
        self.manager.cleanup().await;
        let mut remaining = 0;
        for outbox in self.manager.outboxes() {
            remaining += outbox.pending_count().await?;
        }
        if remaining > 0 {
            info!(remaining, "signed out with undelivered events");
        }
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{eventually, MockTransport};

    fn client(dir: &std::path::Path, transport: Arc<MockTransport>) -> SyncClient {
        let config = SyncConfig {
            follow_up_delay: Duration::from_millis(10),
            ..SyncConfig::with_data_dir(dir)
        };
        SyncClient::build(&config, crate::testing::signed_in("u1"), transport).unwrap()
    }

    #[tokio::test]
    async fn enqueue_routes_by_stream_and_syncs() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::accepting();
        let client = client(dir.path(), transport.clone());
        assert_eq!(client.backend_kind(), BackendKind::Indexed);

        client.enqueue(Event::xp("u1", "typing", 4).with_id("x")).await.unwrap();
        client
            .enqueue(Event::quest_progress("u1", "q1", 1).with_id("q"))
            .await
            .unwrap();

        let t = transport.clone();
        assert!(eventually(|| {
            let t = t.clone();
            async move { t.applied().len() == 2 }
        })
        .await);

        let calls = transport.batch_calls();
        assert!(calls.iter().any(|c| c.endpoint == "/api/xp/sync" && c.ids[0].as_str() == "x"));
        assert!(calls.iter().any(|c| c.endpoint == "/api/quests/sync" && c.ids[0].as_str() == "q"));
    }

    #[tokio::test]
    async fn start_purges_foreign_events() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new(crate::testing::Reply::Status(503));
        let client = client(dir.path(), transport);
        client
            .enqueue(Event::xp("someone-else", "typing", 4).with_id("old"))
            .await
            .unwrap();

        let report = client.start(None).await.unwrap();
        assert_eq!(report.total(), 1);
        assert_eq!(client.xp().pending_count().await.unwrap(), 0);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn logout_keeps_undelivered_events() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new(crate::testing::Reply::Status(503));
        let client = client(dir.path(), transport);
        client.enqueue(Event::xp("u1", "typing", 4)).await.unwrap();
        client
            .enqueue(Event::quest_completion("u1", "q1", 20))
            .await
            .unwrap();

        assert_eq!(client.logout().await.unwrap(), 2);
        assert_eq!(client.xp().pending_count().await.unwrap(), 1);
        assert_eq!(client.quest().pending_count().await.unwrap(), 1);
    }
}
