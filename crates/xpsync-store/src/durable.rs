//! Backend selection and the teardown-safe access path.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use xpsync_shared::constants::{INDEXED_STORE_FILE, KV_STORE_DIR};
use xpsync_shared::{Event, EventId};

use crate::backend::{BackendKind, EventStore, PutOutcome};
use crate::database::SqliteEventStore;
use crate::error::Result;
use crate::kv::KvEventStore;

/// The store every outbox talks to.
///
/// The primary backend is chosen once in [`DurableStore::open`] and used for
/// every asynchronous write of the session; the key-value store is always
/// opened as well because it is the medium the synchronous path can read.
pub struct DurableStore {
    primary: Arc<dyn EventStore>,
    kv: Arc<KvEventStore>,
}

impl DurableStore {
    /// Open the stores under `data_dir`, preferring SQLite.
    ///
    /// When SQLite comes up, events a degraded earlier session left in the
    /// key-value store are moved into it first. Any failure to bring up SQLite is logged and the session continues on
    /// the key-value store alone. Only a failure of the key-value store too
    /// is returned as an error.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let kv = Arc::new(KvEventStore::open_at(&data_dir.join(KV_STORE_DIR))?);

        let db_path = data_dir.join(INDEXED_STORE_FILE);
        let primary: Arc<dyn EventStore> = match SqliteEventStore::open_at(&db_path) {
            Ok(db) => {
                adopt_leftovers(&db, &kv);
                Arc::new(db)
            }
            Err(e) => {
                tracing::warn!(
                    path = %db_path.display(),
                    error = %e,
                    "indexed store unavailable, using key-value store for this session"
                );
                kv.clone()
            }
        };

        Ok(Self { primary, kv })
    }

    /// Open with the key-value store as primary, skipping SQLite entirely.
    pub fn key_value_only(data_dir: &Path) -> Result<Self> {
        let kv = Arc::new(KvEventStore::open_at(&data_dir.join(KV_STORE_DIR))?);
        Ok(Self {
            primary: kv.clone(),
            kv,
        })
    }

    /// Assemble from already-open backends.
    pub fn from_parts(primary: Arc<dyn EventStore>, kv: Arc<KvEventStore>) -> Self {
        Self { primary, kv }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.primary.kind()
    }

    pub async fn put(&self, namespace: &str, event: &Event) -> Result<PutOutcome> {
        let outcome = self.primary.put(namespace, event).await?;
        if outcome == PutOutcome::Duplicate {
            tracing::debug!(namespace, id = %event.id, "event already durable");
        }
        Ok(outcome)
    }

    pub async fn get_all(&self, namespace: &str) -> Result<Vec<Event>> {
        self.primary.get_all(namespace).await
    }

    pub async fn count(&self, namespace: &str) -> Result<usize> {
        self.primary.count(namespace).await
    }

    pub async fn delete_many(&self, namespace: &str, ids: &[EventId]) -> Result<usize> {
        self.primary.delete_many(namespace, ids).await
    }

    pub async fn clear(&self, namespace: &str) -> Result<usize> {
        let mut removed = self.primary.clear(namespace).await?;
        if self.backend_kind() == BackendKind::Indexed {
            // leftovers from an earlier degraded session
            removed += self.kv.clear_sync(namespace)?;
        }
        Ok(removed)
    }

    /// Best-effort enumeration that never awaits.
    ///
    /// Always scans the key-value namespace; when SQLite is primary, its
    /// rows are included only if the connection is free right now.
    pub fn get_all_sync(&self, namespace: &str) -> Vec<Event> {
        let mut seen = HashSet::new();
        let mut events = Vec::new();

        let mut push_all = |batch: Vec<Event>| {
            for ev in batch {
                if seen.insert(ev.id.clone()) {
                    events.push(ev);
                }
            }
        };

        if let Some(batch) = self.kv.snapshot_now(namespace) {
            push_all(batch);
        }
        if self.backend_kind() == BackendKind::Indexed {
            match self.primary.snapshot_now(namespace) {
                Some(batch) => push_all(batch),
                None => tracing::debug!(namespace, "indexed store busy, sync scan skipped it"),
            }
        }

        events
    }

    /// Synchronous counterpart of [`DurableStore::delete_many`] for the
    /// teardown path, on the same non-blocking terms as `get_all_sync`.
    pub fn delete_many_sync(&self, namespace: &str, ids: &[EventId]) -> usize {
        let mut removed = self.kv.delete_now(namespace, ids).unwrap_or(0);
        if self.backend_kind() == BackendKind::Indexed {
            removed += self.primary.delete_now(namespace, ids).unwrap_or(0);
        }
        removed
    }
}

/// Move every key-value namespace into SQLite. A namespace is only cleared
/// once its events are committed; on error it stays for the next open and
/// the sync scan.
fn adopt_leftovers(db: &SqliteEventStore, kv: &KvEventStore) {
    let namespaces = match kv.namespaces() {
        Ok(names) => names,
        Err(e) => {
            tracing::warn!(dir = %kv.dir().display(), error = %e, "could not list key-value leftovers");
            return;
        }
    };
    for namespace in namespaces {
        let moved = kv
            .get_all_sync(&namespace)
            .and_then(|events| db.import(&namespace, &events).map(|n| (events.len(), n)))
            .and_then(|counts| kv.clear_sync(&namespace).map(|_| counts));
        match moved {
            Ok((found, imported)) => {
                tracing::info!(namespace = %namespace, found, imported, "key-value leftovers moved to indexed store")
            }
            Err(e) => {
                tracing::warn!(namespace = %namespace, error = %e, "key-value leftovers left in place")
            }
        }
    }
}
