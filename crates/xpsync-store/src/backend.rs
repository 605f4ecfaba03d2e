//! The storage capability shared by both backends.

use async_trait::async_trait;
use serde::Serialize;

use xpsync_shared::{Event, EventId};

use crate::error::Result;

/// Which medium a [`crate::DurableStore`] writes to this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// SQLite, transactional and indexed.
    Indexed,
    /// One JSON file per namespace.
    KeyValue,
}

/// Result of a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// The id was already stored; the existing record is kept untouched.
    Duplicate,
}

/// Append-only set of events per namespace, keyed by event id.
///
/// ## Ordering
///
/// `get_all` makes no ordering promise. Callers sort on `enqueued_at`.
///
/// ## Synchronous access
///
/// `snapshot_now` / `delete_now` never wait: they return `None` when the
/// backend cannot serve the request without blocking on another holder.
/// They exist for the teardown path, which cannot await.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    async fn put(&self, namespace: &str, event: &Event) -> Result<PutOutcome>;

    async fn get_all(&self, namespace: &str) -> Result<Vec<Event>>;

    async fn count(&self, namespace: &str) -> Result<usize>;

    /// Remove the given ids. Missing ids are ignored. Returns how many rows
    /// were actually removed.
    async fn delete_many(&self, namespace: &str, ids: &[EventId]) -> Result<usize>;

    async fn clear(&self, namespace: &str) -> Result<usize>;

    fn snapshot_now(&self, namespace: &str) -> Option<Vec<Event>>;

    fn delete_now(&self, namespace: &str, ids: &[EventId]) -> Option<usize>;
}
