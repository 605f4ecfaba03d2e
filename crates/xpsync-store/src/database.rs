//! Indexed store backed by SQLite.
//!
//! The [`SqliteEventStore`] owns a single [`rusqlite::Connection`] behind a
//! mutex and guarantees that migrations have run before any other operation.
//! Async calls run the query on the blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};

use xpsync_shared::{Event, EventId};

use crate::backend::{BackendKind, EventStore, PutOutcome};
use crate::error::{Result, StoreError};
use crate::migrations;

pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventStore {
    /// Open (or create) the store at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        migrations::run_migrations(&conn)?;

        tracing::info!(path = %path.display(), "indexed outbox store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Throwaway store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn try_lock(&self) -> Option<MutexGuard<'_, Connection>> {
        match self.conn.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) | Err(TryLockError::Poisoned(_)) => None,
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Copy `events` into `namespace`, keeping any record already present.
    /// Returns how many were new.
    pub fn import(&self, namespace: &str, events: &[Event]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        for event in events {
            if insert(&tx, namespace, event)? == PutOutcome::Inserted {
                inserted += 1;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }
}

fn insert(conn: &Connection, namespace: &str, event: &Event) -> Result<PutOutcome> {
    let body = serde_json::to_string(event)?;
    let enqueued_at = event.enqueued_at.unwrap_or_else(Utc::now);

    let affected = conn.execute(
        "INSERT OR IGNORE INTO pending_events
             (namespace, id, subject_id, category, body, created_at, enqueued_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            namespace,
            event.id.as_str(),
            event.subject_id.as_str(),
            event.category.as_str(),
            body,
            event.created_at.to_rfc3339(),
            enqueued_at.to_rfc3339(),
        ],
    )?;

    Ok(if affected == 0 {
        PutOutcome::Duplicate
    } else {
        PutOutcome::Inserted
    })
}

fn select_all(conn: &Connection, namespace: &str) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT id, body FROM pending_events
         WHERE namespace = ?1
         ORDER BY enqueued_at ASC",
    )?;

    let rows = stmt.query_map(params![namespace], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut events = Vec::new();
    for row in rows {
        let (id, body) = row?;
        // A corrupt row must not block the rest of the queue.
        match serde_json::from_str::<Event>(&body) {
            Ok(event) => events.push(event),
            Err(e) => tracing::warn!(namespace, id = %id, error = %e, "skipping unreadable event"),
        }
    }
    Ok(events)
}

fn delete_ids(conn: &mut Connection, namespace: &str, ids: &[EventId]) -> Result<usize> {
    let tx = conn.transaction()?;
    let mut removed = 0;
    {
        let mut stmt = tx.prepare("DELETE FROM pending_events WHERE namespace = ?1 AND id = ?2")?;
        for id in ids {
            removed += stmt.execute(params![namespace, id.as_str()])?;
        }
    }
    tx.commit()?;
    Ok(removed)
}

#[async_trait]
impl EventStore for SqliteEventStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Indexed
    }

    async fn put(&self, namespace: &str, event: &Event) -> Result<PutOutcome> {
        let namespace = namespace.to_string();
        let event = event.clone();
        self.with_conn(move |conn| insert(conn, &namespace, &event))
            .await
    }

    async fn get_all(&self, namespace: &str) -> Result<Vec<Event>> {
        let namespace = namespace.to_string();
        self.with_conn(move |conn| select_all(conn, &namespace)).await
    }

    async fn count(&self, namespace: &str) -> Result<usize> {
        let namespace = namespace.to_string();
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM pending_events WHERE namespace = ?1",
                params![namespace],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
        .await
    }

    async fn delete_many(&self, namespace: &str, ids: &[EventId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let namespace = namespace.to_string();
        let ids = ids.to_vec();
        self.with_conn(move |conn| delete_ids(conn, &namespace, &ids))
            .await
    }

    async fn clear(&self, namespace: &str) -> Result<usize> {
        let namespace = namespace.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM pending_events WHERE namespace = ?1",
                params![namespace],
            )?;
            Ok(removed)
        })
        .await
    }

    fn snapshot_now(&self, namespace: &str) -> Option<Vec<Event>> {
        let conn = self.try_lock()?;
        select_all(&conn, namespace).ok()
    }

    fn delete_now(&self, namespace: &str, ids: &[EventId]) -> Option<usize> {
        if ids.is_empty() {
            return Some(0);
        }
        let mut conn = self.try_lock()?;
        delete_ids(&mut conn, namespace, ids).ok()
    }
}
