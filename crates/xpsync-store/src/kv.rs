//! Simple persistent key-value store.
//!
//! Each namespace is one JSON file (`<namespace>.json`) mapping event id to
//! event. Writes replace the whole file through a temporary sibling and a
//! rename, so a crash mid-write leaves the previous contents intact. Every
//! operation is synchronous, which is what makes this medium readable from
//! the teardown path. The async trait methods hand the same work to the
//! blocking pool.
//!
//! A namespace file that no longer parses is moved aside to
//! `<namespace>.json.corrupt` and the namespace starts over empty.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use xpsync_shared::{Event, EventId};

use crate::backend::{BackendKind, EventStore, PutOutcome};
use crate::error::{Result, StoreError};

type Namespace = BTreeMap<String, Event>;

#[derive(Clone)]
pub struct KvEventStore {
    dir: PathBuf,
    // serializes read-modify-write cycles within this process
    write_lock: Arc<Mutex<()>>,
}

impl KvEventStore {
    /// Open (or create) the store rooted at `dir`.
    pub fn open_at(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.json"))
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn load(&self, namespace: &str) -> Result<Namespace> {
        let path = self.file(namespace);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Namespace::new()),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(Namespace::new());
        }
        match serde_json::from_str(&text) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                quarantine(&path, &e);
                Ok(Namespace::new())
            }
        }
    }

    fn save(&self, namespace: &str, entries: &Namespace) -> Result<()> {
        let path = self.file(namespace);
        if entries.is_empty() {
            return remove_if_present(&path);
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(entries)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Names of the namespaces that currently have a file.
    pub fn namespaces(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn put_sync(&self, namespace: &str, event: &Event) -> Result<PutOutcome> {
        let _guard = self.guard()?;
        let mut entries = self.load(namespace)?;
        if entries.contains_key(event.id.as_str()) {
            return Ok(PutOutcome::Duplicate);
        }
        entries.insert(event.id.0.clone(), event.clone());
        self.save(namespace, &entries)?;
        Ok(PutOutcome::Inserted)
    }

    pub fn get_all_sync(&self, namespace: &str) -> Result<Vec<Event>> {
        Ok(self.load(namespace)?.into_values().collect())
    }

    pub fn delete_many_sync(&self, namespace: &str, ids: &[EventId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let _guard = self.guard()?;
        let mut entries = self.load(namespace)?;
        let before = entries.len();
        for id in ids {
            entries.remove(id.as_str());
        }
        let removed = before - entries.len();
        if removed > 0 {
            self.save(namespace, &entries)?;
        }
        Ok(removed)
    }

    /// Drop the namespace file, whatever state it is in.
    pub fn clear_sync(&self, namespace: &str) -> Result<usize> {
        let _guard = self.guard()?;
        let removed = match self.load(namespace) {
            Ok(entries) => entries.len(),
            Err(e) => {
                tracing::warn!(namespace, error = %e, "clearing unreadable key-value namespace");
                0
            }
        };
        remove_if_present(&self.file(namespace))?;
        Ok(removed)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&KvEventStore) -> Result<T> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(&this))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn quarantine(path: &Path, error: &serde_json::Error) {
    let target = path.with_extension("json.corrupt");
    match std::fs::rename(path, &target) {
        Ok(()) => tracing::warn!(
            path = %path.display(),
            moved_to = %target.display(),
            error = %error,
            "unreadable key-value namespace moved aside"
        ),
        Err(e) => tracing::warn!(
            path = %path.display(),
            error = %e,
            "unreadable key-value namespace could not be moved aside"
        ),
    }
}

#[async_trait]
impl EventStore for KvEventStore {
    fn kind(&self) -> BackendKind {
        BackendKind::KeyValue
    }

    async fn put(&self, namespace: &str, event: &Event) -> Result<PutOutcome> {
        let namespace = namespace.to_string();
        let event = event.clone();
        self.blocking(move |kv| kv.put_sync(&namespace, &event)).await
    }

    async fn get_all(&self, namespace: &str) -> Result<Vec<Event>> {
        let namespace = namespace.to_string();
        self.blocking(move |kv| kv.get_all_sync(&namespace)).await
    }

    async fn count(&self, namespace: &str) -> Result<usize> {
        let namespace = namespace.to_string();
        self.blocking(move |kv| Ok(kv.load(&namespace)?.len())).await
    }

    async fn delete_many(&self, namespace: &str, ids: &[EventId]) -> Result<usize> {
        let namespace = namespace.to_string();
        let ids = ids.to_vec();
        self.blocking(move |kv| kv.delete_many_sync(&namespace, &ids))
            .await
    }

    async fn clear(&self, namespace: &str) -> Result<usize> {
        let namespace = namespace.to_string();
        self.blocking(move |kv| kv.clear_sync(&namespace)).await
    }

    fn snapshot_now(&self, namespace: &str) -> Option<Vec<Event>> {
        match self.get_all_sync(namespace) {
            Ok(events) => Some(events),
            Err(e) => {
                tracing::warn!(namespace, error = %e, "key-value namespace unreadable");
                None
            }
        }
    }

    fn delete_now(&self, namespace: &str, ids: &[EventId]) -> Option<usize> {
        self.delete_many_sync(namespace, ids).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvEventStore::open_at(dir.path()).unwrap();

        let ev = Event::quest_completion("u1", "q1", 40).with_id("c1");
        assert_eq!(store.put("quest", &ev).await.unwrap(), PutOutcome::Inserted);
        assert_eq!(store.put("quest", &ev).await.unwrap(), PutOutcome::Duplicate);
        assert!(dir.path().join("quest.json").exists());
        assert_eq!(store.namespaces().unwrap(), vec!["quest".to_string()]);

        let reopened = KvEventStore::open_at(dir.path()).unwrap();
        assert_eq!(reopened.get_all("quest").await.unwrap(), vec![ev]);
    }

    #[tokio::test]
    async fn deleting_everything_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvEventStore::open_at(dir.path()).unwrap();
        store.put("xp", &Event::xp("u1", "typing", 1).with_id("x")).await.unwrap();

        assert_eq!(store.delete_many("xp", &["x".into(), "y".into()]).await.unwrap(), 1);
        assert_eq!(store.delete_many("xp", &["x".into()]).await.unwrap(), 0);
        assert!(!dir.path().join("xp.json").exists());
        assert_eq!(store.count("xp").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn corrupt_namespace_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("xp.json"), b"{not json").unwrap();
        let store = KvEventStore::open_at(dir.path()).unwrap();

        assert!(store.get_all("xp").await.unwrap().is_empty());
        assert!(!dir.path().join("xp.json").exists());
        assert!(dir.path().join("xp.json.corrupt").exists());
        assert!(store.namespaces().unwrap().is_empty());

        let ev = Event::xp("u1", "typing", 2).with_id("fresh");
        assert_eq!(store.put("xp", &ev).await.unwrap(), PutOutcome::Inserted);
        assert_eq!(store.get_all("xp").await.unwrap(), vec![ev]);
    }

    #[tokio::test]
    async fn clear_recovers_a_corrupt_namespace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("quest.json"), b"[1, 2").unwrap();
        let store = KvEventStore::open_at(dir.path()).unwrap();

        assert_eq!(store.clear("quest").await.unwrap(), 0);
        assert!(!dir.path().join("quest.json").exists());
        assert_eq!(store.count("quest").await.unwrap(), 0);
    }
}
