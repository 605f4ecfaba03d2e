//! # xpsync-store
//!
//! Durable local storage for pending outbox events.
//!
//! Two interchangeable backends implement [`EventStore`]: an indexed,
//! transactional SQLite store and a plain key-value store made of one JSON
//! file per namespace. [`DurableStore`] picks one at startup, falling back
//! to the key-value store for the whole session when SQLite cannot be
//! opened, and exposes the synchronous enumeration path used during
//! teardown.

pub mod backend;
pub mod database;
pub mod durable;
pub mod kv;
pub mod migrations;

mod error;

pub use backend::{BackendKind, EventStore, PutOutcome};
pub use database::SqliteEventStore;
pub use durable::DurableStore;
pub use error::StoreError;
pub use kv::KvEventStore;
