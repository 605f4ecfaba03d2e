//! Schema steps for the indexed outbox.
//!
//! `PRAGMA user_version` records the last step applied. Opening a store
//! applies the missing steps in ascending order, each in its own transaction
//! together with the version bump. A file written by a newer schema is
//! refused rather than guessed at.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> std::result::Result<(), rusqlite::Error>;

/// (version, name, step), ascending.
const STEPS: &[(u32, &str, Step)] = &[(1, "v001_initial", v001_initial::up)];

fn latest() -> u32 {
    STEPS.last().map(|(version, _, _)| *version).unwrap_or(0)
}

fn user_version(conn: &Connection) -> Result<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let found = user_version(conn)?;
    let latest = latest();

    if found > latest {
        return Err(StoreError::Migration(format!(
            "outbox schema v{found} is newer than this build (v{latest})"
        )));
    }
    if found == latest {
        tracing::debug!(version = found, "outbox schema up to date");
        return Ok(());
    }

    for (version, name, step) in STEPS.iter().filter(|(v, _, _)| *v > found) {
        tracing::info!(from = found, to = *version, step = *name, "upgrading outbox schema");
        let tx = conn.unchecked_transaction()?;
        step(&tx).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        tx.pragma_update(None, "user_version", *version)?;
        tx.commit()?;
    }

    Ok(())
}
