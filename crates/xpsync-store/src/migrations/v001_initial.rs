//! v001 -- Pending-event table.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS pending_events (
    namespace   TEXT NOT NULL,               -- outbox stream ("xp", "quest")
    id          TEXT NOT NULL,               -- client-generated idempotency key
    subject_id  TEXT NOT NULL,
    category    TEXT NOT NULL,
    body        TEXT NOT NULL,               -- full event as JSON
    created_at  TEXT NOT NULL,               -- RFC-3339
    enqueued_at TEXT NOT NULL,               -- RFC-3339

    PRIMARY KEY (namespace, id)
);

CREATE INDEX IF NOT EXISTS idx_pending_events_ns_enqueued
    ON pending_events(namespace, enqueued_at);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
