//! Embedded SQL migrations and runner.
//!
//! Migrations are stored as `&str` constants and executed in order.  A
//! `schema_migrations` table tracks which versions have been applied.

use rusqlite::Connection;

use af_core::{Error, Result};

/// V1: initial schema -- users, tracks, and the transcode job store.
const V1_INITIAL: &str = r#"
-- Track owners
CREATE TABLE users (
    id         TEXT PRIMARY KEY,
    username   TEXT UNIQUE NOT NULL,
    created_at TEXT NOT NULL
);

-- Uploaded tracks
CREATE TABLE tracks (
    id            TEXT PRIMARY KEY,
    user_id       TEXT NOT NULL REFERENCES users(id),
    title         TEXT NOT NULL,
    artist        TEXT NOT NULL,
    album         TEXT,
    duration_secs REAL,
    file_path     TEXT NOT NULL UNIQUE,
    quality       TEXT,
    size_bytes    INTEGER NOT NULL DEFAULT 0,
    mime_type     TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

-- Transcode jobs (encode queue)
CREATE TABLE transcode_jobs (
    id           TEXT PRIMARY KEY,
    track_id     TEXT NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
    status       TEXT NOT NULL DEFAULT 'pending',
    progress     REAL NOT NULL DEFAULT 0.0,
    quality      TEXT NOT NULL,
    input_path   TEXT NOT NULL,
    output_path  TEXT,
    error        TEXT,
    retry_count  INTEGER NOT NULL DEFAULT 0,
    max_retries  INTEGER NOT NULL DEFAULT 3,
    locked_by    TEXT,
    locked_at    TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    started_at   TEXT,
    completed_at TEXT
);

-- Indexes
CREATE INDEX idx_tracks_user ON tracks(user_id);
CREATE INDEX idx_jobs_status ON transcode_jobs(status);
CREATE INDEX idx_jobs_track  ON transcode_jobs(track_id);
"#;

/// V2: retry scheduling and cooperative cancellation flags.
const V2_RETRY_AND_CANCEL: &str = r#"
ALTER TABLE transcode_jobs ADD COLUMN scheduled_for TEXT;
ALTER TABLE transcode_jobs ADD COLUMN cancel_requested INTEGER NOT NULL DEFAULT 0;
CREATE INDEX idx_jobs_scheduled ON transcode_jobs(scheduled_for);
"#;

/// V3: seed the system user that owns CLI-registered tracks.
///
/// Tracks registered outside a user session (ad-hoc CLI imports) are owned
/// by this well-known UUID.  Without a corresponding row in `users`, any
/// INSERT into `tracks` violates the FK constraint.
const V3_SYSTEM_USER: &str = r#"
INSERT OR IGNORE INTO users (id, username, created_at)
VALUES ('00000000-0000-0000-0000-000000000000', 'system', datetime('now'));
"#;

/// Ordered list of (version, sql) pairs.
const MIGRATIONS: &[(i64, &str)] = &[
    (1, V1_INITIAL),
    (2, V2_RETRY_AND_CANCEL),
    (3, V3_SYSTEM_USER),
];

/// Run all pending migrations on `conn`.
///
/// Creates the `schema_migrations` tracking table if it does not exist,
/// then applies each outstanding migration inside a transaction.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .map_err(|e| Error::database(format!("Failed to create schema_migrations: {e}")))?;

    for &(version, sql) in MIGRATIONS {
        let already: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(e.to_string()))?;

        if already {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::database(e.to_string()))?;

        tx.execute_batch(sql)
            .map_err(|e| Error::database(format!("Migration V{version} failed: {e}")))?;

        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(|e| Error::database(e.to_string()))?;

        tx.commit().map_err(|e| Error::database(e.to_string()))?;
    }

    Ok(())
}
