//! Embedded SQL migrations and runner.
//!
//! Migrations are stored as `&str` constants and executed in order.  A
//! `schema_migrations` table tracks which versions have been applied.

use rusqlite::Connection;
use sf_core::{Error, Result};

use crate::db_error;

/// V1: initial schema -- entity tables, task queue, quota counter, indexes.
const V1_INITIAL: &str = r#"
-- Source items
CREATE TABLE source_items (
    id               TEXT PRIMARY KEY,
    source           TEXT NOT NULL,
    external_id      TEXT NOT NULL,
    title            TEXT NOT NULL,
    body             TEXT NOT NULL,
    char_count       INTEGER NOT NULL,
    status           TEXT NOT NULL DEFAULT 'pending',
    error            TEXT,
    rejection_reason TEXT,
    needs_attention  INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    UNIQUE(source, external_id)
);

-- Parts derived from one source item
CREATE TABLE parts (
    id                  TEXT PRIMARY KEY,
    source_item_id      TEXT NOT NULL REFERENCES source_items(id) ON DELETE CASCADE,
    part_index          INTEGER NOT NULL,
    total_parts         INTEGER NOT NULL,
    script              TEXT NOT NULL,
    audio_path          TEXT,
    audio_duration_secs REAL,
    video_path          TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    UNIQUE(source_item_id, part_index),
    CHECK (part_index >= 1 AND part_index <= total_parts)
);

-- Publish attempts
CREATE TABLE publish_attempts (
    id           TEXT PRIMARY KEY,
    part_id      TEXT NOT NULL REFERENCES parts(id) ON DELETE CASCADE,
    platform     TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'pending',
    retry_count  INTEGER NOT NULL DEFAULT 0,
    error        TEXT,
    platform_ref TEXT,
    platform_url TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    published_at TEXT
);

-- Batch aggregate over a multi-part item
CREATE TABLE batches (
    id              TEXT PRIMARY KEY,
    source_item_id  TEXT NOT NULL UNIQUE REFERENCES source_items(id) ON DELETE CASCADE,
    total_parts     INTEGER NOT NULL,
    completed_parts INTEGER NOT NULL DEFAULT 0,
    failed_indices  TEXT NOT NULL DEFAULT '[]',
    status          TEXT NOT NULL DEFAULT 'processing',
    version         INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

-- Run audit records (no foreign keys: purely observational)
CREATE TABLE pipeline_runs (
    id             TEXT PRIMARY KEY,
    source_item_id TEXT NOT NULL,
    batch_id       TEXT,
    current_stage  TEXT,
    status         TEXT NOT NULL DEFAULT 'running',
    error          TEXT,
    started_at     TEXT NOT NULL,
    completed_at   TEXT
);

-- Stage task queue
CREATE TABLE stage_tasks (
    id             TEXT PRIMARY KEY,
    kind           TEXT NOT NULL,
    source_item_id TEXT NOT NULL REFERENCES source_items(id) ON DELETE CASCADE,
    part_id        TEXT REFERENCES parts(id) ON DELETE CASCADE,
    attempt_id     TEXT REFERENCES publish_attempts(id) ON DELETE CASCADE,
    status         TEXT NOT NULL DEFAULT 'queued',
    attempts       INTEGER NOT NULL DEFAULT 0,
    locked_by      TEXT,
    locked_at      TEXT,
    scheduled_for  TEXT,
    last_error     TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

-- Daily publish quota per platform
CREATE TABLE publish_quota (
    platform TEXT NOT NULL,
    day      TEXT NOT NULL,
    used     INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (platform, day)
);

-- Indexes
CREATE INDEX idx_source_items_status ON source_items(status);
CREATE INDEX idx_parts_item ON parts(source_item_id);
CREATE INDEX idx_attempts_part ON publish_attempts(part_id);
CREATE INDEX idx_attempts_status ON publish_attempts(status);
CREATE INDEX idx_batches_status ON batches(status);
CREATE INDEX idx_runs_item ON pipeline_runs(source_item_id);
CREATE INDEX idx_tasks_status ON stage_tasks(status, scheduled_for);
CREATE INDEX idx_tasks_item ON stage_tasks(source_item_id);
"#;

/// All migrations in order.  Each entry is `(version, sql)`.
const MIGRATIONS: &[(i64, &str)] = &[(1, V1_INITIAL)];

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
            .map_err(db_error)?;

        if already {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(db_error)?;

        tx.execute_batch(sql)
            .map_err(|e| Error::database(format!("Migration V{version} failed: {e}")))?;

        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(db_error)?;

        tx.commit()
            .map_err(db_error)?;
    }

    Ok(())
}
