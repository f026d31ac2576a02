//! Pipeline run audit records.

use rusqlite::{Connection, OptionalExtension};
use sf_core::{BatchId, Result, RunId, RunStatus, SourceItemId};

use crate::models::PipelineRun;
use crate::{db_error, now_ts};

const COLS: &str = "id, source_item_id, batch_id, current_stage, status, error,
    started_at, completed_at";

/// Open a new run for an item.
pub fn start_run(conn: &Connection, item_id: SourceItemId) -> Result<PipelineRun> {
    let id = RunId::new();
    let now = now_ts();

    conn.execute(
        "INSERT INTO pipeline_runs (id, source_item_id, status, started_at)
         VALUES (?1, ?2, 'running', ?3)",
        rusqlite::params![id.to_string(), item_id.to_string(), &now],
    )
    .map_err(db_error)?;

    Ok(PipelineRun {
        id,
        source_item_id: item_id,
        batch_id: None,
        current_stage: None,
        status: RunStatus::Running,
        error: None,
        started_at: now,
        completed_at: None,
    })
}

/// Get a run by ID.
pub fn get_run(conn: &Connection, id: RunId) -> Result<Option<PipelineRun>> {
    let q = format!("SELECT {COLS} FROM pipeline_runs WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], PipelineRun::from_row)
        .optional()
        .map_err(db_error)
}

/// The most recent still-running run of an item.
pub fn open_run_for_item(conn: &Connection, item_id: SourceItemId) -> Result<Option<PipelineRun>> {
    let q = format!(
        "SELECT {COLS} FROM pipeline_runs
         WHERE source_item_id = ?1 AND status = 'running'
         ORDER BY started_at DESC, rowid DESC LIMIT 1"
    );
    conn.query_row(&q, [item_id.to_string()], PipelineRun::from_row)
        .optional()
        .map_err(db_error)
}

/// All runs of an item, newest first.
pub fn list_for_item(conn: &Connection, item_id: SourceItemId) -> Result<Vec<PipelineRun>> {
    let q = format!(
        "SELECT {COLS} FROM pipeline_runs WHERE source_item_id = ?1
         ORDER BY started_at DESC, rowid DESC"
    );
    let mut stmt = conn.prepare(&q).map_err(db_error)?;
    let rows = stmt
        .query_map([item_id.to_string()], PipelineRun::from_row)
        .map_err(db_error)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_error)?;
    Ok(rows)
}

/// Record the stage a run is currently in.
pub fn record_stage(conn: &Connection, id: RunId, stage: &str) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE pipeline_runs SET current_stage = ?1 WHERE id = ?2",
            rusqlite::params![stage, id.to_string()],
        )
        .map_err(db_error)?;
    Ok(n > 0)
}

/// Attach the batch created for a run's item.
pub fn set_batch(conn: &Connection, id: RunId, batch_id: BatchId) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE pipeline_runs SET batch_id = ?1 WHERE id = ?2",
            rusqlite::params![batch_id.to_string(), id.to_string()],
        )
        .map_err(db_error)?;
    Ok(n > 0)
}

/// Close a run. An error marks it failed.
pub fn complete_run(conn: &Connection, id: RunId, error: Option<&str>) -> Result<bool> {
    let status = if error.is_some() {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };
    let n = conn
        .execute(
            "UPDATE pipeline_runs SET status = ?1, error = ?2, completed_at = ?3
             WHERE id = ?4 AND status = 'running'",
            rusqlite::params![status.as_str(), error, now_ts(), id.to_string()],
        )
        .map_err(db_error)?;
    Ok(n > 0)
}
