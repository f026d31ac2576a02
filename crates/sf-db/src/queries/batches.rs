//! Batch aggregate operations.
//!
//! The aggregate columns are only ever overwritten with values recomputed
//! from part and attempt rows in the same transaction; nothing increments
//! them in place.

use rusqlite::{Connection, OptionalExtension};
use sf_core::{BatchId, BatchStatus, Error, Result, SourceItemId};

use crate::models::Batch;
use crate::{db_error, now_ts};

const COLS: &str = "id, source_item_id, total_parts, completed_parts, failed_indices,
    status, version, created_at, updated_at";

/// Create the batch row for a multi-part item.
pub fn create_batch(conn: &Connection, item_id: SourceItemId, total_parts: u32) -> Result<Batch> {
    let id = BatchId::new();
    let now = now_ts();

    conn.execute(
        "INSERT INTO batches (id, source_item_id, total_parts, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'processing', ?4, ?4)",
        rusqlite::params![id.to_string(), item_id.to_string(), total_parts, &now],
    )
    .map_err(db_error)?;

    Ok(Batch {
        id,
        source_item_id: item_id,
        total_parts,
        completed_parts: 0,
        failed_indices: Vec::new(),
        status: BatchStatus::Processing,
        version: 0,
        created_at: now.clone(),
        updated_at: now,
    })
}

/// Get a batch by ID.
pub fn get_batch(conn: &Connection, id: BatchId) -> Result<Option<Batch>> {
    let q = format!("SELECT {COLS} FROM batches WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], Batch::from_row)
        .optional()
        .map_err(db_error)
}

/// Get the batch of an item, if it has one.
pub fn get_for_item(conn: &Connection, item_id: SourceItemId) -> Result<Option<Batch>> {
    let q = format!("SELECT {COLS} FROM batches WHERE source_item_id = ?1");
    conn.query_row(&q, [item_id.to_string()], Batch::from_row)
        .optional()
        .map_err(db_error)
}

/// Batches in one status, oldest first.
pub fn list_by_status(conn: &Connection, status: BatchStatus) -> Result<Vec<Batch>> {
    let q = format!("SELECT {COLS} FROM batches WHERE status = ?1 ORDER BY created_at ASC");
    let mut stmt = conn.prepare(&q).map_err(db_error)?;
    let rows = stmt
        .query_map([status.as_str()], Batch::from_row)
        .map_err(db_error)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_error)?;
    Ok(rows)
}

/// Overwrite the aggregate with freshly derived values and bump `version`.
///
/// Returns the stored batch.
pub fn write_aggregate(
    conn: &Connection,
    id: BatchId,
    status: BatchStatus,
    completed_parts: u32,
    failed_indices: &[u32],
) -> Result<Batch> {
    let failed_json =
        serde_json::to_string(failed_indices).map_err(|e| Error::Internal(e.to_string()))?;
    let q = format!(
        "UPDATE batches SET status = ?1, completed_parts = ?2, failed_indices = ?3,
            version = version + 1, updated_at = ?4
         WHERE id = ?5
         RETURNING {COLS}"
    );
    conn.query_row(
        &q,
        rusqlite::params![status.as_str(), completed_parts, failed_json, now_ts(), id.to_string()],
        Batch::from_row,
    )
    .optional()
    .map_err(db_error)?
    .ok_or_else(|| Error::not_found("batch", id))
}

/// Delete the batch of an item.
pub fn delete_for_item(conn: &Connection, item_id: SourceItemId) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM batches WHERE source_item_id = ?1", [item_id.to_string()])
        .map_err(db_error)?;
    Ok(n > 0)
}
