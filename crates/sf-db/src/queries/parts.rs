//! Part operations.
//!
//! Parts are created in one shot when the script stage splits an item and
//! never change count afterwards. Artifact columns are write-once: setting
//! audio or video on a part that already has it reports `false`, which is
//! how a redelivered stage result is detected.

use rusqlite::{Connection, OptionalExtension};
use sf_core::{Error, PartId, Result, SourceItemId};

use crate::models::Part;
use crate::{db_error, now_ts};

const COLS: &str = "id, source_item_id, part_index, total_parts, script,
    audio_path, audio_duration_secs, video_path, created_at, updated_at";

/// Create one part per script, indexed 1..=N in order.
///
/// The `UNIQUE(source_item_id, part_index)` constraint makes a second call
/// for the same item fail with [`Error::Conflict`] rather than duplicate
/// parts.
pub fn create_parts(
    conn: &Connection,
    item_id: SourceItemId,
    scripts: &[String],
) -> Result<Vec<Part>> {
    if scripts.is_empty() {
        return Err(Error::Validation(format!(
            "item {item_id} must be split into at least one part"
        )));
    }

    let total = scripts.len() as u32;
    let now = now_ts();
    let mut stmt = conn
        .prepare(
            "INSERT INTO parts (id, source_item_id, part_index, total_parts, script, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        )
        .map_err(db_error)?;

    let mut parts = Vec::with_capacity(scripts.len());
    for (i, script) in scripts.iter().enumerate() {
        let id = PartId::new();
        let index = i as u32 + 1;
        stmt.execute(rusqlite::params![
            id.to_string(),
            item_id.to_string(),
            index,
            total,
            script,
            &now
        ])
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::Conflict(format!("part {index} of item {item_id} already exists"))
            }
            other => db_error(other),
        })?;

        parts.push(Part {
            id,
            source_item_id: item_id,
            part_index: index,
            total_parts: total,
            script: script.clone(),
            audio_path: None,
            audio_duration_secs: None,
            video_path: None,
            created_at: now.clone(),
            updated_at: now.clone(),
        });
    }
    Ok(parts)
}

/// Get a part by ID.
pub fn get_part(conn: &Connection, id: PartId) -> Result<Option<Part>> {
    let q = format!("SELECT {COLS} FROM parts WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], Part::from_row)
        .optional()
        .map_err(db_error)
}

/// Get a part, failing with [`Error::NotFound`] when it is missing.
pub fn require_part(conn: &Connection, id: PartId) -> Result<Part> {
    get_part(conn, id)?.ok_or_else(|| Error::not_found("part", id))
}

/// All parts of an item, ordered by index.
pub fn list_for_item(conn: &Connection, item_id: SourceItemId) -> Result<Vec<Part>> {
    let q = format!("SELECT {COLS} FROM parts WHERE source_item_id = ?1 ORDER BY part_index ASC");
    let mut stmt = conn.prepare(&q).map_err(db_error)?;
    let rows = stmt
        .query_map([item_id.to_string()], Part::from_row)
        .map_err(db_error)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_error)?;
    Ok(rows)
}

/// Record the narrated audio for a part. Returns `false` if already set.
pub fn set_audio(conn: &Connection, id: PartId, path: &str, duration_secs: f64) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE parts SET audio_path = ?1, audio_duration_secs = ?2, updated_at = ?3
             WHERE id = ?4 AND audio_path IS NULL",
            rusqlite::params![path, duration_secs, now_ts(), id.to_string()],
        )
        .map_err(db_error)?;
    Ok(n > 0)
}

/// Record the rendered video for a part. Returns `false` if already set.
pub fn set_video(conn: &Connection, id: PartId, path: &str) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE parts SET video_path = ?1, updated_at = ?2
             WHERE id = ?3 AND video_path IS NULL",
            rusqlite::params![path, now_ts(), id.to_string()],
        )
        .map_err(db_error)?;
    Ok(n > 0)
}

/// Number of parts of an item still waiting for audio.
pub fn count_missing_audio(conn: &Connection, item_id: SourceItemId) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM parts WHERE source_item_id = ?1 AND audio_path IS NULL",
        [item_id.to_string()],
        |row| row.get(0),
    )
    .map_err(db_error)
}

/// Number of parts of an item still waiting for video.
pub fn count_missing_video(conn: &Connection, item_id: SourceItemId) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM parts WHERE source_item_id = ?1 AND video_path IS NULL",
        [item_id.to_string()],
        |row| row.get(0),
    )
    .map_err(db_error)
}

/// Forget the artifact paths of a part after its files were purged.
pub fn clear_artifacts(conn: &Connection, id: PartId) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE parts SET audio_path = NULL, audio_duration_secs = NULL, video_path = NULL,
                updated_at = ?1
             WHERE id = ?2",
            rusqlite::params![now_ts(), id.to_string()],
        )
        .map_err(db_error)?;
    Ok(n > 0)
}

/// Delete every part of an item (cascades to attempts and part tasks).
pub fn delete_for_item(conn: &Connection, item_id: SourceItemId) -> Result<usize> {
    conn.execute("DELETE FROM parts WHERE source_item_id = ?1", [item_id.to_string()])
        .map_err(db_error)
}
