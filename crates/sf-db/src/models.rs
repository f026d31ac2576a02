//! Rust structs mapping to database tables.
//!
//! Each model implements `from_row` for constructing itself from a
//! `rusqlite::Row` selected with the owning query module's `COLS`.
//! Status columns are parsed into the typed enums from `sf_core`, so an
//! unknown string surfaces as a conversion error rather than a silent
//! default.

use std::str::FromStr;

use serde::Serialize;
use sf_core::{
    AttemptStatus, BatchId, BatchStatus, ItemStatus, PartId, PublishAttemptId, RunId, RunStatus,
    SourceItemId, TaskId, TaskKind, TaskStatus,
};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

/// Parse a UUID-based ID from a text column.
fn parse_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    let uuid = Uuid::parse_str(&s).map_err(|e| conversion_err(idx, e))?;
    Ok(T::from(uuid))
}

fn parse_opt_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<T>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(v) => {
            let uuid = Uuid::parse_str(&v).map_err(|e| conversion_err(idx, e))?;
            Ok(Some(T::from(uuid)))
        }
        None => Ok(None),
    }
}

/// Parse a status-like enum from a text column.
fn parse_enum<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = sf_core::Error>,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_err(idx, e))
}

// ---------------------------------------------------------------------------
// SourceItem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SourceItem {
    pub id: SourceItemId,
    pub source: String,
    pub external_id: String,
    pub title: String,
    pub body: String,
    pub char_count: i64,
    pub status: ItemStatus,
    pub error: Option<String>,
    pub rejection_reason: Option<String>,
    pub needs_attention: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl SourceItem {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            source: row.get(1)?,
            external_id: row.get(2)?,
            title: row.get(3)?,
            body: row.get(4)?,
            char_count: row.get(5)?,
            status: parse_enum(row, 6)?,
            error: row.get(7)?,
            rejection_reason: row.get(8)?,
            needs_attention: row.get::<_, i64>(9)? != 0,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

/// Input for inserting a fetched source item.
#[derive(Debug, Clone)]
pub struct NewSourceItem {
    pub source: String,
    pub external_id: String,
    pub title: String,
    pub body: String,
}

// ---------------------------------------------------------------------------
// Part
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Part {
    pub id: PartId,
    pub source_item_id: SourceItemId,
    /// 1-based position within the parent item.
    pub part_index: u32,
    pub total_parts: u32,
    pub script: String,
    pub audio_path: Option<String>,
    pub audio_duration_secs: Option<f64>,
    pub video_path: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Part {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            source_item_id: parse_id(row, 1)?,
            part_index: row.get(2)?,
            total_parts: row.get(3)?,
            script: row.get(4)?,
            audio_path: row.get(5)?,
            audio_duration_secs: row.get(6)?,
            video_path: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}

// ---------------------------------------------------------------------------
// PublishAttempt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PublishAttempt {
    pub id: PublishAttemptId,
    pub part_id: PartId,
    pub platform: String,
    pub status: AttemptStatus,
    pub retry_count: u32,
    pub error: Option<String>,
    pub platform_ref: Option<String>,
    pub platform_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub published_at: Option<String>,
}

impl PublishAttempt {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            part_id: parse_id(row, 1)?,
            platform: row.get(2)?,
            status: parse_enum(row, 3)?,
            retry_count: row.get(4)?,
            error: row.get(5)?,
            platform_ref: row.get(6)?,
            platform_url: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            published_at: row.get(10)?,
        })
    }
}

/// Fields written alongside an attempt status change.
#[derive(Debug, Clone, Default)]
pub struct AttemptUpdate<'a> {
    pub error: Option<&'a str>,
    pub platform_ref: Option<&'a str>,
    pub platform_url: Option<&'a str>,
    /// Increment `retry_count` as part of the same write.
    pub bump_retry: bool,
}

/// The latest publish attempt status of one part, as read by reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartOutcome {
    pub part_id: PartId,
    pub part_index: u32,
    /// `None` when the part has no attempt yet.
    pub status: Option<AttemptStatus>,
}

impl PartOutcome {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let status: Option<String> = row.get(2)?;
        let status = match status {
            Some(s) => Some(s.parse().map_err(|e| conversion_err(2, e))?),
            None => None,
        };
        Ok(Self {
            part_id: parse_id(row, 0)?,
            part_index: row.get(1)?,
            status,
        })
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: BatchId,
    pub source_item_id: SourceItemId,
    pub total_parts: u32,
    pub completed_parts: u32,
    /// Sorted 1-based indices of parts whose latest attempt failed.
    pub failed_indices: Vec<u32>,
    pub status: BatchStatus,
    /// Bumped on every reconcile write.
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl Batch {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let failed_json: String = row.get(4)?;
        let failed_indices = serde_json::from_str(&failed_json).map_err(|e| conversion_err(4, e))?;
        Ok(Self {
            id: parse_id(row, 0)?,
            source_item_id: parse_id(row, 1)?,
            total_parts: row.get(2)?,
            completed_parts: row.get(3)?,
            failed_indices,
            status: parse_enum(row, 5)?,
            version: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

// ---------------------------------------------------------------------------
// PipelineRun
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub source_item_id: SourceItemId,
    pub batch_id: Option<BatchId>,
    pub current_stage: Option<String>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

impl PipelineRun {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            source_item_id: parse_id(row, 1)?,
            batch_id: parse_opt_id(row, 2)?,
            current_stage: row.get(3)?,
            status: parse_enum(row, 4)?,
            error: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
        })
    }
}

// ---------------------------------------------------------------------------
// StageTask
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StageTask {
    pub id: TaskId,
    pub kind: TaskKind,
    pub source_item_id: SourceItemId,
    pub part_id: Option<PartId>,
    pub attempt_id: Option<PublishAttemptId>,
    pub status: TaskStatus,
    /// Failed executions of this task so far.
    pub attempts: u32,
    pub locked_by: Option<String>,
    pub locked_at: Option<String>,
    pub scheduled_for: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl StageTask {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            kind: parse_enum(row, 1)?,
            source_item_id: parse_id(row, 2)?,
            part_id: parse_opt_id(row, 3)?,
            attempt_id: parse_opt_id(row, 4)?,
            status: parse_enum(row, 5)?,
            attempts: row.get(6)?,
            locked_by: row.get(7)?,
            locked_at: row.get(8)?,
            scheduled_for: row.get(9)?,
            last_error: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }
}

/// Input for enqueuing a stage task.
#[derive(Debug, Clone, Copy)]
pub struct NewTask {
    pub kind: TaskKind,
    pub source_item_id: SourceItemId,
    pub part_id: Option<PartId>,
    pub attempt_id: Option<PublishAttemptId>,
}

impl NewTask {
    pub fn script(item: SourceItemId) -> Self {
        Self {
            kind: TaskKind::Script,
            source_item_id: item,
            part_id: None,
            attempt_id: None,
        }
    }

    pub fn for_part(kind: TaskKind, item: SourceItemId, part: PartId) -> Self {
        Self {
            kind,
            source_item_id: item,
            part_id: Some(part),
            attempt_id: None,
        }
    }

    pub fn publish(item: SourceItemId, part: PartId, attempt: PublishAttemptId) -> Self {
        Self {
            kind: TaskKind::Publish,
            source_item_id: item,
            part_id: Some(part),
            attempt_id: Some(attempt),
        }
    }
}
