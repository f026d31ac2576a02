//! Batch coordinator: fan-out of a split item into parts, per-stage fan-in,
//! and reconciliation of the aggregate batch row.
//!
//! Every function here takes a connection that the caller has already put
//! inside an IMMEDIATE transaction. The next stage's tasks are enqueued in
//! the same transaction that records the previous stage's success, so a
//! stage is never dispatched speculatively.

use rusqlite::Connection;

use sf_core::{
    AttemptStatus, BatchId, Error, Event, ItemStatus, PartId, PublishAttemptId, Result,
    SourceItemId, Stage, TaskKind,
};
use sf_db::models::{Batch, NewTask, Part, PartOutcome};
use sf_db::queries::{batches, parts, publish_attempts, source_items, tasks};
use sf_pipeline::{derive_batch, item_outcome, AudioArtifact, ItemOutcome, PartState, VideoArtifact};

use crate::transitions::{apply_item_event, Applied};

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// Result of splitting an item into parts.
#[derive(Debug, Clone)]
pub struct FanOut {
    pub applied: Applied<ItemStatus>,
    pub parts: Vec<Part>,
    /// Present only when the item split into more than one part.
    pub batch: Option<Batch>,
}

/// Record a successful script stage: create the parts, the batch (for
/// N > 1) and one narrate task per part.
///
/// The item transition is applied first, so a duplicate delivery fails
/// with an illegal transition before any part is written.
pub fn fan_out(conn: &Connection, item_id: SourceItemId, scripts: &[String]) -> Result<FanOut> {
    let applied = apply_item_event(conn, item_id, &Event::StageSucceeded { stage: Stage::Script })?;

    let parts = parts::create_parts(conn, item_id, scripts)?;
    let total = parts.len() as u32;
    let batch = if total > 1 {
        Some(batches::create_batch(conn, item_id, total)?)
    } else {
        None
    };

    for part in &parts {
        tasks::enqueue(conn, &NewTask::for_part(TaskKind::Narrate, item_id, part.id), None)?;
    }

    tracing::info!(item_id = %item_id, parts = total, "Item split into parts");
    Ok(FanOut {
        applied,
        parts,
        batch,
    })
}

// ---------------------------------------------------------------------------
// Per-part fan-in
// ---------------------------------------------------------------------------

/// Result of recording one part's artifact.
#[derive(Debug, Clone, Default)]
pub struct FanIn {
    /// Parts of the item still waiting for this stage.
    pub remaining: i64,
    /// The item transition, once the last part arrived.
    pub applied: Option<Applied<ItemStatus>>,
    /// Attempts created when the item entered the upload stage.
    pub attempts: Vec<PublishAttemptId>,
}

/// Load a part and check that its item is working on `stage`.
fn part_in_stage(conn: &Connection, part_id: PartId, stage: Stage) -> Result<Part> {
    let part = parts::require_part(conn, part_id)?;
    let item = source_items::require_item(conn, part.source_item_id)?;
    if item.status != stage.working_status() {
        return Err(Error::illegal(
            "source_item",
            item.status,
            format!("part_ready({stage})"),
        ));
    }
    Ok(part)
}

/// Record a part's narration. Once every part has audio, the item moves to
/// `rendering_video` and one render task per part is enqueued.
pub fn on_audio_ready(conn: &Connection, part_id: PartId, audio: &AudioArtifact) -> Result<FanIn> {
    let part = part_in_stage(conn, part_id, Stage::Audio)?;
    if !parts::set_audio(conn, part_id, &audio.path, audio.duration_secs)? {
        return Err(Error::illegal("part", "audio_ready", "part_ready(audio)"));
    }

    let item_id = part.source_item_id;
    let remaining = parts::count_missing_audio(conn, item_id)?;
    if remaining > 0 {
        return Ok(FanIn {
            remaining,
            ..Default::default()
        });
    }

    let applied = apply_item_event(conn, item_id, &Event::StageSucceeded { stage: Stage::Audio })?;
    for p in parts::list_for_item(conn, item_id)? {
        tasks::enqueue(conn, &NewTask::for_part(TaskKind::Render, item_id, p.id), None)?;
    }
    Ok(FanIn {
        remaining,
        applied: Some(applied),
        attempts: Vec::new(),
    })
}

/// Record a part's rendered video. Once every part has video, the item
/// moves to `uploading` and each part gets a pending publish attempt and a
/// publish task.
pub fn on_video_ready(
    conn: &Connection,
    part_id: PartId,
    video: &VideoArtifact,
    platform: &str,
) -> Result<FanIn> {
    let part = part_in_stage(conn, part_id, Stage::Video)?;
    if !parts::set_video(conn, part_id, &video.path)? {
        return Err(Error::illegal("part", "video_ready", "part_ready(video)"));
    }

    let item_id = part.source_item_id;
    let remaining = parts::count_missing_video(conn, item_id)?;
    if remaining > 0 {
        return Ok(FanIn {
            remaining,
            ..Default::default()
        });
    }

    let applied = apply_item_event(conn, item_id, &Event::StageSucceeded { stage: Stage::Video })?;
    let attempts = open_attempts(conn, item_id, platform)?;
    Ok(FanIn {
        remaining,
        applied: Some(applied),
        attempts,
    })
}

/// Create a pending attempt and a publish task for every part of an item.
fn open_attempts(
    conn: &Connection,
    item_id: SourceItemId,
    platform: &str,
) -> Result<Vec<PublishAttemptId>> {
    let mut ids = Vec::new();
    for p in parts::list_for_item(conn, item_id)? {
        let attempt = publish_attempts::create_attempt(conn, p.id, platform)?;
        tasks::enqueue(conn, &NewTask::publish(item_id, p.id, attempt.id), None)?;
        ids.push(attempt.id);
    }
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Reconcile
// ---------------------------------------------------------------------------

fn part_states(outcomes: &[PartOutcome]) -> Vec<PartState> {
    outcomes
        .iter()
        .map(|o| PartState {
            index: o.part_index,
            latest: o.status,
        })
        .collect()
}

/// Recompute a batch from the latest attempt of each of its parts and store
/// the result.
///
/// Nothing is carried over from the stored row except its identity, so
/// running this twice without intervening writes stores the same aggregate.
pub fn reconcile(conn: &Connection, batch_id: BatchId) -> Result<Batch> {
    let batch = batches::get_batch(conn, batch_id)?
        .ok_or_else(|| Error::not_found("batch", batch_id))?;
    let outcomes = publish_attempts::latest_per_part(conn, batch.source_item_id)?;
    let summary = derive_batch(batch.total_parts, &part_states(&outcomes));

    let stored = batches::write_aggregate(
        conn,
        batch_id,
        summary.status,
        summary.completed,
        &summary.failed_indices,
    )?;
    tracing::debug!(
        batch_id = %batch_id,
        status = %stored.status,
        completed = stored.completed_parts,
        total = stored.total_parts,
        version = stored.version,
        "Batch reconciled"
    );
    Ok(stored)
}

/// [`reconcile`] in its own IMMEDIATE transaction.
pub fn reconcile_batch(pool: &sf_db::DbPool, batch_id: BatchId) -> Result<Batch> {
    let mut conn = sf_db::get_conn(pool)?;
    sf_db::with_immediate_tx(&mut conn, |tx| reconcile(tx, batch_id))
}

// ---------------------------------------------------------------------------
// Item settlement
// ---------------------------------------------------------------------------

/// What settling an item's publish outcomes changed.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub outcome: ItemOutcome,
    pub batch: Option<Batch>,
    pub applied: Option<Applied<ItemStatus>>,
    pub needs_attention: bool,
}

/// Fold the latest attempt of every part into the item and its batch.
///
/// Reconciles the batch (if any), raises or clears the attention flag, and
/// completes or fails an `uploading` item once every part has settled.
pub fn settle_item(conn: &Connection, item_id: SourceItemId) -> Result<Settlement> {
    let batch = match batches::get_for_item(conn, item_id)? {
        Some(b) => Some(reconcile(conn, b.id)?),
        None => None,
    };

    let outcomes = publish_attempts::latest_per_part(conn, item_id)?;
    let states = part_states(&outcomes);
    let outcome = item_outcome(outcomes.len() as u32, &states);

    let item = source_items::require_item(conn, item_id)?;
    let needs_attention = states
        .iter()
        .any(|s| s.latest == Some(AttemptStatus::ManualRequired));
    if needs_attention != item.needs_attention {
        source_items::set_needs_attention(conn, item_id, needs_attention)?;
    }

    let event = match (item.status, outcome) {
        (ItemStatus::Uploading, ItemOutcome::Completed) => {
            Some(Event::StageSucceeded { stage: Stage::Upload })
        }
        (ItemStatus::Uploading, ItemOutcome::Failed) => Some(Event::StageFailed {
            stage: Stage::Upload,
            error: "every part requires manual publishing".into(),
        }),
        _ => None,
    };
    let applied = match event {
        Some(e) => Some(apply_item_event(conn, item_id, &e)?),
        None => None,
    };

    Ok(Settlement {
        outcome,
        batch,
        applied,
        needs_attention,
    })
}
