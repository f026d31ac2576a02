//! Handling of publish attempts that reached manual intervention.
//!
//! The attention flag on the item and the artifact references are changed
//! inside the settling transaction (see [`retain_artifacts`] and
//! [`crate::coordinator::settle_item`]). What happens here after the
//! commit is file removal and the operator notification. Neither can undo
//! the transition, so failures are logged and dropped.

use std::path::{Path, PathBuf};

use rusqlite::Connection;

use sf_core::config::RetentionPolicy;
use sf_core::events::EventPayload;
use sf_core::{PartId, PublishAttemptId, Result, SourceItemId};
use sf_db::queries::parts;

use crate::context::WorkerContext;

/// A publish attempt that needs a human.
#[derive(Debug, Clone)]
pub struct Escalation {
    pub attempt_id: PublishAttemptId,
    pub item_id: SourceItemId,
    pub part_id: PartId,
    pub part_index: u32,
    pub reason: String,
    /// Files whose references were cleared by [`retain_artifacts`].
    pub purged: Vec<PathBuf>,
}

/// Apply the retention policy to an escalated part.
///
/// Call inside the transaction that moves the attempt to manual_required.
/// Under [`RetentionPolicy::Purge`] the part forgets its audio and video
/// paths and the returned files are deleted by [`escalate`] after commit.
pub fn retain_artifacts(
    conn: &Connection,
    policy: RetentionPolicy,
    part_id: PartId,
) -> Result<Vec<PathBuf>> {
    if policy != RetentionPolicy::Purge {
        return Ok(Vec::new());
    }
    let Some(part) = parts::get_part(conn, part_id)? else {
        return Ok(Vec::new());
    };
    parts::clear_artifacts(conn, part_id)?;
    Ok([part.audio_path, part.video_path]
        .into_iter()
        .flatten()
        .map(PathBuf::from)
        .collect())
}

/// Remove purged files and announce the escalation.
pub fn escalate(ctx: &WorkerContext, escalation: &Escalation) {
    tracing::warn!(
        attempt_id = %escalation.attempt_id,
        item_id = %escalation.item_id,
        part = escalation.part_index,
        reason = %escalation.reason,
        "Publish attempt requires manual intervention"
    );

    if !escalation.purged.is_empty() {
        for path in &escalation.purged {
            remove_artifact(path);
        }
        tracing::info!(part_id = %escalation.part_id, "Purged artifacts of escalated part");
    }

    ctx.event_bus.publish(EventPayload::ManualRequired {
        attempt_id: escalation.attempt_id,
        item_id: escalation.item_id,
        part_index: escalation.part_index,
        reason: escalation.reason.clone(),
    });
}

fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove artifact"),
    }
}
