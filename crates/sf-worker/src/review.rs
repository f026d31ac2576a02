//! Operator actions: approve, reject, re-approve a failed item, republish a
//! part that needs manual intervention.
//!
//! These never call a collaborator. Each one is a single transaction that
//! applies a state machine event and enqueues whatever work it unlocks.

use std::sync::Arc;

use sf_core::config::Config;
use sf_core::events::{EventBus, EventPayload};
use sf_core::{
    AttemptStatus, Error, Event, ItemStatus, PublishAttemptId, Result, SourceItemId, Stage,
};
use sf_db::models::{NewTask, PublishAttempt, SourceItem};
use sf_db::queries::{batches, parts, publish_attempts, source_items, tasks};
use sf_db::DbPool;

use crate::context::WorkerContext;
use crate::coordinator::{self, Settlement};
use crate::run_tracker::RunTracker;
use crate::transitions::{apply_item_event, Applied};

/// Human review and recovery actions.
#[derive(Clone)]
pub struct ReviewService {
    db: DbPool,
    config: Arc<Config>,
    event_bus: Arc<EventBus>,
    runs: RunTracker,
}

impl ReviewService {
    pub fn new(db: DbPool, config: Arc<Config>, event_bus: Arc<EventBus>) -> Self {
        Self {
            runs: RunTracker::new(db.clone()),
            db,
            config,
            event_bus,
        }
    }

    pub fn from_context(ctx: &WorkerContext) -> Self {
        Self {
            db: ctx.db.clone(),
            config: ctx.config.clone(),
            event_bus: ctx.event_bus.clone(),
            runs: ctx.runs.clone(),
        }
    }

    fn transaction<T>(&self, f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = sf_db::get_conn(&self.db)?;
        sf_db::with_immediate_tx(&mut conn, f)
    }

    fn announce(&self, item_id: SourceItemId, applied: &Applied<ItemStatus>) {
        self.event_bus.publish(EventPayload::ItemStatusChanged {
            item_id,
            from: applied.from,
            to: applied.to,
        });
    }

    /// Approve a pending item and queue its script stage.
    pub fn approve(&self, item_id: SourceItemId) -> Result<SourceItem> {
        let (applied, item) = self.transaction(|tx| {
            let applied = apply_item_event(tx, item_id, &Event::Approved)?;
            tasks::enqueue(tx, &NewTask::script(item_id), None)?;
            Ok((applied, source_items::require_item(tx, item_id)?))
        })?;

        tracing::info!(item_id = %item_id, title = %item.title, "Item approved");
        self.announce(item_id, &applied);
        Ok(item)
    }

    /// Reject a pending item. Rejection is final.
    pub fn reject(&self, item_id: SourceItemId, reason: Option<String>) -> Result<SourceItem> {
        let (applied, item) = self.transaction(|tx| {
            let applied = apply_item_event(tx, item_id, &Event::Rejected { reason })?;
            Ok((applied, source_items::require_item(tx, item_id)?))
        })?;

        tracing::info!(
            item_id = %item_id,
            reason = item.rejection_reason.as_deref().unwrap_or("-"),
            "Item rejected"
        );
        self.announce(item_id, &applied);
        Ok(item)
    }

    /// Restart a failed item from the script stage.
    ///
    /// Its parts, attempts, batch and outstanding tasks are discarded first.
    /// Disabled when `review.allow_reapprove_failed` is off.
    pub fn retry_failed(&self, item_id: SourceItemId) -> Result<SourceItem> {
        if !self.config.review.allow_reapprove_failed {
            return Err(Error::Forbidden(
                "re-approving failed items is disabled (review.allow_reapprove_failed)".into(),
            ));
        }

        let (applied, item, removed) = self.transaction(|tx| {
            let applied = apply_item_event(tx, item_id, &Event::Reapproved)?;
            tasks::cancel_for_item(tx, item_id)?;
            batches::delete_for_item(tx, item_id)?;
            let removed = parts::delete_for_item(tx, item_id)?;
            source_items::set_needs_attention(tx, item_id, false)?;
            tasks::enqueue(tx, &NewTask::script(item_id), None)?;
            Ok((applied, source_items::require_item(tx, item_id)?, removed))
        })?;

        tracing::info!(item_id = %item_id, removed_parts = removed, "Failed item re-approved");
        self.announce(item_id, &applied);
        Ok(item)
    }

    /// Publish a part again after its latest attempt needed manual
    /// intervention.
    ///
    /// Creates a fresh attempt. The old one stays `manual_required` as
    /// history. An item that had failed in the upload stage is reopened.
    pub fn republish(&self, attempt_id: PublishAttemptId) -> Result<PublishAttempt> {
        let (attempt, item_id, reopened, settlement) = self.transaction(|tx| {
            let old = publish_attempts::require_attempt(tx, attempt_id)?;
            if old.status != AttemptStatus::ManualRequired {
                return Err(Error::Conflict(format!(
                    "attempt {attempt_id} is {}; only manual_required attempts can be republished",
                    old.status
                )));
            }
            let history = publish_attempts::list_for_part(tx, old.part_id)?;
            if history.last().map(|a| a.id) != Some(attempt_id) {
                return Err(Error::Conflict(format!(
                    "attempt {attempt_id} has already been superseded"
                )));
            }

            let part = parts::require_part(tx, old.part_id)?;
            if part.video_path.is_none() {
                return Err(Error::Validation(format!(
                    "part {} has no rendered video to publish",
                    part.id
                )));
            }

            let item = source_items::require_item(tx, part.source_item_id)?;
            let reopened = match item.status {
                ItemStatus::Uploading => None,
                ItemStatus::Failed => {
                    if parts::count_missing_video(tx, item.id)? > 0 {
                        return Err(Error::Validation(format!(
                            "item {} did not fail while uploading",
                            item.id
                        )));
                    }
                    Some(apply_item_event(tx, item.id, &Event::UploadReopened)?)
                }
                other => {
                    return Err(Error::Conflict(format!(
                        "item {} is {other}; nothing to republish",
                        item.id
                    )))
                }
            };

            let attempt = publish_attempts::create_attempt(tx, part.id, &old.platform)?;
            tasks::enqueue(tx, &NewTask::publish(item.id, part.id, attempt.id), None)?;
            let settlement = coordinator::settle_item(tx, item.id)?;
            Ok((attempt, item.id, reopened, settlement))
        })?;

        tracing::info!(
            attempt_id = %attempt.id,
            replaces = %attempt_id,
            item_id = %item_id,
            "Part queued for republishing"
        );
        if let Some(applied) = reopened {
            self.announce(item_id, &applied);
            self.runs.record_item_stage(item_id, Stage::Upload.as_str());
        }
        self.announce_settlement(&settlement);
        Ok(attempt)
    }

    fn announce_settlement(&self, settlement: &Settlement) {
        if let Some(batch) = &settlement.batch {
            self.event_bus.publish(EventPayload::BatchReconciled {
                batch_id: batch.id,
                status: batch.status,
                completed: batch.completed_parts,
                total: batch.total_parts,
            });
        }
    }
}

impl std::fmt::Debug for ReviewService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewService").finish_non_exhaustive()
    }
}
