//! Read-only views of the store for the CLI: the overall status summary
//! and the full record of one item.

use rusqlite::Connection;
use serde::Serialize;

use sf_core::{AttemptStatus, ItemStatus, Result, SourceItemId, TaskStatus};
use sf_db::models::{Batch, Part, PipelineRun, PublishAttempt, SourceItem, StageTask};
use sf_db::queries::{batches, parts, pipeline_runs, publish_attempts, source_items, tasks};

/// Counts per status plus everything waiting on an operator.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub items: Vec<(ItemStatus, i64)>,
    pub tasks: Vec<(TaskStatus, i64)>,
    pub pending_review: Vec<SourceItem>,
    pub needs_attention: Vec<SourceItem>,
    pub manual_required: Vec<PublishAttempt>,
}

impl StatusSummary {
    /// `review_limit` caps the pending-review list.
    pub fn load(conn: &Connection, review_limit: i64) -> Result<Self> {
        Ok(Self {
            items: source_items::count_by_status(conn)?,
            tasks: tasks::count_by_status(conn)?,
            pending_review: source_items::list_items(
                conn,
                Some(ItemStatus::Pending),
                0,
                review_limit,
            )?,
            needs_attention: source_items::list_needing_attention(conn)?,
            manual_required: publish_attempts::list_by_status(conn, AttemptStatus::ManualRequired)?,
        })
    }

    pub fn count(&self, status: ItemStatus) -> i64 {
        self.items
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

/// One item with everything hanging off it.
#[derive(Debug, Clone, Serialize)]
pub struct ItemDetail {
    pub item: SourceItem,
    pub parts: Vec<Part>,
    pub attempts: Vec<PublishAttempt>,
    pub batch: Option<Batch>,
    pub runs: Vec<PipelineRun>,
    pub tasks: Vec<StageTask>,
}

impl ItemDetail {
    pub fn load(conn: &Connection, item_id: SourceItemId) -> Result<Self> {
        Ok(Self {
            item: source_items::require_item(conn, item_id)?,
            parts: parts::list_for_item(conn, item_id)?,
            attempts: publish_attempts::list_for_item(conn, item_id)?,
            batch: batches::get_for_item(conn, item_id)?,
            runs: pipeline_runs::list_for_item(conn, item_id)?,
            tasks: tasks::list_for_item(conn, item_id)?,
        })
    }
}
