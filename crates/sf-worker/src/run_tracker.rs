//! Best-effort audit trail of pipeline runs.
//!
//! Every write goes through its own pooled connection, after the state
//! change it describes has committed. Failures are logged at `warn` and
//! swallowed: a broken audit trail must never block or undo a transition.

use sf_core::{BatchId, Result, RunId, SourceItemId};
use sf_db::queries::pipeline_runs;
use sf_db::DbPool;

#[derive(Clone)]
pub struct RunTracker {
    db: DbPool,
}

impl RunTracker {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    fn write<T>(
        &self,
        what: &str,
        f: impl FnOnce(&rusqlite::Connection) -> Result<T>,
    ) -> Option<T> {
        let result = sf_db::get_conn(&self.db).and_then(|conn| f(&conn));
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(error = %e, "Run tracker failed to {what}");
                None
            }
        }
    }

    /// Open a new run for an item.
    pub fn start_run(&self, item_id: SourceItemId) -> Option<RunId> {
        self.write("start run", |conn| pipeline_runs::start_run(conn, item_id))
            .map(|run| run.id)
    }

    /// Record the stage a run has reached.
    pub fn record_stage(&self, run_id: RunId, stage: &str) {
        self.write("record stage", |conn| pipeline_runs::record_stage(conn, run_id, stage));
    }

    /// Close a run, failed if `error` is given.
    pub fn complete_run(&self, run_id: RunId, error: Option<&str>) {
        self.write("complete run", |conn| pipeline_runs::complete_run(conn, run_id, error));
    }

    /// The item's open run, starting one if none exists.
    pub fn ensure_run(&self, item_id: SourceItemId) -> Option<RunId> {
        let open = self.write("look up run", |conn| {
            pipeline_runs::open_run_for_item(conn, item_id)
        })?;
        match open {
            Some(run) => Some(run.id),
            None => self.start_run(item_id),
        }
    }

    /// Record a stage on the item's open run.
    pub fn record_item_stage(&self, item_id: SourceItemId, stage: &str) {
        if let Some(run_id) = self.ensure_run(item_id) {
            self.record_stage(run_id, stage);
        }
    }

    /// Attach a batch to the item's open run.
    pub fn attach_batch(&self, item_id: SourceItemId, batch_id: BatchId) {
        if let Some(run_id) = self.ensure_run(item_id) {
            self.write("attach batch", |conn| pipeline_runs::set_batch(conn, run_id, batch_id));
        }
    }

    /// Close the item's open run, if any.
    pub fn complete_item_run(&self, item_id: SourceItemId, error: Option<&str>) {
        let open = self.write("look up run", |conn| {
            pipeline_runs::open_run_for_item(conn, item_id)
        });
        if let Some(Some(run)) = open {
            self.complete_run(run.id, error);
        }
    }
}
