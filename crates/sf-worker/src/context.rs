//! Shared worker context.
//!
//! [`WorkerContext`] is the central struct handed to every worker loop and
//! service. It is cheaply cloneable because it only holds the pool and
//! `Arc`s.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::Transaction;
use sf_core::config::Config;
use sf_core::events::EventBus;
use sf_core::Result;
use sf_db::DbPool;
use sf_pipeline::{Collaborators, RetryPolicy, StageExecutor};

use crate::run_tracker::RunTracker;

/// Everything a worker needs to claim, execute and record stage tasks.
#[derive(Clone)]
pub struct WorkerContext {
    /// Database connection pool.
    pub db: DbPool,
    /// Immutable application configuration snapshot.
    pub config: Arc<Config>,
    /// Broadcast bus for post-commit pipeline events.
    pub event_bus: Arc<EventBus>,
    /// Collaborator dispatch with the supervisory timeout applied.
    pub executor: Arc<StageExecutor>,
    /// Best-effort audit trail.
    pub runs: RunTracker,
    /// Policy for transient script/audio/video failures.
    pub stage_retry: RetryPolicy,
    /// Policy for transient publish failures.
    pub publish_retry: RetryPolicy,
}

impl WorkerContext {
    pub fn new(
        db: DbPool,
        config: Arc<Config>,
        event_bus: Arc<EventBus>,
        collaborators: Collaborators,
    ) -> Self {
        let timeout = config.worker.stage_timeout_secs.map(Duration::from_secs);
        let executor = StageExecutor::new(collaborators).with_timeout(timeout);

        Self {
            runs: RunTracker::new(db.clone()),
            stage_retry: RetryPolicy::from_config(&config.retry),
            publish_retry: RetryPolicy::from_config(&config.publish.retry),
            executor: Arc::new(executor),
            db,
            config,
            event_bus,
        }
    }

    /// Run `f` inside one IMMEDIATE transaction on a pooled connection.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = sf_db::get_conn(&self.db)?;
        sf_db::with_immediate_tx(&mut conn, f)
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("stage_retry", &self.stage_retry)
            .field("publish_retry", &self.publish_retry)
            .finish_non_exhaustive()
    }
}
