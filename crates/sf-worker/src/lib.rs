//! # sf-worker
//!
//! Orchestration on top of the entity store and the collaborators.
//!
//! - **Transitions** ([`transitions`]) -- applying state machine events as
//!   compare-and-swap writes.
//! - **Batch coordinator** ([`coordinator`]) -- fan-out into parts, per-stage
//!   fan-in, batch reconciliation and item settlement.
//! - **Workers** ([`processor`]) -- the claim / call / record loop over the
//!   stage task queue, stage retries, publish retries, daily quota.
//! - **Review** ([`review`]) -- approve, reject, re-approve, republish.
//! - **Ingest** ([`ingest`]), **notifications** ([`notifications`]), the
//!   best-effort **run tracker** ([`run_tracker`]) and read-only
//!   **reports** ([`report`]).

pub mod context;
pub mod coordinator;
pub mod escalation;
pub mod ingest;
pub mod notifications;
pub mod processor;
pub mod report;
pub mod review;
pub mod run_tracker;
pub mod transitions;

#[cfg(test)]
mod testing;

pub use context::WorkerContext;
pub use coordinator::{reconcile, reconcile_batch, settle_item, Settlement};
pub use ingest::{ingest, IngestReport};
pub use notifications::{run_notifier, NotificationManager};
pub use processor::{drain, process_next_task, requeue_stale, run_worker, run_workers};
pub use report::{ItemDetail, StatusSummary};
pub use review::ReviewService;
pub use run_tracker::RunTracker;
pub use transitions::{apply_attempt_event, apply_item_event, Applied, AttemptApplied};
