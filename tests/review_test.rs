//! Operator review actions and ingestion against a running pipeline.

mod common;

use assert_matches::assert_matches;
use common::{fast_config, fetched, FakeCollaborators, TestHarness};

use sf_core::{AttemptStatus, BatchStatus, Error, ItemStatus, Stage};
use sf_db::queries::{batches, parts, publish_attempts, source_items};
use sf_pipeline::StageError;
use sf_worker::{ingest, IngestReport, StatusSummary};

#[tokio::test]
async fn rejected_item_never_runs() {
    let h = TestHarness::new(FakeCollaborators::splitting_into(1));
    let item_id = h.insert_item("r1");

    let item = h.review().reject(item_id, Some("too short".into())).unwrap();
    assert_eq!(item.status, ItemStatus::Rejected);
    assert_eq!(item.rejection_reason.as_deref(), Some("too short"));

    assert_eq!(h.drain().await, 0);
    let err = h.review().approve(item_id).unwrap_err();
    assert!(err.is_illegal_transition());
}

#[tokio::test]
async fn republish_completes_partial_batch() {
    let fakes = FakeCollaborators::splitting_into(2).fail_publish(2, StageError::auth_required("relogin"), 1);
    let h = TestHarness::new(fakes);
    let item_id = h.approved_item("r2");
    h.drain().await;

    let conn = h.conn();
    let stuck = publish_attempts::list_by_status(&conn, AttemptStatus::ManualRequired).unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(
        batches::get_for_item(&conn, item_id).unwrap().unwrap().status,
        BatchStatus::Partial
    );

    let fresh = h.review().republish(stuck[0].id).unwrap();
    assert_eq!(fresh.status, AttemptStatus::Pending);
    assert_eq!(fresh.part_id, stuck[0].part_id);

    h.drain().await;

    let batch = batches::get_for_item(&conn, item_id).unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.completed_parts, 2);

    let item = h.item(item_id);
    assert_eq!(item.status, ItemStatus::Completed);
    assert!(!item.needs_attention);

    // The old attempt is history now; it cannot be republished twice.
    let err = h.review().republish(stuck[0].id).unwrap_err();
    assert_matches!(err, Error::Conflict(_));
}

#[tokio::test]
async fn republish_reopens_failed_single_part_item() {
    let fakes = FakeCollaborators::splitting_into(1).fail_publish(1, StageError::terminal("rejected by platform"), 1);
    let h = TestHarness::new(fakes);
    let item_id = h.approved_item("r3");
    h.drain().await;
    assert_eq!(h.item(item_id).status, ItemStatus::Failed);

    let conn = h.conn();
    let stuck = publish_attempts::list_for_item(&conn, item_id).unwrap();
    h.review().republish(stuck[0].id).unwrap();
    assert_eq!(h.item(item_id).status, ItemStatus::Uploading);

    h.drain().await;
    assert_eq!(h.item(item_id).status, ItemStatus::Completed);
    assert_eq!(publish_attempts::list_for_item(&conn, item_id).unwrap().len(), 2);
}

#[tokio::test]
async fn retry_failed_restarts_from_script() {
    let fakes = FakeCollaborators::splitting_into(2).fail(Stage::Video, StageError::terminal("font missing"));
    let h = TestHarness::new(fakes);
    let item_id = h.approved_item("r4");
    h.drain().await;
    assert_eq!(h.item(item_id).status, ItemStatus::Failed);

    let item = h.review().retry_failed(item_id).unwrap();
    assert_eq!(item.status, ItemStatus::Approved);
    assert!(parts::list_for_item(&h.conn(), item_id).unwrap().is_empty());

    h.drain().await;
    let item = h.item(item_id);
    assert_eq!(item.status, ItemStatus::Completed);
    assert_eq!(parts::list_for_item(&h.conn(), item_id).unwrap().len(), 2);
}

#[tokio::test]
async fn retry_failed_respects_policy() {
    let mut config = fast_config();
    config.review.allow_reapprove_failed = false;
    let fakes = FakeCollaborators::splitting_into(1).fail(Stage::Script, StageError::terminal("empty story"));
    let h = TestHarness::with_config(config, fakes);
    let item_id = h.approved_item("r5");
    h.drain().await;
    assert_eq!(h.item(item_id).status, ItemStatus::Failed);

    let err = h.review().retry_failed(item_id).unwrap_err();
    assert_matches!(err, Error::Forbidden(_));
    assert_eq!(h.item(item_id).status, ItemStatus::Failed);
}

#[tokio::test]
async fn ingest_filters_and_deduplicates() {
    let mut config = fast_config();
    config.fetch.min_chars = 10;
    config.fetch.max_chars = 100;
    let fakes = FakeCollaborators::splitting_into(1).with_fetched(vec![
        fetched("ok-1", 50),
        fetched("ok-2", 80),
        fetched("tiny", 3),
        fetched("huge", 500),
    ]);
    let h = TestHarness::with_config(config, fakes);

    let report = ingest(&h.db, &h.ctx.event_bus, h.fakes.as_ref(), &h.ctx.config.fetch)
        .await
        .unwrap();
    assert_eq!(
        report,
        IngestReport {
            fetched: 4,
            inserted: 2,
            duplicates: 0,
            filtered: 2,
        }
    );

    let again = ingest(&h.db, &h.ctx.event_bus, h.fakes.as_ref(), &h.ctx.config.fetch)
        .await
        .unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(again.duplicates, 2);

    let pending = source_items::list_items(&h.conn(), Some(ItemStatus::Pending), 0, 10).unwrap();
    assert_eq!(pending.len(), 2);
}

#[tokio::test]
async fn status_summary_lists_operator_work() {
    let fakes = FakeCollaborators::splitting_into(1).fail_publish(1, StageError::auth_required("relogin"), 1);
    let h = TestHarness::new(fakes);
    h.insert_item("waiting");
    let stuck = h.approved_item("stuck");
    h.drain().await;

    let summary = StatusSummary::load(&h.conn(), 10).unwrap();
    assert_eq!(summary.pending_review.len(), 1);
    assert_eq!(summary.needs_attention.len(), 1);
    assert_eq!(summary.needs_attention[0].id, stuck);
    assert_eq!(summary.manual_required.len(), 1);
    assert_eq!(summary.count(ItemStatus::Failed), 1);
}
