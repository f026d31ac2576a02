//! Stage task workers.
//!
//! Each worker loop claims the oldest due task from the `stage_tasks` queue,
//! runs it in three phases and goes back for the next one:
//!
//! 1. **Claim** (one transaction): check that the entity is in the status
//!    the task expects and record that the stage has started.
//! 2. **Call**: run the collaborator through the [`StageExecutor`] with no
//!    connection held.
//! 3. **Record** (one transaction): apply the outcome, enqueue whatever it
//!    unlocks, and settle the task.
//!
//! Bus events, run-tracker writes and escalation side effects happen after
//! the record transaction commits.
//!
//! [`StageExecutor`]: sf_pipeline::StageExecutor

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use sf_core::events::EventPayload;
use sf_core::{
    AttemptStatus, Error, Event, ItemStatus, PublishAttemptId, Result, SourceItemId, Stage,
    TaskKind,
};
use sf_db::models::StageTask;
use sf_db::queries::{parts, publish_attempts, quota, source_items, tasks};
use sf_pipeline::{
    Decision, EnrichRequest, NarrateRequest, PublishRequest, RenderRequest, StageError,
    StageOutput, StageReport, StageRequest,
};

use crate::context::WorkerContext;
use crate::coordinator::{self, Settlement};
use crate::escalation::{self, Escalation};
use crate::transitions::{apply_attempt_event, apply_item_event, Applied};

/// How a handler left its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// The task is finished; mark it done.
    Done,
    /// The handler already rescheduled, deferred, killed or completed the
    /// task inside its own transaction.
    Settled,
    /// The worker was cancelled mid-call; hand the task back.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Worker loops
// ---------------------------------------------------------------------------

/// Run one worker loop until `cancel` fires.
pub async fn run_worker(ctx: WorkerContext, worker_id: String, cancel: CancellationToken) {
    tracing::info!(worker = %worker_id, "Worker started");
    let poll = Duration::from_millis(ctx.config.worker.poll_interval_ms);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match process_next_task(&ctx, &worker_id, &cancel).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => tracing::error!(worker = %worker_id, error = %e, "Worker error"),
        }

        // Jitter keeps idle workers from polling in lockstep.
        let jitter_ms = rand::thread_rng().gen_range(0..=poll.as_millis() as u64 / 4);
        tokio::select! {
            _ = tokio::time::sleep(poll + Duration::from_millis(jitter_ms)) => {}
            _ = cancel.cancelled() => break,
        }
    }

    tracing::info!(worker = %worker_id, "Worker stopped");
}

/// Spawn `worker.concurrency` loops plus the stale-task sweeper and wait for
/// all of them to stop.
pub async fn run_workers(ctx: WorkerContext, cancel: CancellationToken) {
    let mut handles = Vec::new();

    let sweeper_ctx = ctx.clone();
    let sweeper_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        run_sweeper(sweeper_ctx, sweeper_cancel).await;
    }));

    for n in 0..ctx.config.worker.concurrency {
        let worker_ctx = ctx.clone();
        let worker_cancel = cancel.clone();
        let worker_id = format!("{}-{}-{n}", ctx.config.worker.worker_id, std::process::id());
        handles.push(tokio::spawn(async move {
            run_worker(worker_ctx, worker_id, worker_cancel).await;
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }
}

/// Periodically return abandoned `running` tasks to the queue.
async fn run_sweeper(ctx: WorkerContext, cancel: CancellationToken) {
    let stale = Duration::from_secs(ctx.config.worker.stale_task_secs);
    let every = (stale / 4).max(Duration::from_secs(1));

    loop {
        if let Err(e) = requeue_stale(&ctx) {
            tracing::warn!(error = %e, "Stale task sweep failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(every) => {}
            _ = cancel.cancelled() => break,
        }
    }
}

/// Requeue tasks locked for longer than `worker.stale_task_secs`.
pub fn requeue_stale(ctx: &WorkerContext) -> Result<usize> {
    let cutoff = Utc::now() - chrono_delay(Duration::from_secs(ctx.config.worker.stale_task_secs));
    let conn = sf_db::get_conn(&ctx.db)?;
    let n = tasks::requeue_stale(&conn, cutoff)?;
    if n > 0 {
        tracing::warn!(count = n, "Requeued stale tasks");
    }
    Ok(n)
}

/// Process due tasks until none is left or the worker has to back off.
/// Returns how many were handled.
pub async fn drain(
    ctx: &WorkerContext,
    worker_id: &str,
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut handled = 0;
    while !cancel.is_cancelled() && process_next_task(ctx, worker_id, cancel).await? {
        handled += 1;
    }
    Ok(handled)
}

/// Claim and handle the next due task.
///
/// Returns `Ok(true)` when the worker may go straight on to the next task,
/// and `Ok(false)` when it should back off: the queue has nothing due, or
/// the task was handed back because the store was unavailable or the
/// worker was cancelled. Errors from a single task are classified here and
/// never stop the worker; only a failure to claim is returned.
pub async fn process_next_task(
    ctx: &WorkerContext,
    worker_id: &str,
    cancel: &CancellationToken,
) -> Result<bool> {
    let task = {
        let conn = sf_db::get_conn(&ctx.db)?;
        tasks::dequeue_next(&conn, worker_id)?
    };
    let Some(task) = task else {
        return Ok(false);
    };

    tracing::debug!(
        task_id = %task.id,
        kind = %task.kind,
        item_id = %task.source_item_id,
        attempts = task.attempts,
        "Claimed task"
    );

    let result = match task.kind {
        TaskKind::Script => handle_script(ctx, &task, cancel).await,
        TaskKind::Narrate => handle_narrate(ctx, &task, cancel).await,
        TaskKind::Render => handle_render(ctx, &task, cancel).await,
        TaskKind::Publish => handle_publish(ctx, &task, cancel).await,
    };

    Ok(settle_task(ctx, &task, result))
}

/// Finish the queue bookkeeping for a handled task. Returns false when the
/// task went back to the queue without being handled.
fn settle_task(ctx: &WorkerContext, task: &StageTask, result: Result<Disposition>) -> bool {
    let handled = !matches!(&result, Ok(Disposition::Cancelled))
        && !matches!(&result, Err(e) if e.is_store_unavailable());

    let write = sf_db::get_conn(&ctx.db).and_then(|conn| match &result {
        Ok(Disposition::Done) => tasks::complete_task(&conn, task.id).map(|_| ()),
        Ok(Disposition::Settled) => Ok(()),
        Ok(Disposition::Cancelled) => tasks::release(&conn, task.id).map(|_| ()),
        Err(e) if e.is_illegal_transition() => {
            tracing::warn!(
                task_id = %task.id,
                kind = %task.kind,
                error = %e,
                "Dropping duplicate or out-of-order task"
            );
            tasks::complete_task(&conn, task.id).map(|_| ())
        }
        Err(e) if e.is_store_unavailable() => {
            tracing::warn!(task_id = %task.id, error = %e, "Store unavailable; releasing task");
            tasks::release(&conn, task.id).map(|_| ())
        }
        Err(e) => {
            tracing::error!(task_id = %task.id, kind = %task.kind, error = %e, "Task failed");
            tasks::kill(&conn, task.id, &e.to_string()).map(|_| ())
        }
    });

    // A task we could not settle stays `running` until the sweeper
    // returns it to the queue.
    if let Err(e) = write {
        tracing::warn!(task_id = %task.id, error = %e, "Failed to settle task");
    }
    handled
}

// ---------------------------------------------------------------------------
// Script
// ---------------------------------------------------------------------------

async fn handle_script(
    ctx: &WorkerContext,
    task: &StageTask,
    cancel: &CancellationToken,
) -> Result<Disposition> {
    let item_id = task.source_item_id;

    let (item, started) = ctx.transaction(|tx| {
        let item = source_items::require_item(tx, item_id)?;
        match item.status {
            ItemStatus::Approved => {
                let applied =
                    apply_item_event(tx, item_id, &Event::StageStarted { stage: Stage::Script })?;
                Ok((item, Some(applied)))
            }
            // Redelivered after a crash or cancellation mid-call.
            ItemStatus::Scripting => Ok((item, None)),
            other => Err(Error::illegal("source_item", other, "stage_started(script)")),
        }
    })?;

    if let Some(applied) = started {
        announce_item(ctx, item_id, &applied);
        if let Some(run_id) = ctx.runs.start_run(item_id) {
            ctx.runs.record_stage(run_id, Stage::Script.as_str());
        }
    }

    let request = StageRequest::Script(EnrichRequest {
        item_id,
        title: item.title,
        body: item.body,
    });
    let Some(report) = ctx.executor.run(request, cancel).await else {
        return Ok(Disposition::Cancelled);
    };

    match report.outcome {
        Ok(StageOutput::Parts(payloads)) => {
            let scripts: Vec<String> = payloads.into_iter().map(|p| p.script).collect();
            let fan_out = ctx.transaction(|tx| coordinator::fan_out(tx, item_id, &scripts))?;

            announce_item(ctx, item_id, &fan_out.applied);
            ctx.event_bus.publish(EventPayload::PartsCreated {
                item_id,
                total: fan_out.parts.len() as u32,
            });
            if let Some(batch) = &fan_out.batch {
                ctx.runs.attach_batch(item_id, batch.id);
            }
            ctx.runs.record_item_stage(item_id, Stage::Audio.as_str());
            Ok(Disposition::Done)
        }
        Err(e) => handle_stage_failure(ctx, task, Stage::Script, e),
        Ok(other) => Err(unexpected(Stage::Script, &other)),
    }
}

// ---------------------------------------------------------------------------
// Narrate / render
// ---------------------------------------------------------------------------

async fn handle_narrate(
    ctx: &WorkerContext,
    task: &StageTask,
    cancel: &CancellationToken,
) -> Result<Disposition> {
    let part_id = task
        .part_id
        .ok_or_else(|| Error::Validation(format!("narrate task {} has no part", task.id)))?;

    let request = ctx.transaction(|tx| {
        let part = parts::require_part(tx, part_id)?;
        expect_item_status(tx, part.source_item_id, Stage::Audio)?;
        if part.audio_path.is_some() {
            return Err(Error::illegal("part", "audio_ready", "narrate"));
        }
        Ok(NarrateRequest {
            part_id,
            part_index: part.part_index,
            total_parts: part.total_parts,
            script: part.script,
        })
    })?;

    let Some(report) = ctx.executor.run(StageRequest::Narrate(request), cancel).await else {
        return Ok(Disposition::Cancelled);
    };

    match report.outcome {
        Ok(StageOutput::Audio(audio)) => {
            let fan_in = ctx.transaction(|tx| coordinator::on_audio_ready(tx, part_id, &audio))?;
            if let Some(applied) = fan_in.applied {
                announce_item(ctx, task.source_item_id, &applied);
                ctx.runs.record_item_stage(task.source_item_id, Stage::Video.as_str());
            } else {
                tracing::debug!(part_id = %part_id, remaining = fan_in.remaining, "Audio ready");
            }
            Ok(Disposition::Done)
        }
        Err(e) => handle_stage_failure(ctx, task, Stage::Audio, e),
        Ok(other) => Err(unexpected(Stage::Audio, &other)),
    }
}

async fn handle_render(
    ctx: &WorkerContext,
    task: &StageTask,
    cancel: &CancellationToken,
) -> Result<Disposition> {
    let part_id = task
        .part_id
        .ok_or_else(|| Error::Validation(format!("render task {} has no part", task.id)))?;

    let request = ctx.transaction(|tx| {
        let part = parts::require_part(tx, part_id)?;
        expect_item_status(tx, part.source_item_id, Stage::Video)?;
        if part.video_path.is_some() {
            return Err(Error::illegal("part", "video_ready", "render"));
        }
        let audio_path = part
            .audio_path
            .ok_or_else(|| Error::Validation(format!("part {part_id} has no audio to render")))?;
        Ok(RenderRequest {
            part_id,
            part_index: part.part_index,
            total_parts: part.total_parts,
            audio_path,
            audio_duration_secs: part.audio_duration_secs,
            caption: part.script,
        })
    })?;

    let Some(report) = ctx.executor.run(StageRequest::Render(request), cancel).await else {
        return Ok(Disposition::Cancelled);
    };

    match report.outcome {
        Ok(StageOutput::Video(video)) => {
            let platform = ctx.config.publish.platform.clone();
            let fan_in =
                ctx.transaction(|tx| coordinator::on_video_ready(tx, part_id, &video, &platform))?;
            if let Some(applied) = fan_in.applied {
                announce_item(ctx, task.source_item_id, &applied);
                ctx.runs.record_item_stage(task.source_item_id, Stage::Upload.as_str());
                tracing::info!(
                    item_id = %task.source_item_id,
                    attempts = fan_in.attempts.len(),
                    "Item ready to publish"
                );
            }
            Ok(Disposition::Done)
        }
        Err(e) => handle_stage_failure(ctx, task, Stage::Video, e),
        Ok(other) => Err(unexpected(Stage::Video, &other)),
    }
}

fn expect_item_status(
    conn: &rusqlite::Connection,
    item_id: SourceItemId,
    stage: Stage,
) -> Result<()> {
    let item = source_items::require_item(conn, item_id)?;
    if item.status != stage.working_status() {
        return Err(Error::illegal("source_item", item.status, format!("run({stage})")));
    }
    Ok(())
}

fn unexpected(stage: Stage, output: &StageOutput) -> Error {
    Error::stage(stage.as_str(), format!("unexpected collaborator output: {output:?}"))
}

/// Retry a transient script/audio/video failure or fail the item.
fn handle_stage_failure(
    ctx: &WorkerContext,
    task: &StageTask,
    stage: Stage,
    failure: StageError,
) -> Result<Disposition> {
    let item_id = task.source_item_id;
    let failures = task.attempts + 1;

    if failure.kind == sf_core::FailureKind::Transient {
        if let Decision::Retry { after } = ctx.stage_retry.decide(failures) {
            let at = Utc::now() + chrono_delay(after);
            ctx.transaction(|tx| tasks::reschedule(tx, task.id, at, &failure.to_string()))?;
            tracing::info!(
                item_id = %item_id,
                stage = %stage,
                attempt = failures,
                delay_secs = after.as_secs(),
                error = %failure.message,
                "Stage failed; retry scheduled"
            );
            ctx.event_bus.publish(EventPayload::StageRetryScheduled {
                item_id,
                stage,
                attempt: failures,
                delay_secs: after.as_secs(),
            });
            return Ok(Disposition::Settled);
        }
    }

    let error = if failure.kind == sf_core::FailureKind::Transient {
        format!("{} (gave up after {failures} attempts)", failure.message)
    } else {
        failure.message.clone()
    };

    let applied = ctx.transaction(|tx| {
        let applied = apply_item_event(
            tx,
            item_id,
            &Event::StageFailed {
                stage,
                error: error.clone(),
            },
        )?;
        tasks::kill(tx, task.id, &error)?;
        let cancelled = tasks::cancel_for_item(tx, item_id)?;
        if cancelled > 0 {
            tracing::debug!(item_id = %item_id, cancelled, "Cancelled sibling tasks");
        }
        Ok(applied)
    })?;

    tracing::warn!(item_id = %item_id, stage = %stage, kind = %failure.kind, error = %error, "Item failed");
    announce_item(ctx, item_id, &applied);
    ctx.event_bus.publish(EventPayload::ItemFailed {
        item_id,
        stage,
        error: error.clone(),
    });
    ctx.runs.complete_item_run(item_id, Some(&error));
    Ok(Disposition::Settled)
}

// ---------------------------------------------------------------------------
// Publish
// ---------------------------------------------------------------------------

/// What the claim phase of a publish task decided.
enum PublishClaim {
    Call(PublishRequest, u32),
    /// Daily quota exhausted; the task was deferred to this instant.
    Deferred(DateTime<Utc>),
}

/// What the record phase of a publish task changed.
struct PublishRecord {
    report_event: Event,
    to: AttemptStatus,
    retry_count: u32,
    retry_after: Option<Duration>,
    /// Artifact files to delete once the record commits.
    purged: Vec<PathBuf>,
    settlement: Settlement,
}

async fn handle_publish(
    ctx: &WorkerContext,
    task: &StageTask,
    cancel: &CancellationToken,
) -> Result<Disposition> {
    let attempt_id = task
        .attempt_id
        .ok_or_else(|| Error::Validation(format!("publish task {} has no attempt", task.id)))?;
    let platform = ctx.config.publish.platform.clone();
    let daily_limit = ctx.config.publish.daily_limit;

    let claim = ctx.transaction(|tx| {
        let attempt = publish_attempts::require_attempt(tx, attempt_id)?;
        if !matches!(attempt.status, AttemptStatus::Pending | AttemptStatus::Publishing) {
            return Err(Error::illegal("publish_attempt", attempt.status, "publish"));
        }
        let part = parts::require_part(tx, attempt.part_id)?;
        let item = source_items::require_item(tx, part.source_item_id)?;
        let video_path = part
            .video_path
            .ok_or_else(|| Error::Validation(format!("part {} has no video to publish", part.id)))?;

        if let Some(limit) = daily_limit {
            let now = Utc::now();
            if !quota::try_consume(tx, &attempt.platform, now.date_naive(), limit)? {
                let resume = next_utc_midnight(now);
                tasks::defer(tx, task.id, resume, "daily publish quota exhausted")?;
                return Ok(PublishClaim::Deferred(resume));
            }
        }

        if attempt.status == AttemptStatus::Pending {
            apply_attempt_event(tx, attempt_id, &Event::Dispatched)?;
        }

        Ok(PublishClaim::Call(
            PublishRequest {
                attempt_id,
                platform: attempt.platform,
                video_path,
                title: item.title,
                part_index: part.part_index,
                total_parts: part.total_parts,
            },
            part.part_index,
        ))
    })?;

    let (request, part_index) = match claim {
        PublishClaim::Call(request, index) => (request, index),
        PublishClaim::Deferred(resume) => {
            let retry_after_secs = (resume - Utc::now()).num_seconds().max(0) as u64;
            tracing::info!(platform = %platform, retry_after_secs, "Daily publish quota exhausted");
            ctx.event_bus.publish(EventPayload::QuotaExhausted {
                platform,
                retry_after_secs,
            });
            return Ok(Disposition::Settled);
        }
    };

    let Some(report) = ctx.executor.run(StageRequest::Publish(request), cancel).await else {
        return Ok(Disposition::Cancelled);
    };

    let record = ctx.transaction(|tx| record_publish(ctx, tx, task, attempt_id, &report))?;
    announce_publish(ctx, task, attempt_id, part_index, &record);
    Ok(Disposition::Settled)
}

/// Apply a publish outcome, decide on a retry, settle the item and the
/// task. Runs inside the record transaction.
fn record_publish(
    ctx: &WorkerContext,
    tx: &rusqlite::Connection,
    task: &StageTask,
    attempt_id: PublishAttemptId,
    report: &StageReport,
) -> Result<PublishRecord> {
    let event = report.event();
    let applied = apply_attempt_event(tx, attempt_id, &event)?;
    let mut to = applied.to;
    let mut retry_after = None;

    if to == AttemptStatus::Failed {
        match ctx.publish_retry.decide(applied.retry_count) {
            Decision::Retry { after } => {
                to = apply_attempt_event(tx, attempt_id, &Event::RetryScheduled)?.to;
                let error = event.error_text().unwrap_or("publish failed");
                tasks::reschedule(tx, task.id, Utc::now() + chrono_delay(after), error)?;
                retry_after = Some(after);
            }
            Decision::Escalate => {
                to = apply_attempt_event(tx, attempt_id, &Event::RetriesExhausted)?.to;
            }
        }
    }
    if retry_after.is_none() {
        tasks::complete_task(tx, task.id)?;
    }

    let purged = match (to, task.part_id) {
        (AttemptStatus::ManualRequired, Some(part_id)) => {
            escalation::retain_artifacts(tx, ctx.config.artifacts.on_manual_required, part_id)?
        }
        _ => Vec::new(),
    };

    let settlement = coordinator::settle_item(tx, task.source_item_id)?;
    Ok(PublishRecord {
        report_event: event,
        to,
        retry_count: applied.retry_count,
        retry_after,
        purged,
        settlement,
    })
}

fn announce_publish(
    ctx: &WorkerContext,
    task: &StageTask,
    attempt_id: PublishAttemptId,
    part_index: u32,
    record: &PublishRecord,
) {
    let item_id = task.source_item_id;

    match (&record.report_event, record.to) {
        (Event::PublishSucceeded { platform_ref, .. }, AttemptStatus::Success) => {
            tracing::info!(attempt_id = %attempt_id, part = part_index, platform_ref = %platform_ref, "Part published");
            if let Some(part_id) = task.part_id {
                ctx.event_bus.publish(EventPayload::PublishSucceeded {
                    attempt_id,
                    part_id,
                    platform_ref: platform_ref.clone(),
                });
            }
        }
        (_, AttemptStatus::Publishing) => {
            let delay_secs = record.retry_after.map(|d| d.as_secs()).unwrap_or(0);
            tracing::info!(
                attempt_id = %attempt_id,
                retry_count = record.retry_count,
                delay_secs,
                "Publish failed; retry scheduled"
            );
            ctx.event_bus.publish(EventPayload::PublishRetryScheduled {
                attempt_id,
                retry_count: record.retry_count,
                delay_secs,
            });
        }
        (event, AttemptStatus::ManualRequired) => {
            if let Some(part_id) = task.part_id {
                escalation::escalate(
                    ctx,
                    &Escalation {
                        attempt_id,
                        item_id,
                        part_id,
                        part_index,
                        reason: event
                            .error_text()
                            .unwrap_or("manual publishing required")
                            .to_string(),
                        purged: record.purged.clone(),
                    },
                );
            }
        }
        _ => {}
    }

    let settlement = &record.settlement;
    if let Some(batch) = &settlement.batch {
        ctx.event_bus.publish(EventPayload::BatchReconciled {
            batch_id: batch.id,
            status: batch.status,
            completed: batch.completed_parts,
            total: batch.total_parts,
        });
    }
    if let Some(applied) = &settlement.applied {
        announce_item(ctx, item_id, applied);
        match applied.to {
            ItemStatus::Completed => {
                tracing::info!(item_id = %item_id, "Item completed");
                ctx.runs.complete_item_run(item_id, None);
            }
            ItemStatus::Failed => {
                let error = "every part requires manual publishing";
                ctx.event_bus.publish(EventPayload::ItemFailed {
                    item_id,
                    stage: Stage::Upload,
                    error: error.into(),
                });
                ctx.runs.complete_item_run(item_id, Some(error));
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn announce_item(ctx: &WorkerContext, item_id: SourceItemId, applied: &Applied<ItemStatus>) {
    ctx.event_bus.publish(EventPayload::ItemStatusChanged {
        item_id,
        from: applied.from,
        to: applied.to,
    });
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1))
}

/// Start of the next UTC day after `now`.
fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + chrono::Days::new(1);
    tomorrow.and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::review::ReviewService;
    use crate::testing::{context, fast_config, insert_item, Scripted};
    use sf_core::config::RetentionPolicy;
    use sf_core::events::EventBus;
    use sf_core::{BatchStatus, TaskStatus};
    use sf_db::queries::batches;
    use sf_pipeline::{AudioArtifact, Narrator, StageResult};

    fn approve(ctx: &WorkerContext, item_id: SourceItemId) {
        ctx.transaction(|tx| {
            apply_item_event(tx, item_id, &Event::Approved)?;
            tasks::enqueue(tx, &sf_db::models::NewTask::script(item_id), None)?;
            Ok(())
        })
        .unwrap();
    }

    async fn run_all(ctx: &WorkerContext) -> usize {
        drain(ctx, "test-worker", &CancellationToken::new()).await.unwrap()
    }

    fn item_status(ctx: &WorkerContext, item_id: SourceItemId) -> ItemStatus {
        let conn = sf_db::get_conn(&ctx.db).unwrap();
        source_items::require_item(&conn, item_id).unwrap().status
    }

    #[tokio::test]
    async fn single_part_item_completes() {
        let ctx = context(fast_config(), Scripted::new(1).into_collaborators());
        let item_id = insert_item(&ctx, "a");
        approve(&ctx, item_id);

        // script, narrate, render, publish
        assert_eq!(run_all(&ctx).await, 4);
        assert_eq!(item_status(&ctx, item_id), ItemStatus::Completed);

        let conn = sf_db::get_conn(&ctx.db).unwrap();
        assert!(batches::get_for_item(&conn, item_id).unwrap().is_none());
        let attempts = publish_attempts::list_for_item(&conn, item_id).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].platform_ref.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn split_item_with_one_stuck_part_is_partial() {
        let fake = Scripted::new(3).fail_publish(3, StageError::transient("503"), 3);
        let ctx = context(fast_config(), fake.into_collaborators());
        let item_id = insert_item(&ctx, "b");
        approve(&ctx, item_id);

        run_all(&ctx).await;

        let conn = sf_db::get_conn(&ctx.db).unwrap();
        let batch = batches::get_for_item(&conn, item_id).unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Partial);
        assert_eq!(batch.completed_parts, 2);
        assert_eq!(batch.failed_indices, vec![3]);

        let attempts = publish_attempts::list_for_item(&conn, item_id).unwrap();
        let stuck: Vec<_> = attempts
            .iter()
            .filter(|a| a.status == AttemptStatus::ManualRequired)
            .collect();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].retry_count, 3);

        let item = source_items::require_item(&conn, item_id).unwrap();
        assert_eq!(item.status, ItemStatus::Uploading);
        assert!(item.needs_attention);
    }

    #[tokio::test]
    async fn auth_failure_escalates_without_retry() {
        let fake = Scripted::new(1).fail_publish(1, StageError::auth_required("login"), 1);
        let ctx = context(fast_config(), fake.into_collaborators());
        let item_id = insert_item(&ctx, "d");
        approve(&ctx, item_id);

        run_all(&ctx).await;

        let conn = sf_db::get_conn(&ctx.db).unwrap();
        let attempt = publish_attempts::list_for_item(&conn, item_id).unwrap().remove(0);
        assert_eq!(attempt.status, AttemptStatus::ManualRequired);
        assert_eq!(attempt.retry_count, 0);
        assert_eq!(item_status(&ctx, item_id), ItemStatus::Failed);
    }

    #[tokio::test]
    async fn transient_stage_failure_is_retried() {
        let fake = Scripted::new(1).fail(Stage::Audio, StageError::transient("tts busy"));
        let ctx = context(fast_config(), fake.into_collaborators());
        let item_id = insert_item(&ctx, "r");
        approve(&ctx, item_id);

        run_all(&ctx).await;
        assert_eq!(item_status(&ctx, item_id), ItemStatus::Completed);

        let conn = sf_db::get_conn(&ctx.db).unwrap();
        let narrate = tasks::list_for_item(&conn, item_id)
            .unwrap()
            .into_iter()
            .find(|t| t.kind == TaskKind::Narrate)
            .unwrap();
        assert_eq!(narrate.attempts, 1);
        assert_eq!(narrate.status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn terminal_stage_failure_fails_item() {
        let fake = Scripted::new(2).fail(Stage::Video, StageError::terminal("bad font"));
        let ctx = context(fast_config(), fake.into_collaborators());
        let item_id = insert_item(&ctx, "t");
        approve(&ctx, item_id);
        let mut rx = ctx.event_bus.subscribe();

        run_all(&ctx).await;

        let conn = sf_db::get_conn(&ctx.db).unwrap();
        let item = source_items::require_item(&conn, item_id).unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.error.as_deref(), Some("bad font"));

        let queued = tasks::list_for_item(&conn, item_id)
            .unwrap()
            .into_iter()
            .filter(|t| matches!(t.status, TaskStatus::Queued | TaskStatus::Running))
            .count();
        assert_eq!(queued, 0);

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event.payload, EventPayload::ItemFailed { stage: Stage::Video, .. }) {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn exhausted_quota_defers_publish() {
        let mut config = fast_config();
        config.publish.daily_limit = Some(1);
        let ctx = context(config, Scripted::new(2).into_collaborators());
        let item_id = insert_item(&ctx, "q");
        approve(&ctx, item_id);

        run_all(&ctx).await;

        let conn = sf_db::get_conn(&ctx.db).unwrap();
        let attempts = publish_attempts::list_for_item(&conn, item_id).unwrap();
        let published = attempts.iter().filter(|a| a.status == AttemptStatus::Success).count();
        let pending = attempts.iter().filter(|a| a.status == AttemptStatus::Pending).count();
        assert_eq!(published, 1);
        assert_eq!(pending, 1);

        let deferred = tasks::list_for_item(&conn, item_id)
            .unwrap()
            .into_iter()
            .find(|t| t.kind == TaskKind::Publish && t.status == TaskStatus::Queued)
            .unwrap();
        assert!(deferred.scheduled_for.is_some());
        assert_eq!(deferred.attempts, 0);
    }

    #[tokio::test]
    async fn stale_script_task_is_acknowledged() {
        let ctx = context(fast_config(), Scripted::new(1).into_collaborators());
        let item_id = insert_item(&ctx, "c");
        approve(&ctx, item_id);
        run_all(&ctx).await;

        // A duplicate script task for an item that has moved on.
        let conn = sf_db::get_conn(&ctx.db).unwrap();
        let dup = tasks::enqueue(&conn, &sf_db::models::NewTask::script(item_id), None).unwrap();
        drop(conn);
        assert_eq!(run_all(&ctx).await, 1);

        let conn = sf_db::get_conn(&ctx.db).unwrap();
        assert_eq!(tasks::get_task(&conn, dup.id).unwrap().unwrap().status, TaskStatus::Done);
        assert_eq!(parts::list_for_item(&conn, item_id).unwrap().len(), 1);
    }

    fn task_of(ctx: &WorkerContext, item_id: SourceItemId, kind: TaskKind) -> StageTask {
        let conn = sf_db::get_conn(&ctx.db).unwrap();
        tasks::list_for_item(&conn, item_id)
            .unwrap()
            .into_iter()
            .find(|t| t.kind == kind)
            .unwrap()
    }

    /// Narrator whose first call leaves a read transaction on `parts` open
    /// on another connection, so the record phase cannot write the part.
    struct LockingNarrator {
        db: sf_db::DbPool,
        reader: parking_lot::Mutex<Option<sf_db::PooledConnection>>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Narrator for LockingNarrator {
        async fn narrate(&self, request: &NarrateRequest) -> StageResult<AudioArtifact> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                let conn = sf_db::get_conn(&self.db).unwrap();
                conn.execute_batch("BEGIN").unwrap();
                let _: i64 = conn
                    .query_row("SELECT COUNT(*) FROM parts", [], |row| row.get(0))
                    .unwrap();
                *self.reader.lock() = Some(conn);
            }
            Ok(AudioArtifact {
                path: format!("/tmp/storyforge/{}.mp3", request.part_id),
                duration_secs: 30.0,
            })
        }
    }

    #[tokio::test]
    async fn unavailable_store_hands_the_task_back_untouched() {
        // Shared-cache memory databases fail table-locked writes at once.
        let db = sf_db::init_memory_pool().unwrap();
        let narrator = Arc::new(LockingNarrator {
            db: db.clone(),
            reader: parking_lot::Mutex::new(None),
            calls: AtomicUsize::new(0),
        });
        let mut collaborators = Scripted::new(1).into_collaborators();
        collaborators.narrator = narrator.clone();
        let ctx = WorkerContext::new(
            db,
            Arc::new(fast_config()),
            Arc::new(EventBus::default()),
            collaborators,
        );
        let item_id = insert_item(&ctx, "locked");
        approve(&ctx, item_id);
        let cancel = CancellationToken::new();

        assert!(process_next_task(&ctx, "w", &cancel).await.unwrap());
        // The narration result cannot be recorded; the worker backs off.
        assert!(!process_next_task(&ctx, "w", &cancel).await.unwrap());

        let narrate = task_of(&ctx, item_id, TaskKind::Narrate);
        assert_eq!(narrate.status, TaskStatus::Queued);
        assert_eq!(narrate.attempts, 0);
        assert!(narrate.locked_by.is_none());
        assert!(narrate.last_error.is_none());
        {
            let conn = sf_db::get_conn(&ctx.db).unwrap();
            let part = parts::list_for_item(&conn, item_id).unwrap().remove(0);
            assert!(part.audio_path.is_none());
        }
        assert_eq!(item_status(&ctx, item_id), ItemStatus::GeneratingAudio);

        let reader = narrator.reader.lock().take().unwrap();
        reader.execute_batch("ROLLBACK").unwrap();
        drop(reader);

        // Redelivered narrate, then render and publish.
        assert_eq!(run_all(&ctx).await, 3);
        assert_eq!(item_status(&ctx, item_id), ItemStatus::Completed);
        assert_eq!(narrator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_store_error_kills_the_task() {
        let ctx = context(fast_config(), Scripted::new(1).into_collaborators());
        let item_id = insert_item(&ctx, "rejected");
        approve(&ctx, item_id);
        sf_db::get_conn(&ctx.db)
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_audio BEFORE UPDATE OF audio_path ON parts
                 BEGIN SELECT RAISE(ABORT, 'audio rejected'); END;",
            )
            .unwrap();

        let handled = tokio::time::timeout(Duration::from_secs(10), run_all(&ctx))
            .await
            .expect("worker kept redelivering a task that cannot succeed");
        assert_eq!(handled, 2);

        let narrate = task_of(&ctx, item_id, TaskKind::Narrate);
        assert_eq!(narrate.status, TaskStatus::Dead);
        assert_eq!(narrate.attempts, 1);
        assert!(narrate.last_error.unwrap().contains("audio rejected"));
    }

    #[tokio::test]
    async fn purge_clears_references_with_the_escalation() {
        let mut config = fast_config();
        config.artifacts.on_manual_required = RetentionPolicy::Purge;
        let ctx = context(config, Scripted::new(1).into_collaborators());
        let item_id = insert_item(&ctx, "purge");
        approve(&ctx, item_id);
        let cancel = CancellationToken::new();

        // script, narrate, render
        for _ in 0..3 {
            assert!(process_next_task(&ctx, "w", &cancel).await.unwrap());
        }

        let (task, attempt_id) = {
            let conn = sf_db::get_conn(&ctx.db).unwrap();
            let task = tasks::dequeue_next(&conn, "w").unwrap().unwrap();
            let attempt_id = task.attempt_id.unwrap();
            apply_attempt_event(&conn, attempt_id, &Event::Dispatched).unwrap();
            (task, attempt_id)
        };
        let report = StageReport {
            stage: Stage::Upload,
            outcome: Err(StageError::auth_required("session expired")),
            elapsed: Duration::ZERO,
        };

        // Only the record transaction; no post-commit escalation yet.
        let record = ctx
            .transaction(|tx| record_publish(&ctx, tx, &task, attempt_id, &report))
            .unwrap();
        assert_eq!(record.to, AttemptStatus::ManualRequired);
        assert_eq!(record.purged.len(), 2);

        let conn = sf_db::get_conn(&ctx.db).unwrap();
        let part = parts::require_part(&conn, task.part_id.unwrap()).unwrap();
        assert!(part.audio_path.is_none());
        assert!(part.video_path.is_none());
        drop(conn);

        // A republish racing the escalation sees nothing to publish.
        let err = ReviewService::from_context(&ctx).republish(attempt_id).unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "{err}");
        let conn = sf_db::get_conn(&ctx.db).unwrap();
        assert_eq!(publish_attempts::list_for_item(&conn, item_id).unwrap().len(), 1);
    }

    #[test]
    fn midnight_is_next_day() {
        let now = "2026-03-14T23:59:30Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(next_utc_midnight(now).to_rfc3339(), "2026-03-15T00:00:00+00:00");
    }
}
