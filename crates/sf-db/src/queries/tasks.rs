//! Stage task queue operations.
//!
//! A task is claimed with a single atomic `UPDATE … RETURNING`, so two
//! workers polling at the same instant can never both receive it. Tasks are
//! delivered at least once: a worker that dies mid-task leaves it `running`
//! until [`requeue_stale`] hands it out again.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use sf_core::{Result, SourceItemId, TaskId, TaskStatus};

use crate::models::{NewTask, StageTask};
use crate::{db_error, now_ts, ts};

const COLS: &str = "id, kind, source_item_id, part_id, attempt_id, status, attempts,
    locked_by, locked_at, scheduled_for, last_error, created_at, updated_at";

/// Enqueue a task, optionally not before `scheduled_for`.
pub fn enqueue(
    conn: &Connection,
    task: &NewTask,
    scheduled_for: Option<DateTime<Utc>>,
) -> Result<StageTask> {
    let id = TaskId::new();
    let now = now_ts();
    let scheduled_for = scheduled_for.map(ts);

    conn.execute(
        "INSERT INTO stage_tasks
            (id, kind, source_item_id, part_id, attempt_id, status, scheduled_for, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6, ?7, ?7)",
        rusqlite::params![
            id.to_string(),
            task.kind.as_str(),
            task.source_item_id.to_string(),
            task.part_id.map(|p| p.to_string()),
            task.attempt_id.map(|a| a.to_string()),
            scheduled_for,
            &now
        ],
    )
    .map_err(db_error)?;

    Ok(StageTask {
        id,
        kind: task.kind,
        source_item_id: task.source_item_id,
        part_id: task.part_id,
        attempt_id: task.attempt_id,
        status: TaskStatus::Queued,
        attempts: 0,
        locked_by: None,
        locked_at: None,
        scheduled_for,
        last_error: None,
        created_at: now.clone(),
        updated_at: now,
    })
}

/// Get a task by ID.
pub fn get_task(conn: &Connection, id: TaskId) -> Result<Option<StageTask>> {
    let q = format!("SELECT {COLS} FROM stage_tasks WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], StageTask::from_row)
        .optional()
        .map_err(db_error)
}

/// Atomically claim the oldest due queued task.
///
/// Sets `status='running'`, `locked_by`, `locked_at`.
pub fn dequeue_next(conn: &Connection, worker: &str) -> Result<Option<StageTask>> {
    let now = now_ts();

    let q = format!(
        "UPDATE stage_tasks SET status='running', locked_by=?1, locked_at=?2, updated_at=?2
         WHERE id = (
             SELECT id FROM stage_tasks
             WHERE status='queued' AND (scheduled_for IS NULL OR scheduled_for <= ?2)
             ORDER BY COALESCE(scheduled_for, created_at) ASC, created_at ASC LIMIT 1
         )
         RETURNING {COLS}"
    );

    conn.query_row(&q, rusqlite::params![worker, &now], StageTask::from_row)
        .optional()
        .map_err(db_error)
}

/// Acknowledge a task as finished.
pub fn complete_task(conn: &Connection, id: TaskId) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE stage_tasks SET status='done', locked_by=NULL, locked_at=NULL, updated_at=?1
             WHERE id=?2 AND status='running'",
            rusqlite::params![now_ts(), id.to_string()],
        )
        .map_err(db_error)?;
    Ok(n > 0)
}

/// Put a failed task back in the queue for another try at `at`.
///
/// Counts the failure against the task's `attempts`.
pub fn reschedule(conn: &Connection, id: TaskId, at: DateTime<Utc>, error: &str) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE stage_tasks SET status='queued', attempts=attempts+1, last_error=?1,
                scheduled_for=?2, locked_by=NULL, locked_at=NULL, updated_at=?3
             WHERE id=?4 AND status='running'",
            rusqlite::params![error, ts(at), now_ts(), id.to_string()],
        )
        .map_err(db_error)?;
    Ok(n > 0)
}

/// Postpone a task to `at` without counting a failure (quota exhausted).
pub fn defer(conn: &Connection, id: TaskId, at: DateTime<Utc>, reason: &str) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE stage_tasks SET status='queued', last_error=?1, scheduled_for=?2,
                locked_by=NULL, locked_at=NULL, updated_at=?3
             WHERE id=?4 AND status='running'",
            rusqlite::params![reason, ts(at), now_ts(), id.to_string()],
        )
        .map_err(db_error)?;
    Ok(n > 0)
}

/// Return a claimed task to the queue untouched (its event was not applied).
pub fn release(conn: &Connection, id: TaskId) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE stage_tasks SET status='queued', locked_by=NULL, locked_at=NULL, updated_at=?1
             WHERE id=?2 AND status='running'",
            rusqlite::params![now_ts(), id.to_string()],
        )
        .map_err(db_error)?;
    Ok(n > 0)
}

/// Retire a task that will never be retried.
pub fn kill(conn: &Connection, id: TaskId, error: &str) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE stage_tasks SET status='dead', attempts=attempts+1, last_error=?1,
                locked_by=NULL, locked_at=NULL, updated_at=?2
             WHERE id=?3 AND status='running'",
            rusqlite::params![error, now_ts(), id.to_string()],
        )
        .map_err(db_error)?;
    Ok(n > 0)
}

/// Return `running` tasks locked before `cutoff` to the queue.
///
/// Returns the number of tasks recovered.
pub fn requeue_stale(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    conn.execute(
        "UPDATE stage_tasks SET status='queued', locked_by=NULL, locked_at=NULL, updated_at=?1
         WHERE status='running' AND locked_at < ?2",
        rusqlite::params![now_ts(), ts(cutoff)],
    )
    .map_err(db_error)
}

/// Drop every unfinished task of an item.
pub fn cancel_for_item(conn: &Connection, item_id: SourceItemId) -> Result<usize> {
    conn.execute(
        "DELETE FROM stage_tasks WHERE source_item_id=?1 AND status IN ('queued', 'running')",
        [item_id.to_string()],
    )
    .map_err(db_error)
}

/// All tasks of an item, oldest first.
pub fn list_for_item(conn: &Connection, item_id: SourceItemId) -> Result<Vec<StageTask>> {
    let q = format!(
        "SELECT {COLS} FROM stage_tasks WHERE source_item_id = ?1 ORDER BY created_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare(&q).map_err(db_error)?;
    let rows = stmt
        .query_map([item_id.to_string()], StageTask::from_row)
        .map_err(db_error)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_error)?;
    Ok(rows)
}

/// Count tasks per status. Statuses with no tasks are omitted.
pub fn count_by_status(conn: &Connection) -> Result<Vec<(TaskStatus, i64)>> {
    let mut stmt = conn
        .prepare("SELECT status, COUNT(*) FROM stage_tasks GROUP BY status ORDER BY status")
        .map_err(db_error)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(db_error)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_error)?;

    rows.into_iter()
        .map(|(s, n)| s.parse::<TaskStatus>().map(|status| (status, n)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewSourceItem;
    use crate::pool::{get_conn, init_memory_pool};
    use crate::queries::source_items;
    use chrono::Duration;
    use sf_core::TaskKind;

    fn seed_item(conn: &Connection) -> SourceItemId {
        source_items::insert_if_new(
            conn,
            &NewSourceItem {
                source: "nosleep".into(),
                external_id: "t".into(),
                title: "t".into(),
                body: "b".into(),
            },
        )
        .unwrap()
        .unwrap()
        .id
    }

    #[test]
    fn dequeue_claims_once() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let item = seed_item(&conn);
        let task = enqueue(&conn, &NewTask::script(item), None).unwrap();

        let claimed = dequeue_next(&conn, "w1").unwrap().unwrap();
        assert_eq!(claimed.id, task.id);
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(claimed.kind, TaskKind::Script);
        assert_eq!(claimed.locked_by.as_deref(), Some("w1"));

        assert!(dequeue_next(&conn, "w2").unwrap().is_none());
    }

    #[test]
    fn future_tasks_are_not_due() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let item = seed_item(&conn);
        enqueue(&conn, &NewTask::script(item), Some(Utc::now() + Duration::hours(1))).unwrap();
        assert!(dequeue_next(&conn, "w1").unwrap().is_none());

        let past = Utc::now() - Duration::seconds(1);
        let due = enqueue(&conn, &NewTask::script(item), Some(past)).unwrap();
        assert_eq!(dequeue_next(&conn, "w1").unwrap().unwrap().id, due.id);
    }

    #[test]
    fn reschedule_counts_attempts() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let item = seed_item(&conn);
        let task = enqueue(&conn, &NewTask::script(item), None).unwrap();
        dequeue_next(&conn, "w1").unwrap();

        let past = Utc::now() - Duration::seconds(1);
        assert!(reschedule(&conn, task.id, past, "llm timeout").unwrap());
        let loaded = get_task(&conn, task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Queued);
        assert_eq!(loaded.attempts, 1);
        assert_eq!(loaded.last_error.as_deref(), Some("llm timeout"));
        assert!(loaded.locked_by.is_none());

        // Only a running task can be rescheduled.
        assert!(!reschedule(&conn, task.id, Utc::now(), "again").unwrap());
    }

    #[test]
    fn defer_and_release_do_not_count() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let item = seed_item(&conn);
        let task = enqueue(&conn, &NewTask::script(item), None).unwrap();

        dequeue_next(&conn, "w1").unwrap();
        assert!(release(&conn, task.id).unwrap());
        dequeue_next(&conn, "w1").unwrap();
        assert!(defer(&conn, task.id, Utc::now() + Duration::hours(3), "quota").unwrap());

        let loaded = get_task(&conn, task.id).unwrap().unwrap();
        assert_eq!(loaded.attempts, 0);
        assert_eq!(loaded.status, TaskStatus::Queued);
        assert!(dequeue_next(&conn, "w1").unwrap().is_none());
    }

    #[test]
    fn complete_and_kill() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let item = seed_item(&conn);
        let a = enqueue(&conn, &NewTask::script(item), None).unwrap();
        let b = enqueue(&conn, &NewTask::script(item), None).unwrap();

        dequeue_next(&conn, "w1").unwrap();
        dequeue_next(&conn, "w1").unwrap();
        assert!(complete_task(&conn, a.id).unwrap());
        assert!(!complete_task(&conn, a.id).unwrap());
        assert!(kill(&conn, b.id, "policy violation").unwrap());

        let counts = count_by_status(&conn).unwrap();
        assert!(counts.contains(&(TaskStatus::Done, 1)));
        assert!(counts.contains(&(TaskStatus::Dead, 1)));
    }

    #[test]
    fn requeue_stale_recovers_abandoned() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let item = seed_item(&conn);
        let task = enqueue(&conn, &NewTask::script(item), None).unwrap();
        dequeue_next(&conn, "crashed-worker").unwrap();

        // Not stale yet.
        assert_eq!(requeue_stale(&conn, Utc::now() - Duration::hours(1)).unwrap(), 0);
        assert_eq!(requeue_stale(&conn, Utc::now() + Duration::seconds(1)).unwrap(), 1);

        let claimed = dequeue_next(&conn, "w2").unwrap().unwrap();
        assert_eq!(claimed.id, task.id);
    }

    #[test]
    fn cancel_for_item_keeps_history() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let item = seed_item(&conn);
        let done = enqueue(&conn, &NewTask::script(item), None).unwrap();
        dequeue_next(&conn, "w1").unwrap();
        complete_task(&conn, done.id).unwrap();
        enqueue(&conn, &NewTask::script(item), None).unwrap();

        assert_eq!(cancel_for_item(&conn, item).unwrap(), 1);
        let remaining = list_for_item(&conn, item).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].status, TaskStatus::Done);
    }
}
