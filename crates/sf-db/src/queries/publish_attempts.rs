//! Publish attempt operations.

use rusqlite::{Connection, OptionalExtension};
use sf_core::{AttemptStatus, Error, PartId, PublishAttemptId, Result, SourceItemId};

use crate::models::{AttemptUpdate, PartOutcome, PublishAttempt};
use crate::{db_error, now_ts};

const COLS: &str = "id, part_id, platform, status, retry_count, error,
    platform_ref, platform_url, created_at, updated_at, published_at";

/// Create a pending attempt for a part.
pub fn create_attempt(
    conn: &Connection,
    part_id: PartId,
    platform: &str,
) -> Result<PublishAttempt> {
    let id = PublishAttemptId::new();
    let now = now_ts();

    conn.execute(
        "INSERT INTO publish_attempts (id, part_id, platform, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
        rusqlite::params![id.to_string(), part_id.to_string(), platform, &now],
    )
    .map_err(db_error)?;

    Ok(PublishAttempt {
        id,
        part_id,
        platform: platform.to_string(),
        status: AttemptStatus::Pending,
        retry_count: 0,
        error: None,
        platform_ref: None,
        platform_url: None,
        created_at: now.clone(),
        updated_at: now,
        published_at: None,
    })
}

/// Get an attempt by ID.
pub fn get_attempt(conn: &Connection, id: PublishAttemptId) -> Result<Option<PublishAttempt>> {
    let q = format!("SELECT {COLS} FROM publish_attempts WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], PublishAttempt::from_row)
        .optional()
        .map_err(db_error)
}

/// Get an attempt, failing with [`Error::NotFound`] when it is missing.
pub fn require_attempt(conn: &Connection, id: PublishAttemptId) -> Result<PublishAttempt> {
    get_attempt(conn, id)?.ok_or_else(|| Error::not_found("publish_attempt", id))
}

fn query_list(conn: &Connection, q: &str, param: String) -> Result<Vec<PublishAttempt>> {
    let mut stmt = conn.prepare(q).map_err(db_error)?;
    let rows = stmt
        .query_map([param], PublishAttempt::from_row)
        .map_err(db_error)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_error)?;
    Ok(rows)
}

/// Every attempt for one part, oldest first.
pub fn list_for_part(conn: &Connection, part_id: PartId) -> Result<Vec<PublishAttempt>> {
    let q = format!(
        "SELECT {COLS} FROM publish_attempts WHERE part_id = ?1 ORDER BY created_at ASC, rowid ASC"
    );
    query_list(conn, &q, part_id.to_string())
}

/// Every attempt for every part of an item, ordered by part then age.
pub fn list_for_item(conn: &Connection, item_id: SourceItemId) -> Result<Vec<PublishAttempt>> {
    let cols = COLS
        .split(',')
        .map(|c| format!("a.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let q = format!(
        "SELECT {cols} FROM publish_attempts a JOIN parts p ON p.id = a.part_id
         WHERE p.source_item_id = ?1
         ORDER BY p.part_index ASC, a.created_at ASC, a.rowid ASC"
    );
    query_list(conn, &q, item_id.to_string())
}

/// Attempts in one status, oldest first.
pub fn list_by_status(conn: &Connection, status: AttemptStatus) -> Result<Vec<PublishAttempt>> {
    let q = format!(
        "SELECT {COLS} FROM publish_attempts WHERE status = ?1 ORDER BY updated_at ASC"
    );
    query_list(conn, &q, status.as_str().to_string())
}

/// Compare-and-swap the attempt status together with its event metadata.
///
/// Writes only if the row is still in `from`. `published_at` is stamped on
/// the move to `success`; the retry counter only ever grows.
pub fn update_status(
    conn: &Connection,
    id: PublishAttemptId,
    from: AttemptStatus,
    to: AttemptStatus,
    update: &AttemptUpdate<'_>,
) -> Result<bool> {
    let now = now_ts();
    let published_at = (to == AttemptStatus::Success).then(|| now.clone());
    let n = conn
        .execute(
            "UPDATE publish_attempts SET
                status = ?1,
                retry_count = retry_count + ?2,
                error = COALESCE(?3, error),
                platform_ref = COALESCE(?4, platform_ref),
                platform_url = COALESCE(?5, platform_url),
                published_at = COALESCE(?6, published_at),
                updated_at = ?7
             WHERE id = ?8 AND status = ?9",
            rusqlite::params![
                to.as_str(),
                update.bump_retry as i64,
                update.error,
                update.platform_ref,
                update.platform_url,
                published_at,
                &now,
                id.to_string(),
                from.as_str()
            ],
        )
        .map_err(db_error)?;
    Ok(n > 0)
}

/// The latest attempt status of every part of an item, ordered by index.
///
/// "Latest" is the most recently created attempt; an operator republish
/// supersedes the `manual_required` attempt it replaces.
pub fn latest_per_part(conn: &Connection, item_id: SourceItemId) -> Result<Vec<PartOutcome>> {
    let mut stmt = conn
        .prepare(
            "SELECT p.id, p.part_index,
                (SELECT a.status FROM publish_attempts a
                  WHERE a.part_id = p.id
                  ORDER BY a.created_at DESC, a.rowid DESC LIMIT 1)
             FROM parts p
             WHERE p.source_item_id = ?1
             ORDER BY p.part_index ASC",
        )
        .map_err(db_error)?;
    let rows = stmt
        .query_map([item_id.to_string()], PartOutcome::from_row)
        .map_err(db_error)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_error)?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewSourceItem;
    use crate::pool::{get_conn, init_memory_pool};
    use crate::queries::{parts, source_items};

    fn seed(conn: &Connection, n: usize) -> (SourceItemId, Vec<PartId>) {
        let item = source_items::insert_if_new(
            conn,
            &NewSourceItem {
                source: "nosleep".into(),
                external_id: "pa".into(),
                title: "t".into(),
                body: "b".into(),
            },
        )
        .unwrap()
        .unwrap();
        let scripts: Vec<String> = (0..n).map(|i| format!("s{i}")).collect();
        let parts = parts::create_parts(conn, item.id, &scripts).unwrap();
        (item.id, parts.into_iter().map(|p| p.id).collect())
    }

    #[test]
    fn create_and_get() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let (_, parts) = seed(&conn, 1);

        let attempt = create_attempt(&conn, parts[0], "tiktok").unwrap();
        let loaded = get_attempt(&conn, attempt.id).unwrap().unwrap();
        assert_eq!(loaded.status, AttemptStatus::Pending);
        assert_eq!(loaded.retry_count, 0);
        assert_eq!(loaded.platform, "tiktok");
        assert!(loaded.published_at.is_none());
    }

    #[test]
    fn update_status_cas_and_metadata() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let (_, parts) = seed(&conn, 1);
        let attempt = create_attempt(&conn, parts[0], "tiktok").unwrap();

        let none = AttemptUpdate::default();
        let (pending, publishing) = (AttemptStatus::Pending, AttemptStatus::Publishing);
        let dispatch =
            |conn: &Connection| update_status(conn, attempt.id, pending, publishing, &none);
        assert!(dispatch(&conn).unwrap());
        assert!(!dispatch(&conn).unwrap());

        let failed = AttemptUpdate {
            error: Some("upload timed out"),
            bump_retry: true,
            ..Default::default()
        };
        let moved = update_status(&conn, attempt.id, publishing, AttemptStatus::Failed, &failed);
        assert!(moved.unwrap());
        let loaded = require_attempt(&conn, attempt.id).unwrap();
        assert_eq!(loaded.retry_count, 1);
        assert_eq!(loaded.error.as_deref(), Some("upload timed out"));

        update_status(&conn, attempt.id, AttemptStatus::Failed, AttemptStatus::Publishing, &none)
            .unwrap();
        let success = AttemptUpdate {
            platform_ref: Some("v123"),
            platform_url: Some("https://example.test/v123"),
            ..Default::default()
        };
        update_status(
            &conn,
            attempt.id,
            AttemptStatus::Publishing,
            AttemptStatus::Success,
            &success,
        )
        .unwrap();

        let loaded = require_attempt(&conn, attempt.id).unwrap();
        assert_eq!(loaded.status, AttemptStatus::Success);
        assert_eq!(loaded.retry_count, 1);
        assert_eq!(loaded.platform_ref.as_deref(), Some("v123"));
        assert!(loaded.published_at.is_some());
    }

    #[test]
    fn latest_per_part_prefers_newest_attempt() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let (item, parts) = seed(&conn, 3);

        let first = create_attempt(&conn, parts[0], "tiktok").unwrap();
        let none = AttemptUpdate::default();
        update_status(&conn, first.id, AttemptStatus::Pending, AttemptStatus::Publishing, &none)
            .unwrap();
        update_status(
            &conn,
            first.id,
            AttemptStatus::Publishing,
            AttemptStatus::ManualRequired,
            &none,
        )
        .unwrap();
        // Operator republish creates a newer attempt for the same part.
        create_attempt(&conn, parts[0], "tiktok").unwrap();
        create_attempt(&conn, parts[1], "tiktok").unwrap();

        let outcomes = latest_per_part(&conn, item).unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].part_index, 1);
        assert_eq!(outcomes[0].status, Some(AttemptStatus::Pending));
        assert_eq!(outcomes[1].status, Some(AttemptStatus::Pending));
        assert_eq!(outcomes[2].status, None);
    }

    #[test]
    fn list_queries() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let (item, parts) = seed(&conn, 2);
        create_attempt(&conn, parts[1], "tiktok").unwrap();
        create_attempt(&conn, parts[0], "tiktok").unwrap();
        create_attempt(&conn, parts[0], "tiktok").unwrap();

        assert_eq!(list_for_part(&conn, parts[0]).unwrap().len(), 2);
        let all = list_for_item(&conn, item).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].part_id, parts[0]);
        assert_eq!(all[2].part_id, parts[1]);
        assert_eq!(list_by_status(&conn, AttemptStatus::Pending).unwrap().len(), 3);
        assert!(list_by_status(&conn, AttemptStatus::ManualRequired).unwrap().is_empty());
    }
}
