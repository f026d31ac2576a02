//! Source item operations.

use rusqlite::{Connection, OptionalExtension};
use sf_core::{Error, ItemStatus, Result, SourceItemId};

use crate::models::{NewSourceItem, SourceItem};
use crate::{db_error, now_ts};

const COLS: &str = "id, source, external_id, title, body, char_count, status,
    error, rejection_reason, needs_attention, created_at, updated_at";

/// Insert a fetched item unless `(source, external_id)` already exists.
///
/// Returns `None` for a duplicate.
pub fn insert_if_new(conn: &Connection, new: &NewSourceItem) -> Result<Option<SourceItem>> {
    let id = SourceItemId::new();
    let now = now_ts();
    let char_count = new.body.chars().count() as i64;

    let n = conn
        .execute(
            "INSERT OR IGNORE INTO source_items
                (id, source, external_id, title, body, char_count, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)",
            rusqlite::params![
                id.to_string(),
                new.source,
                new.external_id,
                new.title,
                new.body,
                char_count,
                &now
            ],
        )
        .map_err(db_error)?;

    if n == 0 {
        return Ok(None);
    }

    Ok(Some(SourceItem {
        id,
        source: new.source.clone(),
        external_id: new.external_id.clone(),
        title: new.title.clone(),
        body: new.body.clone(),
        char_count,
        status: ItemStatus::Pending,
        error: None,
        rejection_reason: None,
        needs_attention: false,
        created_at: now.clone(),
        updated_at: now,
    }))
}

/// Get a source item by ID.
pub fn get_item(conn: &Connection, id: SourceItemId) -> Result<Option<SourceItem>> {
    let q = format!("SELECT {COLS} FROM source_items WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], SourceItem::from_row)
        .optional()
        .map_err(db_error)
}

/// Get a source item, failing with [`Error::NotFound`] when it is missing.
pub fn require_item(conn: &Connection, id: SourceItemId) -> Result<SourceItem> {
    get_item(conn, id)?.ok_or_else(|| Error::not_found("source_item", id))
}

/// List source items with optional status filter and pagination.
pub fn list_items(
    conn: &Connection,
    status: Option<ItemStatus>,
    offset: i64,
    limit: i64,
) -> Result<Vec<SourceItem>> {
    let (q, params_vec): (String, Vec<Box<dyn rusqlite::types::ToSql>>) = if let Some(s) = status {
        (
            format!(
                "SELECT {COLS} FROM source_items WHERE status = ?1
                 ORDER BY created_at ASC LIMIT ?2 OFFSET ?3"
            ),
            vec![
                Box::new(s.as_str().to_string()),
                Box::new(limit),
                Box::new(offset),
            ],
        )
    } else {
        (
            format!("SELECT {COLS} FROM source_items ORDER BY created_at ASC LIMIT ?1 OFFSET ?2"),
            vec![Box::new(limit), Box::new(offset)],
        )
    };

    let mut stmt = conn.prepare(&q).map_err(db_error)?;
    let params_refs: Vec<&dyn rusqlite::types::ToSql> =
        params_vec.iter().map(|b| b.as_ref()).collect();
    let rows = stmt
        .query_map(params_refs.as_slice(), SourceItem::from_row)
        .map_err(db_error)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_error)?;
    Ok(rows)
}

/// Items flagged for operator attention, oldest first.
pub fn list_needing_attention(conn: &Connection) -> Result<Vec<SourceItem>> {
    let q = format!(
        "SELECT {COLS} FROM source_items WHERE needs_attention = 1 ORDER BY updated_at ASC"
    );
    let mut stmt = conn.prepare(&q).map_err(db_error)?;
    let rows = stmt
        .query_map([], SourceItem::from_row)
        .map_err(db_error)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_error)?;
    Ok(rows)
}

/// Count items per status. Statuses with no items are omitted.
pub fn count_by_status(conn: &Connection) -> Result<Vec<(ItemStatus, i64)>> {
    let mut stmt = conn
        .prepare("SELECT status, COUNT(*) FROM source_items GROUP BY status ORDER BY status")
        .map_err(db_error)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(db_error)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_error)?;

    rows.into_iter()
        .map(|(s, n)| s.parse::<ItemStatus>().map(|status| (status, n)))
        .collect()
}

/// Compare-and-swap the item status.
///
/// Writes only if the row is still in `from`; returns `false` when another
/// writer got there first. `error` replaces the stored error text.
pub fn update_status(
    conn: &Connection,
    id: SourceItemId,
    from: ItemStatus,
    to: ItemStatus,
    error: Option<&str>,
) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE source_items SET status = ?1, error = ?2, updated_at = ?3
             WHERE id = ?4 AND status = ?5",
            rusqlite::params![to.as_str(), error, now_ts(), id.to_string(), from.as_str()],
        )
        .map_err(db_error)?;
    Ok(n > 0)
}

/// Store the operator's rejection reason.
pub fn set_rejection_reason(
    conn: &Connection,
    id: SourceItemId,
    reason: Option<&str>,
) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE source_items SET rejection_reason = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![reason, now_ts(), id.to_string()],
        )
        .map_err(db_error)?;
    Ok(n > 0)
}

/// Set or clear the operator-attention flag.
pub fn set_needs_attention(conn: &Connection, id: SourceItemId, flag: bool) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE source_items SET needs_attention = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![flag as i64, now_ts(), id.to_string()],
        )
        .map_err(db_error)?;
    Ok(n > 0)
}
