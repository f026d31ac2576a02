//! Daily publish quota counter.
//!
//! One row per `(platform, UTC day)`. Consuming a slot is a single
//! conditional upsert, so concurrent dispatchers can never push `used`
//! past the limit.

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use sf_core::Result;

use crate::db_error;

/// Try to take one publish slot for `platform` on `day`.
///
/// Returns `false` when the day's `limit` is already used up.
pub fn try_consume(conn: &Connection, platform: &str, day: NaiveDate, limit: u32) -> Result<bool> {
    if limit == 0 {
        return Ok(false);
    }
    let n = conn
        .execute(
            "INSERT INTO publish_quota (platform, day, used) VALUES (?1, ?2, 1)
             ON CONFLICT(platform, day) DO UPDATE SET used = used + 1 WHERE used < ?3",
            rusqlite::params![platform, day.to_string(), limit],
        )
        .map_err(db_error)?;
    Ok(n > 0)
}

/// Slots used for `platform` on `day`.
pub fn used(conn: &Connection, platform: &str, day: NaiveDate) -> Result<u32> {
    let used: Option<u32> = conn
        .query_row(
            "SELECT used FROM publish_quota WHERE platform = ?1 AND day = ?2",
            rusqlite::params![platform, day.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_error)?;
    Ok(used.unwrap_or(0))
}
