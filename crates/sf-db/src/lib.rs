//! sf-db: the entity store.
//!
//! SQLite-backed storage with connection pooling, embedded migrations,
//! typed row models, and one query module per table. The store is the only
//! shared mutable resource of the pipeline: every status change is applied
//! as a compare-and-swap inside an IMMEDIATE transaction (see
//! [`pool::with_immediate_tx`]).

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;

use rusqlite::ErrorCode;
use sf_core::Error;

pub use pool::{get_conn, init_memory_pool, init_pool, with_immediate_tx, DbPool, PooledConnection};

/// Current time formatted the way every timestamp column stores it.
///
/// Fixed-width UTC so that lexicographic order matches chronological order.
pub fn now_ts() -> String {
    ts(chrono::Utc::now())
}

/// Format an arbitrary instant as a timestamp column value.
pub fn ts(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Map a SQLite failure onto the crate error.
///
/// Busy, locked and cannot-open mean the store was unreachable and nothing
/// was applied, so the caller may redeliver. Everything else (constraint
/// failures, schema errors, corrupt rows) is [`Error::Database`] and will
/// fail the same way again.
pub fn db_error(e: rusqlite::Error) -> Error {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen) => {
            Error::StoreUnavailable(e.to_string())
        }
        _ => Error::database(e),
    }
}
