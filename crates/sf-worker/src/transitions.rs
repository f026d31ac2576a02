//! Persisting state machine transitions.
//!
//! Each function loads the entity, asks [`sf_core::machine`] for the next
//! status, and writes it back with a compare-and-swap on the status it read.
//! Callers run these inside [`sf_db::with_immediate_tx`], so the read and
//! the CAS see the same snapshot and a lost race surfaces as an
//! [`Error::IllegalTransition`] rather than a double apply.

use rusqlite::Connection;

use sf_core::machine::{attempt_transition, consumes_retry, item_transition};
use sf_core::{AttemptStatus, Error, Event, ItemStatus, PublishAttemptId, Result, SourceItemId};
use sf_db::models::AttemptUpdate;
use sf_db::queries::{publish_attempts, source_items};

/// A status change that was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied<S> {
    pub from: S,
    pub to: S,
}

/// A publish attempt status change, with the counter after the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptApplied {
    pub from: AttemptStatus,
    pub to: AttemptStatus,
    pub retry_count: u32,
}

/// Apply `event` to a source item.
pub fn apply_item_event(
    conn: &Connection,
    item_id: SourceItemId,
    event: &Event,
) -> Result<Applied<ItemStatus>> {
    let item = source_items::require_item(conn, item_id)?;
    let to = item_transition(item.status, event)?;

    if !source_items::update_status(conn, item_id, item.status, to, event.error_text())? {
        return Err(Error::illegal("source_item", item.status, event));
    }
    if let Event::Rejected { reason } = event {
        source_items::set_rejection_reason(conn, item_id, reason.as_deref())?;
    }

    tracing::debug!(
        item_id = %item_id,
        from = %item.status,
        to = %to,
        event = %event,
        "Item transition applied"
    );
    Ok(Applied {
        from: item.status,
        to,
    })
}

/// Apply `event` to a publish attempt.
///
/// A transient failure increments `retry_count` in the same write; a
/// success records the platform reference.
pub fn apply_attempt_event(
    conn: &Connection,
    attempt_id: PublishAttemptId,
    event: &Event,
) -> Result<AttemptApplied> {
    let attempt = publish_attempts::require_attempt(conn, attempt_id)?;
    let to = attempt_transition(attempt.status, event)?;

    let bump_retry = consumes_retry(event);
    let mut update = AttemptUpdate {
        error: event.error_text(),
        bump_retry,
        ..Default::default()
    };
    if let Event::PublishSucceeded {
        platform_ref,
        platform_url,
    } = event
    {
        update.platform_ref = Some(platform_ref);
        update.platform_url = platform_url.as_deref();
    }

    if !publish_attempts::update_status(conn, attempt_id, attempt.status, to, &update)? {
        return Err(Error::illegal("publish_attempt", attempt.status, event));
    }

    let retry_count = attempt.retry_count + u32::from(bump_retry);
    tracing::debug!(
        attempt_id = %attempt_id,
        from = %attempt.status,
        to = %to,
        retry_count,
        event = %event,
        "Attempt transition applied"
    );
    Ok(AttemptApplied {
        from: attempt.status,
        to,
        retry_count,
    })
}
