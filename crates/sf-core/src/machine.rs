//! The transition table for source items and publish attempts.
//!
//! [`transition`] is the only place that decides whether an event may move
//! an entity from one status to another. It performs no I/O: callers load
//! the current status, ask this module for the next one, and persist it with
//! a compare-and-swap on the status they read. A duplicate delivery of an
//! event finds the entity already advanced and is rejected here with
//! [`IllegalTransition`] instead of being applied twice.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::status::{AttemptStatus, ItemStatus, Stage};
use crate::Error;

// ---------------------------------------------------------------------------
// FailureKind
// ---------------------------------------------------------------------------

/// Classification of a collaborator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// This attempt failed; another attempt may succeed.
    Transient,
    /// The stage can never succeed for this entity.
    Terminal,
    /// The publisher needs a human to re-authenticate.
    AuthRequired,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Terminal => write!(f, "terminal"),
            Self::AuthRequired => write!(f, "auth_required"),
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Something that happened to a source item or publish attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // -- Review decisions ----------------------------------------------------
    Approved,
    Rejected {
        reason: Option<String>,
    },
    /// Operator restarts a failed item from `approved`.
    Reapproved,

    // -- Source item stages --------------------------------------------------
    StageStarted {
        stage: Stage,
    },
    StageSucceeded {
        stage: Stage,
    },
    StageFailed {
        stage: Stage,
        error: String,
    },
    /// Operator republished a part of an item that failed while uploading.
    UploadReopened,

    // -- Publish attempts ----------------------------------------------------
    Dispatched,
    PublishSucceeded {
        platform_ref: String,
        platform_url: Option<String>,
    },
    PublishFailed {
        error: String,
        kind: FailureKind,
    },
    RetryScheduled,
    RetriesExhausted,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Rejected { .. } => write!(f, "rejected"),
            Self::Reapproved => write!(f, "reapproved"),
            Self::StageStarted { stage } => write!(f, "stage_started({stage})"),
            Self::StageSucceeded { stage } => write!(f, "stage_succeeded({stage})"),
            Self::StageFailed { stage, .. } => write!(f, "stage_failed({stage})"),
            Self::UploadReopened => write!(f, "upload_reopened"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::PublishSucceeded { .. } => write!(f, "publish_succeeded"),
            Self::PublishFailed { kind, .. } => write!(f, "publish_failed({kind})"),
            Self::RetryScheduled => write!(f, "retry_scheduled"),
            Self::RetriesExhausted => write!(f, "retries_exhausted"),
        }
    }
}

impl Event {
    /// Error text carried by the event, persisted alongside the new status.
    pub fn error_text(&self) -> Option<&str> {
        match self {
            Self::StageFailed { error, .. } | Self::PublishFailed { error, .. } => Some(error),
            Self::Rejected { reason } => reason.as_deref(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// EntityState
// ---------------------------------------------------------------------------

/// The status of one entity, tagged with the entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "status", rename_all = "snake_case")]
pub enum EntityState {
    SourceItem(ItemStatus),
    PublishAttempt(AttemptStatus),
}

impl EntityState {
    /// Entity kind name used in logs and errors.
    pub fn entity(&self) -> &'static str {
        match self {
            Self::SourceItem(_) => "source_item",
            Self::PublishAttempt(_) => "publish_attempt",
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceItem(s) => write!(f, "{s}"),
            Self::PublishAttempt(s) => write!(f, "{s}"),
        }
    }
}

// ---------------------------------------------------------------------------
// IllegalTransition
// ---------------------------------------------------------------------------

/// An event that does not apply to the entity's current status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: EntityState,
    pub event: String,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cannot take {} from {}",
            self.from.entity(),
            self.event,
            self.from
        )
    }
}

impl std::error::Error for IllegalTransition {}

impl From<IllegalTransition> for Error {
    fn from(t: IllegalTransition) -> Self {
        Error::illegal(t.from.entity(), t.from, t.event)
    }
}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

/// Compute the next state for `state` given `event`, or reject the event.
pub fn transition(state: EntityState, event: &Event) -> Result<EntityState, IllegalTransition> {
    match state {
        EntityState::SourceItem(s) => item_transition(s, event).map(EntityState::SourceItem),
        EntityState::PublishAttempt(s) => {
            attempt_transition(s, event).map(EntityState::PublishAttempt)
        }
    }
}

/// Transition table for source items.
pub fn item_transition(
    current: ItemStatus,
    event: &Event,
) -> Result<ItemStatus, IllegalTransition> {
    use ItemStatus::*;

    let next = match (current, event) {
        (Pending, Event::Approved) => Some(Approved),
        (Pending, Event::Rejected { .. }) => Some(Rejected),
        (Failed, Event::Reapproved) => Some(Approved),
        (Failed, Event::UploadReopened) => Some(Uploading),
        (Approved, Event::StageStarted { stage: Stage::Script }) => Some(Scripting),
        (s, Event::StageSucceeded { stage }) if s == stage.working_status() => {
            Some(stage.success_status())
        }
        (s, Event::StageFailed { stage, .. }) if s == stage.working_status() => Some(Failed),
        _ => None,
    };

    next.ok_or_else(|| IllegalTransition {
        from: EntityState::SourceItem(current),
        event: event.to_string(),
    })
}

/// Transition table for publish attempts.
///
/// `manual_required` and `success` have no outgoing edges.
pub fn attempt_transition(
    current: AttemptStatus,
    event: &Event,
) -> Result<AttemptStatus, IllegalTransition> {
    use AttemptStatus::*;

    let next = match (current, event) {
        (Pending, Event::Dispatched) => Some(Publishing),
        (Publishing, Event::PublishSucceeded { .. }) => Some(Success),
        (Publishing, Event::PublishFailed { kind, .. }) => match kind {
            FailureKind::Transient => Some(Failed),
            FailureKind::Terminal | FailureKind::AuthRequired => Some(ManualRequired),
        },
        (Failed, Event::RetryScheduled) => Some(Publishing),
        (Failed, Event::RetriesExhausted) => Some(ManualRequired),
        _ => None,
    };

    next.ok_or_else(|| IllegalTransition {
        from: EntityState::PublishAttempt(current),
        event: event.to_string(),
    })
}

/// Whether applying `event` to an attempt counts against its retry budget.
///
/// Only a transient publish failure does; authentication and terminal
/// failures escalate without touching the counter.
pub fn consumes_retry(event: &Event) -> bool {
    matches!(
        event,
        Event::PublishFailed {
            kind: FailureKind::Transient,
            ..
        }
    )
}
