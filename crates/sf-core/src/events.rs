//! Pipeline event system for in-process observers.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel with a bounded
//! ring-buffer of recent events so that late-joining subscribers (the
//! notification dispatcher, the CLI status view) can catch up. Events are
//! published only after the state change they describe has committed.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ids::{BatchId, PartId, PublishAttemptId, SourceItemId};
use crate::status::{BatchStatus, ItemStatus, Stage};

/// Maximum number of events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 100;

// ---------------------------------------------------------------------------
// EventCategory
// ---------------------------------------------------------------------------

/// Audience category for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    /// Routine progress (stage transitions, batch reconciliation).
    Pipeline,
    /// Conditions an operator has to act on.
    Attention,
}

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// Payload describing what happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // -- Source item lifecycle -----------------------------------------------
    ItemsIngested {
        count: u64,
    },
    ItemStatusChanged {
        item_id: SourceItemId,
        from: ItemStatus,
        to: ItemStatus,
    },
    PartsCreated {
        item_id: SourceItemId,
        total: u32,
    },
    StageRetryScheduled {
        item_id: SourceItemId,
        stage: Stage,
        attempt: u32,
        delay_secs: u64,
    },
    ItemFailed {
        item_id: SourceItemId,
        stage: Stage,
        error: String,
    },

    // -- Publishing ----------------------------------------------------------
    PublishSucceeded {
        attempt_id: PublishAttemptId,
        part_id: PartId,
        platform_ref: String,
    },
    PublishRetryScheduled {
        attempt_id: PublishAttemptId,
        retry_count: u32,
        delay_secs: u64,
    },
    ManualRequired {
        attempt_id: PublishAttemptId,
        item_id: SourceItemId,
        part_index: u32,
        reason: String,
    },
    QuotaExhausted {
        platform: String,
        retry_after_secs: u64,
    },

    // -- Batches -------------------------------------------------------------
    BatchReconciled {
        batch_id: BatchId,
        status: BatchStatus,
        completed: u32,
        total: u32,
    },
}

impl EventPayload {
    /// The audience category this payload belongs to.
    pub fn category(&self) -> EventCategory {
        match self {
            Self::ItemFailed { .. } | Self::ManualRequired { .. } | Self::QuotaExhausted { .. } => {
                EventCategory::Attention
            }
            _ => EventCategory::Pipeline,
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A timestamped, categorised event ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub id: Uuid,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Audience category.
    pub category: EventCategory,
    /// What happened.
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a fresh UUID and the current timestamp.
    pub fn new(category: EventCategory, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            category,
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast channel with a bounded ring buffer of recent events.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    recent: RwLock<VecDeque<Event>>,
}

impl EventBus {
    /// Create a new event bus.
    ///
    /// `capacity` controls the broadcast channel buffer size (not the ring
    /// buffer, which is always [`MAX_RECENT_EVENTS`]).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    /// Subscribe to the broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all current subscribers and store it in the
    /// ring buffer.
    pub fn broadcast(&self, category: EventCategory, payload: EventPayload) {
        let event = Event::new(category, payload);

        // Store in ring buffer regardless of subscriber count.
        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_back();
            }
            recent.push_front(event.clone());
        }

        // Ignore send errors (no subscribers).
        let _ = self.tx.send(event);
    }

    /// Broadcast a payload under its own [`EventPayload::category`].
    pub fn publish(&self, payload: EventPayload) {
        self.broadcast(payload.category(), payload);
    }

    /// Return the `n` most recent events (newest first).
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        let recent = self.recent.read();
        recent.iter().take(n).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
