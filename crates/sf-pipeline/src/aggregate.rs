//! Pure batch derivation.
//!
//! Aggregate status is a function of the latest publish attempt of every
//! part and nothing else. The coordinator reads those rows and writes the
//! result inside one transaction, so calling it again without intervening
//! writes produces the same aggregate.

use sf_core::{AttemptStatus, BatchStatus};

/// Latest publish state of one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartState {
    /// 1-based part index.
    pub index: u32,
    /// Status of the part's latest attempt, `None` before the first one.
    pub latest: Option<AttemptStatus>,
}

impl PartState {
    fn succeeded(&self) -> bool {
        self.latest == Some(AttemptStatus::Success)
    }

    fn manual(&self) -> bool {
        self.latest == Some(AttemptStatus::ManualRequired)
    }

    fn failed(&self) -> bool {
        matches!(
            self.latest,
            Some(AttemptStatus::Failed | AttemptStatus::ManualRequired)
        )
    }

    fn settled(&self) -> bool {
        self.latest.is_some_and(|s| s.is_terminal())
    }
}

/// Derived aggregate for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub status: BatchStatus,
    pub completed: u32,
    /// Sorted indices of parts whose latest attempt is failed or
    /// manual_required.
    pub failed_indices: Vec<u32>,
}

/// Derive the aggregate of a batch of `total` parts.
///
/// `completed` if every part succeeded, `failed` if every part is in manual
/// intervention, `partial` if some but not all succeeded, `processing`
/// otherwise.
pub fn derive_batch(total: u32, parts: &[PartState]) -> BatchSummary {
    let completed = parts.iter().filter(|p| p.succeeded()).count() as u32;
    let manual = parts.iter().filter(|p| p.manual()).count() as u32;

    let mut failed_indices: Vec<u32> =
        parts.iter().filter(|p| p.failed()).map(|p| p.index).collect();
    failed_indices.sort_unstable();
    failed_indices.dedup();

    let status = if total > 0 && completed == total {
        BatchStatus::Completed
    } else if total > 0 && manual == total {
        BatchStatus::Failed
    } else if completed > 0 {
        BatchStatus::Partial
    } else {
        BatchStatus::Processing
    };

    BatchSummary {
        status,
        completed,
        failed_indices,
    }
}

/// What the part outcomes mean for the owning source item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// At least one part is still pending, publishing, or awaiting a retry.
    InFlight,
    /// Every part is published.
    Completed,
    /// Every part ended in manual intervention.
    Failed,
    /// Every part is settled, some published and some in manual
    /// intervention. The item stays `uploading` for an operator.
    NeedsAttention,
}

/// Fan-in decision for an item with `total` parts.
///
/// A single-part item is the degenerate case: its one attempt succeeding or
/// landing in manual intervention completes or fails the item directly.
pub fn item_outcome(total: u32, parts: &[PartState]) -> ItemOutcome {
    let settled = parts.iter().filter(|p| p.settled()).count() as u32;
    if total == 0 || settled < total {
        return ItemOutcome::InFlight;
    }
    let completed = parts.iter().filter(|p| p.succeeded()).count() as u32;
    if completed == total {
        ItemOutcome::Completed
    } else if completed == 0 {
        ItemOutcome::Failed
    } else {
        ItemOutcome::NeedsAttention
    }
}
