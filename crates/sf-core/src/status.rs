//! Pipeline status enums for source items, publish attempts, batches, runs,
//! and queued stage tasks.
//!
//! Every enum serializes in snake_case and round-trips through the exact
//! string stored in the database `status` column via `as_str` / `FromStr`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Generate `as_str`, `Display`, and `FromStr` for a fieldless status enum.
macro_rules! status_strings {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The string stored in the database for this value.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(Error::Validation(format!(
                        concat!("unknown ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// One step of the linear per-item pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Script,
    Audio,
    Video,
    Upload,
}

status_strings!(Stage {
    Script => "script",
    Audio => "audio",
    Video => "video",
    Upload => "upload",
});

impl Stage {
    /// The item status that means "this stage is in progress".
    pub fn working_status(&self) -> ItemStatus {
        match self {
            Self::Script => ItemStatus::Scripting,
            Self::Audio => ItemStatus::GeneratingAudio,
            Self::Video => ItemStatus::RenderingVideo,
            Self::Upload => ItemStatus::Uploading,
        }
    }

    /// The item status reached once this stage succeeds.
    pub fn success_status(&self) -> ItemStatus {
        match self {
            Self::Script => ItemStatus::GeneratingAudio,
            Self::Audio => ItemStatus::RenderingVideo,
            Self::Video => ItemStatus::Uploading,
            Self::Upload => ItemStatus::Completed,
        }
    }
}

// ---------------------------------------------------------------------------
// ItemStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a source item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Approved,
    Rejected,
    Scripting,
    GeneratingAudio,
    RenderingVideo,
    Uploading,
    Completed,
    Failed,
}

status_strings!(ItemStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    Scripting => "scripting",
    GeneratingAudio => "generating_audio",
    RenderingVideo => "rendering_video",
    Uploading => "uploading",
    Completed => "completed",
    Failed => "failed",
});

impl ItemStatus {
    /// The stage currently running, if the item is mid-pipeline.
    pub fn active_stage(&self) -> Option<Stage> {
        match self {
            Self::Scripting => Some(Stage::Script),
            Self::GeneratingAudio => Some(Stage::Audio),
            Self::RenderingVideo => Some(Stage::Video),
            Self::Uploading => Some(Stage::Upload),
            _ => None,
        }
    }

    /// No automated transition leaves a terminal status.
    ///
    /// `Failed` is terminal for automation; only an operator can re-approve.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Completed | Self::Failed)
    }
}

// ---------------------------------------------------------------------------
// AttemptStatus
// ---------------------------------------------------------------------------

/// Lifecycle of one publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Publishing,
    Success,
    Failed,
    ManualRequired,
}

status_strings!(AttemptStatus {
    Pending => "pending",
    Publishing => "publishing",
    Success => "success",
    Failed => "failed",
    ManualRequired => "manual_required",
});

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::ManualRequired)
    }
}

// ---------------------------------------------------------------------------
// BatchStatus
// ---------------------------------------------------------------------------

/// Aggregate status over all parts of a multi-part source item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Processing,
    Partial,
    Completed,
    Failed,
}

status_strings!(BatchStatus {
    Processing => "processing",
    Partial => "partial",
    Completed => "completed",
    Failed => "failed",
});

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Status of a pipeline run audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

status_strings!(RunStatus {
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

// ---------------------------------------------------------------------------
// Task queue
// ---------------------------------------------------------------------------

/// What a queued stage task asks a worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Script,
    Narrate,
    Render,
    Publish,
}

status_strings!(TaskKind {
    Script => "script",
    Narrate => "narrate",
    Render => "render",
    Publish => "publish",
});

impl TaskKind {
    /// The pipeline stage this task advances.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Script => Stage::Script,
            Self::Narrate => Stage::Audio,
            Self::Render => Stage::Video,
            Self::Publish => Stage::Upload,
        }
    }
}

/// Queue state of a stage task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    Dead,
}

status_strings!(TaskStatus {
    Queued => "queued",
    Running => "running",
    Done => "done",
    Dead => "dead",
});
