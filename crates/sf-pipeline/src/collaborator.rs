//! Contracts of the external collaborators the pipeline drives.
//!
//! Each collaborator is a trait the core calls with plain data and whose
//! failures come back as a [`StageError`] carrying a [`FailureKind`]. The
//! core never inspects *how* a collaborator did its work, only which kind of
//! failure it reported.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sf_core::{FailureKind, PartId, PublishAttemptId, SourceItemId};

// ---------------------------------------------------------------------------
// StageError
// ---------------------------------------------------------------------------

/// A collaborator failure, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: FailureKind,
    pub message: String,
}

impl StageError {
    /// A failure worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    /// A failure that retrying cannot fix.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Terminal,
            message: message.into(),
        }
    }

    /// The publisher needs an operator to log in again.
    pub fn auth_required(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::AuthRequired,
            message: message.into(),
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StageError {}

/// Result of one collaborator call.
pub type StageResult<T> = std::result::Result<T, StageError>;

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Parameters for one fetch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchQuery {
    pub sources: Vec<String>,
    pub limit: usize,
}

/// One candidate item returned by a fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedItem {
    pub source: String,
    pub external_id: String,
    pub title: String,
    pub body: String,
}

/// Pulls new candidate content from its sources.
///
/// Best-effort: a fetcher returns whatever it managed to collect and never
/// fails the caller.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, query: &FetchQuery) -> Vec<FetchedItem>;
}

// ---------------------------------------------------------------------------
// Enricher / splitter
// ---------------------------------------------------------------------------

/// Input to the script stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichRequest {
    pub item_id: SourceItemId,
    pub title: String,
    pub body: String,
}

/// Text payload for one part, in part order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartPayload {
    pub script: String,
}

/// Rewrites an item into narration scripts, splitting long content.
///
/// Must return at least one payload on success.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn split(&self, request: &EnrichRequest) -> StageResult<Vec<PartPayload>>;
}

// ---------------------------------------------------------------------------
// Narrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrateRequest {
    pub part_id: PartId,
    pub part_index: u32,
    pub total_parts: u32,
    pub script: String,
}

/// Reference to a synthesized audio file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioArtifact {
    pub path: String,
    pub duration_secs: f64,
}

#[async_trait]
pub trait Narrator: Send + Sync {
    async fn narrate(&self, request: &NarrateRequest) -> StageResult<AudioArtifact>;
}

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderRequest {
    pub part_id: PartId,
    pub part_index: u32,
    pub total_parts: u32,
    pub audio_path: String,
    pub audio_duration_secs: Option<f64>,
    /// Caption source: the part's script.
    pub caption: String,
}

/// Reference to a rendered video file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoArtifact {
    pub path: String,
}

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, request: &RenderRequest) -> StageResult<VideoArtifact>;
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub attempt_id: PublishAttemptId,
    pub platform: String,
    pub video_path: String,
    pub title: String,
    pub part_index: u32,
    pub total_parts: u32,
}

impl PublishRequest {
    /// Caption text, e.g. `"The Lighthouse (Part 2/3)"` for split items.
    pub fn caption(&self) -> String {
        if self.total_parts > 1 {
            format!("{} (Part {}/{})", self.title, self.part_index, self.total_parts)
        } else {
            self.title.clone()
        }
    }
}

/// Where a published video ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub platform_ref: String,
    pub platform_url: Option<String>,
}

/// Uploads a rendered part to the target platform.
///
/// A login wall must be reported as [`FailureKind::AuthRequired`] so the
/// attempt goes straight to manual intervention.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, request: &PublishRequest) -> StageResult<Publication>;
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// The full set of collaborators a worker needs.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    pub enricher: Arc<dyn Enricher>,
    pub narrator: Arc<dyn Narrator>,
    pub renderer: Arc<dyn Renderer>,
    pub publisher: Arc<dyn Publisher>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
