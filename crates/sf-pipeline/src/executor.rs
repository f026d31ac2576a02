//! Stage executor: runs one collaborator call for one entity and reports
//! the outcome as a state machine event.
//!
//! The executor is stateless and never touches the store. A call that
//! outlives the supervisory timeout is reported as a transient failure, and
//! a cancelled call produces no report at all so the task can be handed out
//! again.

use std::time::{Duration, Instant};

use sf_core::{Event, FailureKind, Stage};
use tokio_util::sync::CancellationToken;

use crate::collaborator::{
    AudioArtifact, Collaborators, EnrichRequest, NarrateRequest, PartPayload, Publication,
    PublishRequest, RenderRequest, StageError, StageResult, VideoArtifact,
};

/// One unit of collaborator work.
#[derive(Debug, Clone)]
pub enum StageRequest {
    Script(EnrichRequest),
    Narrate(NarrateRequest),
    Render(RenderRequest),
    Publish(PublishRequest),
}

impl StageRequest {
    /// The pipeline stage this request belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Script(_) => Stage::Script,
            Self::Narrate(_) => Stage::Audio,
            Self::Render(_) => Stage::Video,
            Self::Publish(_) => Stage::Upload,
        }
    }
}

/// The artifact a successful call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Parts(Vec<PartPayload>),
    Audio(AudioArtifact),
    Video(VideoArtifact),
    Published(Publication),
}

/// Outcome of one executed request.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub outcome: StageResult<StageOutput>,
    pub elapsed: Duration,
}

impl StageReport {
    /// The state machine event this outcome represents.
    ///
    /// Upload outcomes are publish-attempt events; all other stages report
    /// against the source item.
    pub fn event(&self) -> Event {
        match (&self.outcome, self.stage) {
            (Ok(StageOutput::Published(p)), _) => Event::PublishSucceeded {
                platform_ref: p.platform_ref.clone(),
                platform_url: p.platform_url.clone(),
            },
            (Ok(_), stage) => Event::StageSucceeded { stage },
            (Err(e), Stage::Upload) => Event::PublishFailed {
                error: e.message.clone(),
                kind: e.kind,
            },
            (Err(e), stage) => Event::StageFailed {
                stage,
                error: e.message.clone(),
            },
        }
    }

    /// The failure classification, if the call failed.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.outcome.as_ref().err().map(|e| e.kind)
    }
}

/// Dispatches requests to the configured collaborators.
#[derive(Debug, Clone)]
pub struct StageExecutor {
    collaborators: Collaborators,
    timeout: Option<Duration>,
}

impl StageExecutor {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            timeout: None,
        }
    }

    /// Builder: convert calls running longer than `timeout` into transient
    /// failures.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Run one request. Returns `None` if `cancel` fired first.
    pub async fn run(
        &self,
        request: StageRequest,
        cancel: &CancellationToken,
    ) -> Option<StageReport> {
        let stage = request.stage();
        let started = Instant::now();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(stage = %stage, "Stage call cancelled");
                return None;
            }
            outcome = self.call_with_timeout(&request) => outcome,
        };

        let elapsed = started.elapsed();
        match &outcome {
            Ok(_) => tracing::debug!(stage = %stage, ?elapsed, "Stage call succeeded"),
            Err(e) => tracing::info!(stage = %stage, kind = %e.kind, error = %e.message, "Stage call failed"),
        }

        Some(StageReport {
            stage,
            outcome,
            elapsed,
        })
    }

    async fn call_with_timeout(&self, request: &StageRequest) -> StageResult<StageOutput> {
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.call(request)).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => Err(StageError::transient(format!(
                    "{} stage stalled for more than {limit:?}",
                    request.stage()
                ))),
            },
            None => self.call(request).await,
        }
    }

    async fn call(&self, request: &StageRequest) -> StageResult<StageOutput> {
        let c = &self.collaborators;
        match request {
            StageRequest::Script(r) => {
                let parts = c.enricher.split(r).await?;
                if parts.is_empty() {
                    return Err(StageError::terminal("enricher returned no parts"));
                }
                Ok(StageOutput::Parts(parts))
            }
            StageRequest::Narrate(r) => c.narrator.narrate(r).await.map(StageOutput::Audio),
            StageRequest::Render(r) => c.renderer.render(r).await.map(StageOutput::Video),
            StageRequest::Publish(r) => c.publisher.publish(r).await.map(StageOutput::Published),
        }
    }
}
