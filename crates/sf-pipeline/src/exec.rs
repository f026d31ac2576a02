//! Collaborators backed by an external program.
//!
//! The request is written to the program's stdin as one JSON object with an
//! `"action"` field; a successful run prints the JSON response on stdout.
//! Exit codes classify failures:
//!
//! | exit code | meaning |
//! |---|---|
//! | 0 | success, stdout holds the response |
//! | 65 | terminal failure (`EX_DATAERR`) |
//! | 77 | authentication required (`EX_NOPERM`) |
//! | anything else | transient failure |
//!
//! A program that cannot be spawned or times out is a transient failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sf_core::config::{CollaboratorsConfig, CommandConfig};

use crate::collaborator::{
    AudioArtifact, Collaborators, EnrichRequest, Enricher, FetchQuery, FetchedItem, Fetcher,
    NarrateRequest, Narrator, PartPayload, Publication, PublishRequest, Publisher, RenderRequest,
    Renderer, StageError, StageResult, VideoArtifact,
};
use crate::command::{ToolCommand, ToolOutput};

/// Exit code reporting a failure retrying cannot fix.
pub const EXIT_TERMINAL: i32 = 65;
/// Exit code reporting that the operator must re-authenticate.
pub const EXIT_AUTH_REQUIRED: i32 = 77;

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    action: &'a str,
    #[serde(flatten)]
    request: &'a T,
}

/// Runs one configured program for every call.
///
/// One instance can serve as any of the collaborator traits; the `action`
/// field tells the program which contract is being invoked.
#[derive(Debug, Clone)]
pub struct CommandCollaborator {
    name: String,
    config: CommandConfig,
}

impl CommandCollaborator {
    /// Create a collaborator named `name` (used in logs) from its config.
    pub fn new(name: impl Into<String>, config: CommandConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn command(&self, stdin: Vec<u8>) -> ToolCommand {
        let mut cmd = ToolCommand::new(self.config.program.clone());
        cmd.args(self.config.args.iter().cloned()).stdin(stdin);
        if let Some(secs) = self.config.timeout_secs {
            cmd.timeout(Duration::from_secs(secs));
        }
        cmd
    }

    /// Send `request` and parse the response, classifying any failure.
    async fn call<Req, Resp>(&self, action: &str, request: &Req) -> StageResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(&Envelope { action, request })
            .map_err(|e| StageError::terminal(format!("cannot encode {action} request: {e}")))?;

        let output = self
            .command(payload)
            .execute()
            .await
            .map_err(|e| StageError::transient(e.to_string()))?;

        tracing::debug!(
            collaborator = %self.name,
            action,
            exit_code = ?output.exit_code(),
            "Collaborator finished"
        );

        classify(action, output)
    }
}

/// Map a finished process to a typed outcome.
fn classify<Resp: DeserializeOwned>(action: &str, output: ToolOutput) -> StageResult<Resp> {
    let detail = || {
        let stderr = output.stderr.trim();
        if stderr.is_empty() {
            format!("{action} exited with status {}", output.status)
        } else {
            format!("{action} exited with status {}: {stderr}", output.status)
        }
    };

    match output.exit_code() {
        Some(0) => serde_json::from_str(output.stdout.trim()).map_err(|e| {
            StageError::terminal(format!("{action} returned an unreadable response: {e}"))
        }),
        Some(EXIT_TERMINAL) => Err(StageError::terminal(detail())),
        Some(EXIT_AUTH_REQUIRED) => Err(StageError::auth_required(detail())),
        _ => Err(StageError::transient(detail())),
    }
}

#[async_trait]
impl Fetcher for CommandCollaborator {
    async fn fetch(&self, query: &FetchQuery) -> Vec<FetchedItem> {
        match self.call::<_, Vec<FetchedItem>>("fetch", query).await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(collaborator = %self.name, error = %e, "Fetch failed; nothing ingested");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Enricher for CommandCollaborator {
    async fn split(&self, request: &EnrichRequest) -> StageResult<Vec<PartPayload>> {
        let parts: Vec<PartPayload> = self.call("script", request).await?;
        if parts.is_empty() {
            return Err(StageError::terminal("script returned no parts"));
        }
        Ok(parts)
    }
}

#[async_trait]
impl Narrator for CommandCollaborator {
    async fn narrate(&self, request: &NarrateRequest) -> StageResult<AudioArtifact> {
        self.call("narrate", request).await
    }
}

#[async_trait]
impl Renderer for CommandCollaborator {
    async fn render(&self, request: &RenderRequest) -> StageResult<VideoArtifact> {
        self.call("render", request).await
    }
}

#[async_trait]
impl Publisher for CommandCollaborator {
    async fn publish(&self, request: &PublishRequest) -> StageResult<Publication> {
        self.call("publish", request).await
    }
}

/// Fetcher used when no fetch program is configured. Always comes back empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSources;

#[async_trait]
impl Fetcher for NoSources {
    async fn fetch(&self, _query: &FetchQuery) -> Vec<FetchedItem> {
        tracing::warn!("No fetch collaborator configured; nothing to ingest");
        Vec::new()
    }
}

fn require(name: &str, config: Option<&CommandConfig>) -> sf_core::Result<CommandCollaborator> {
    config
        .map(|c| CommandCollaborator::new(name, c.clone()))
        .ok_or_else(|| {
            sf_core::Error::Validation(format!("collaborators.{name} is not configured"))
        })
}

/// The configured fetch program, or [`NoSources`] when there is none.
pub fn command_fetcher(config: &CollaboratorsConfig) -> Arc<dyn Fetcher> {
    match &config.fetch {
        Some(c) => Arc::new(CommandCollaborator::new("fetch", c.clone())),
        None => Arc::new(NoSources),
    }
}

/// Build the full collaborator set from configuration.
///
/// The four stage programs are required; fetching is optional.
pub fn command_collaborators(config: &CollaboratorsConfig) -> sf_core::Result<Collaborators> {
    Ok(Collaborators {
        fetcher: command_fetcher(config),
        enricher: Arc::new(require("script", config.script.as_ref())?),
        narrator: Arc::new(require("narrate", config.narrate.as_ref())?),
        renderer: Arc::new(require("render", config.render.as_ref())?),
        publisher: Arc::new(require("publish", config.publish.as_ref())?),
    })
}
