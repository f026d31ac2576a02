//! # sf-pipeline
//!
//! Everything between the entity store and the outside world.
//!
//! This crate provides:
//!
//! - **Collaborator traits** ([`collaborator`]) -- the narrow contracts of
//!   the fetcher, enricher/splitter, narrator, renderer, and publisher, with
//!   typed [`StageError`] failures instead of errors.
//! - **[`StageExecutor`]** -- a stateless adapter that runs one collaborator
//!   call under a supervisory timeout and turns its outcome into a state
//!   machine [`Event`](sf_core::Event).
//! - **Command-backed collaborators** ([`exec`]) -- JSON over stdin/stdout to
//!   any external program, built on [`ToolCommand`].
//! - **[`RetryPolicy`]** -- the single retry/escalation decision used for
//!   every kind of failure.
//! - **Batch derivation** ([`aggregate`]) -- the pure function from part
//!   outcomes to aggregate batch and item status.

pub mod aggregate;
pub mod collaborator;
pub mod command;
pub mod exec;
pub mod executor;
pub mod retry;

// Re-export key types at the crate root.
pub use aggregate::{derive_batch, item_outcome, BatchSummary, ItemOutcome, PartState};
pub use collaborator::{
    AudioArtifact, Collaborators, EnrichRequest, Enricher, FetchQuery, FetchedItem, Fetcher,
    NarrateRequest, Narrator, PartPayload, Publication, PublishRequest, Publisher, RenderRequest,
    Renderer, StageError, StageResult, VideoArtifact,
};
pub use command::{ToolCommand, ToolOutput};
pub use exec::{command_collaborators, command_fetcher, CommandCollaborator, NoSources};
pub use executor::{StageExecutor, StageOutput, StageReport, StageRequest};
pub use retry::{Backoff, Decision, RetryPolicy};
