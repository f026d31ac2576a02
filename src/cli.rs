use clap::{Parser, Subcommand};
use sf_core::{PublishAttemptId, SourceItemId};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "storyforge")]
#[command(author, version, about = "Turns written stories into published short-form video")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run stage workers until interrupted
    Work {
        /// Process every task that is due, then exit
        #[arg(long)]
        once: bool,
    },

    /// Fetch new items from the configured sources
    Fetch,

    /// Approve a pending item for production
    Approve {
        /// Source item ID
        id: SourceItemId,
    },

    /// Reject a pending item
    Reject {
        /// Source item ID
        id: SourceItemId,

        /// Why the item was rejected
        #[arg(long)]
        reason: Option<String>,
    },

    /// Restart a failed item from the script stage
    Retry {
        /// Source item ID
        id: SourceItemId,
    },

    /// Publish a part again after manual intervention
    Republish {
        /// ID of the publish attempt that needs manual intervention
        attempt_id: PublishAttemptId,
    },

    /// Show pipeline counts and everything waiting on an operator
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one item with its parts, attempts, batch and runs
    Show {
        /// Source item ID
        id: SourceItemId,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses --config if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}
