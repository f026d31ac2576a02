//! Unified error type for the storyforge application.
//!
//! All crates funnel their failures into [`Error`]. Collaborator failures
//! (a narrator that times out, a publisher that wants a fresh login) are
//! *not* errors here: they are typed stage outcomes recorded in the store.
//! What remains are conditions the caller has to act on, most importantly
//! [`Error::IllegalTransition`] (drop the duplicate event) and
//! [`Error::StoreUnavailable`] (the event was not applied; redeliver it).

use std::fmt;

/// Unified error type covering all failure modes in storyforge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "source_item", "part").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// The action is disabled by configuration or operator policy.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Input data or configuration failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A conflicting resource already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// An event does not apply to the entity's current status.
    ///
    /// Raised for duplicate and out-of-order deliveries. Never retried.
    #[error("Illegal transition for {entity}: {event} from {from}")]
    IllegalTransition {
        /// The kind of entity (e.g. "source_item", "publish_attempt").
        entity: String,
        /// The status the entity was in when the event arrived.
        from: String,
        /// The rejected event.
        event: String,
    },

    /// The store could not be reached: busy, locked, or no connection.
    ///
    /// Nothing was applied, so the work can be redelivered as is.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A database operation failed and would fail again if repeated.
    #[error("Database error: {source}")]
    Database {
        /// The underlying database error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// An external command could not be run or produced unusable output.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the program that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// A pipeline stage could not be set up.
    #[error("Stage error [{stage}]: {message}")]
    Stage {
        /// The stage that failed.
        stage: String,
        /// Human-readable error description.
        message: String,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the authoritative store could not be reached or written.
    ///
    /// When this is true the triggering event must be treated as not yet
    /// processed and left for queue-level redelivery.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }

    /// Whether this error is a rejected (duplicate or out-of-order) event.
    pub fn is_illegal_transition(&self) -> bool {
        matches!(self, Error::IllegalTransition { .. })
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::IllegalTransition`].
    pub fn illegal(
        entity: impl Into<String>,
        from: impl fmt::Display,
        event: impl fmt::Display,
    ) -> Self {
        Error::IllegalTransition {
            entity: entity.into(),
            from: from.to_string(),
            event: event.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Stage`].
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = Error::not_found("source_item", "abc-123");
        assert_eq!(err.to_string(), "source_item not found: abc-123");
        assert!(!err.is_store_unavailable());
    }

    #[test]
    fn forbidden_display() {
        let err = Error::Forbidden("re-approval disabled".into());
        assert_eq!(err.to_string(), "Forbidden: re-approval disabled");
    }

    #[test]
    fn validation_display() {
        let err = Error::Validation("body is empty".into());
        assert_eq!(err.to_string(), "Validation error: body is empty");
    }

    #[test]
    fn illegal_transition_display() {
        let err = Error::illegal("source_item", "generating_audio", "stage_succeeded(script)");
        assert_eq!(
            err.to_string(),
            "Illegal transition for source_item: stage_succeeded(script) from generating_audio"
        );
        assert!(err.is_illegal_transition());
        assert!(!err.is_store_unavailable());
    }

    #[test]
    fn only_store_unavailable_is_redeliverable() {
        let err = Error::StoreUnavailable("database is locked".into());
        assert_eq!(err.to_string(), "Store unavailable: database is locked");
        assert!(err.is_store_unavailable());
        assert!(!err.is_illegal_transition());

        let err = Error::database("UNIQUE constraint failed: parts.id");
        assert!(!err.is_store_unavailable());
    }

    #[test]
    fn io_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn tool_display() {
        let err = Error::tool("narrate.sh", "exit code 1");
        assert_eq!(err.to_string(), "Tool error [narrate.sh]: exit code 1");
    }

    #[test]
    fn stage_display() {
        let err = Error::stage("audio", "no narrator configured");
        assert_eq!(err.to_string(), "Stage error [audio]: no narrator configured");
    }

    #[test]
    fn result_alias() {
        fn ok_fn() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(ok_fn().unwrap(), 42);

        fn err_fn() -> Result<i32> {
            Err(Error::Internal("boom".into()))
        }
        assert!(err_fn().is_err());
    }
}
