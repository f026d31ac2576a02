//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs for the database, workers, retry policies, collaborators, etc.
//! Every section defaults sensibly so a completely empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    /// Retry policy for transient script / narrate / render failures.
    pub retry: RetryConfig,
    pub publish: PublishConfig,
    pub fetch: FetchConfig,
    pub review: ReviewConfig,
    pub artifacts: ArtifactConfig,
    pub collaborators: CollaboratorsConfig,
    pub notifications: NotificationConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    ///
    /// This is intentionally string-based so the caller can read the file
    /// however it sees fit (async, embedded, etc.).
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Load configuration strictly: a missing path yields defaults, but an
    /// unreadable or malformed file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(p) if !p.exists() => Ok(Self::default()),
            Some(p) => Self::from_json(&std::fs::read_to_string(p)?),
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.database.pool_size == 0 {
            warnings.push("database.pool_size is 0; at least 1 connection is required".into());
        }

        if self.worker.concurrency == 0 {
            warnings.push("worker.concurrency is 0; no tasks will be processed".into());
        }

        if self.worker.stale_task_secs <= self.worker.stage_timeout_secs.unwrap_or(0) {
            warnings.push(
                "worker.stale_task_secs should exceed worker.stage_timeout_secs or running tasks \
                 may be redelivered while still in flight"
                    .into(),
            );
        }

        for (name, policy) in [("retry", &self.retry), ("publish.retry", &self.publish.retry)] {
            if policy.max_retries == 0 {
                warnings.push(format!(
                    "{name}.max_retries is 0; the first failure escalates immediately"
                ));
            }
            if policy.max_delay_secs < policy.base_delay_secs {
                warnings.push(format!(
                    "{name}.max_delay_secs ({}) is below base_delay_secs ({})",
                    policy.max_delay_secs, policy.base_delay_secs
                ));
            }
        }

        if self.publish.daily_limit == Some(0) {
            warnings.push("publish.daily_limit is 0; nothing will ever be published".into());
        }

        if self.fetch.min_chars > self.fetch.max_chars {
            warnings.push(format!(
                "fetch.min_chars ({}) exceeds fetch.max_chars ({})",
                self.fetch.min_chars, self.fetch.max_chars
            ));
        }

        for (stage, cmd) in self.collaborators.iter() {
            match cmd {
                None => warnings.push(format!("collaborators.{stage} is not configured")),
                Some(c) if c.program.as_os_str().is_empty() => {
                    warnings.push(format!("collaborators.{stage}.program is empty"));
                }
                Some(_) => {}
            }
        }

        if self.notifications.enabled && self.notifications.webhook_url.is_none() {
            warnings.push("notifications are enabled but no webhook_url is set".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// SQLite entity store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub pool_size: u32,
    /// How long a writer waits on a locked database before giving up.
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/storyforge.db"),
            pool_size: 8,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Worker loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent worker loops in this process.
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    /// Supervisory timeout converting a stalled collaborator call into a
    /// transient failure. `None` waits forever.
    pub stage_timeout_secs: Option<u64>,
    /// Running tasks locked for longer than this are returned to the queue.
    pub stale_task_secs: u64,
    /// Prefix for the lock owner recorded on claimed tasks.
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval_ms: 2_000,
            stage_timeout_secs: Some(900),
            stale_task_secs: 3_600,
            worker_id: "sf-worker".into(),
        }
    }
}

/// Delay schedule between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Retry budget and delay schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff: BackoffKind,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffKind::Exponential,
            base_delay_secs: 30,
            max_delay_secs: 600,
        }
    }
}

/// Publishing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Platform identifier recorded on every publish attempt.
    pub platform: String,
    pub retry: RetryConfig,
    /// Maximum publish calls per UTC day. `None` disables the quota.
    pub daily_limit: Option<u32>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            platform: "tiktok".into(),
            retry: RetryConfig {
                max_retries: 3,
                backoff: BackoffKind::Exponential,
                base_delay_secs: 120,
                max_delay_secs: 600,
            },
            daily_limit: Some(10),
        }
    }
}

/// Ingest settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Source names passed to the fetcher (e.g. subreddits).
    pub sources: Vec<String>,
    /// Maximum items requested per source.
    pub limit: u32,
    pub min_chars: u32,
    pub max_chars: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            sources: vec!["nosleep".into(), "shortscarystories".into()],
            limit: 10,
            min_chars: 500,
            max_chars: 15_000,
        }
    }
}

/// Human review settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Allow an operator to re-approve a failed item, restarting it from
    /// the script stage.
    pub allow_reapprove_failed: bool,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            allow_reapprove_failed: true,
        }
    }
}

/// What happens to rendered files once a part needs manual publishing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Keep audio and video so an operator can download them.
    #[default]
    Keep,
    /// Delete audio and video files from disk.
    Purge,
}

/// Artifact retention settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub on_manual_required: RetentionPolicy,
}

/// An external program implementing one collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Hard limit enforced on the child process.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Programs backing each external collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorsConfig {
    pub fetch: Option<CommandConfig>,
    pub script: Option<CommandConfig>,
    pub narrate: Option<CommandConfig>,
    pub render: Option<CommandConfig>,
    pub publish: Option<CommandConfig>,
}

impl CollaboratorsConfig {
    /// Iterate `(name, command)` pairs in pipeline order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, Option<&CommandConfig>)> {
        [
            ("fetch", self.fetch.as_ref()),
            ("script", self.script.as_ref()),
            ("narrate", self.narrate.as_ref()),
            ("render", self.render.as_ref()),
            ("publish", self.publish.as_ref()),
        ]
        .into_iter()
    }
}

/// Operator notification settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> Config {
        let cmd = CommandConfig {
            program: PathBuf::from("/usr/local/bin/stage"),
            args: vec![],
            timeout_secs: None,
        };
        let mut cfg = Config::default();
        cfg.collaborators = CollaboratorsConfig {
            fetch: Some(cmd.clone()),
            script: Some(cmd.clone()),
            narrate: Some(cmd.clone()),
            render: Some(cmd.clone()),
            publish: Some(cmd),
        };
        cfg
    }

    #[test]
    fn default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.database.path, PathBuf::from("./data/storyforge.db"));
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.publish.retry.max_retries, 3);
        assert_eq!(cfg.publish.platform, "tiktok");
        assert_eq!(cfg.publish.daily_limit, Some(10));
        assert!(cfg.review.allow_reapprove_failed);
        assert_eq!(cfg.artifacts.on_manual_required, RetentionPolicy::Keep);
    }

    #[test]
    fn fully_configured_has_no_warnings() {
        let warnings = configured().validate();
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
    }

    #[test]
    fn missing_collaborators_warn() {
        let warnings = Config::default().validate();
        assert!(warnings.iter().any(|w| w.contains("collaborators.publish")));
    }

    #[test]
    fn zero_retries_warns() {
        let mut cfg = configured();
        cfg.publish.retry.max_retries = 0;
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.starts_with("publish.retry.max_retries")));
    }

    #[test]
    fn inverted_char_bounds_warn() {
        let mut cfg = configured();
        cfg.fetch.min_chars = 20_000;
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.contains("fetch.min_chars")));
    }

    #[test]
    fn webhook_enabled_without_url_warns() {
        let mut cfg = configured();
        cfg.notifications.enabled = true;
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.contains("webhook_url")));
    }

    #[test]
    fn parse_json_config() {
        let json = r#"{
            "publish": {"daily_limit": null, "retry": {"max_retries": 5, "backoff": "fixed"}},
            "artifacts": {"on_manual_required": "purge"},
            "collaborators": {"narrate": {"program": "/bin/tts", "args": ["--voice", "f1"]}}
        }"#;
        let cfg = Config::from_json(json).unwrap();
        assert_eq!(cfg.publish.daily_limit, None);
        assert_eq!(cfg.publish.retry.max_retries, 5);
        assert_eq!(cfg.publish.retry.backoff, BackoffKind::Fixed);
        assert_eq!(cfg.artifacts.on_manual_required, RetentionPolicy::Purge);
        let narrate = cfg.collaborators.narrate.unwrap();
        assert_eq!(narrate.args, vec!["--voice", "f1"]);
    }

    #[test]
    fn parse_empty_json_uses_defaults() {
        let cfg = Config::from_json("{}").unwrap();
        assert_eq!(cfg.worker.concurrency, 2);
        assert_eq!(cfg.fetch.min_chars, 500);
    }

    #[test]
    fn parse_invalid_json_is_validation_error() {
        let err = Config::from_json("{not json").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn load_or_default_with_missing_file() {
        let cfg = Config::load_or_default(Some(Path::new("/nonexistent/config.json")));
        assert_eq!(cfg.worker.concurrency, 2);
    }

    #[test]
    fn load_strict_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "[1, 2").unwrap();
        assert!(Config::load(Some(&path)).is_err());
        assert!(Config::load(Some(&dir.path().join("absent.json"))).is_ok());
    }
}
