//! The voratiq error taxonomy (§7).
//!
//! Each subsystem gets its own enum so callers can match on specific failure
//! modes. [`VoratiqError`] wraps all of them for the single headline +
//! hint-lines presentation the CLI shows on exit code 1. Messages are
//! written to be actionable without additional context.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Configuration-layer errors: malformed or missing `.voratiq/*.yaml`,
/// unknown providers, duplicate agent ids, missing model placeholders.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required config file was missing or unreadable.
    #[error("could not read {path}: {detail}")]
    Unreadable {
        /// Path to the config file.
        path: PathBuf,
        /// Underlying I/O or parse reason.
        detail: String,
    },

    /// A config file parsed but failed schema validation.
    #[error("invalid config at {path}: {detail}")]
    Invalid {
        /// Path to the config file.
        path: PathBuf,
        /// What failed validation.
        detail: String,
    },

    /// Two agents in `agents.yaml` share an id.
    #[error("duplicate agent id `{id}` in agents.yaml")]
    DuplicateAgentId {
        /// The repeated id.
        id: String,
    },

    /// An agent's argv template does not contain `MODEL_PLACEHOLDER` exactly
    /// once, or `--model` appears in its extra args.
    #[error("agent `{agent_id}` has an invalid argv template: {detail}")]
    InvalidArgvTemplate {
        /// The offending agent.
        agent_id: String,
        /// Why the template is invalid.
        detail: String,
    },

    /// A referenced provider has no known staging implementation.
    #[error("unknown provider `{provider}`")]
    UnknownProvider {
        /// The unrecognized provider tag.
        provider: String,
    },

    /// An orchestration-stage config referenced an agent id that does not
    /// exist in the catalog.
    #[error("orchestration stage `{stage}` references unknown agent `{agent_id}`")]
    UnknownStageAgent {
        /// The orchestration stage name.
        stage: String,
        /// The missing agent id.
        agent_id: String,
    },
}

/// Runtime precondition errors: missing binaries, unsupported platforms,
/// stale credentials.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The agent's configured binary path does not exist.
    #[error("agent `{agent_id}` binary not found at {}", path.display())]
    BinaryMissing {
        /// The agent id.
        agent_id: String,
        /// The configured (absolute) binary path.
        path: PathBuf,
    },

    /// The agent's configured binary exists but is not executable.
    #[error("agent `{agent_id}` binary at {} is not executable", path.display())]
    BinaryNotExecutable {
        /// The agent id.
        agent_id: String,
        /// The configured binary path.
        path: PathBuf,
    },

    /// Credential verification for a provider failed.
    #[error("credentials for provider `{provider}` are stale or missing: {detail}")]
    StaleCredentials {
        /// The provider tag.
        provider: String,
        /// Guidance hint for the operator.
        detail: String,
    },

    /// The current host does not support sandboxed execution.
    #[error("sandboxed execution is not supported on this platform: {detail}")]
    PlatformUnsupported {
        /// Why the platform is unsupported.
        detail: String,
    },

    /// Building the ephemeral sandbox HOME failed.
    #[error("failed to stage sandbox for agent `{agent_id}`: {detail}")]
    SandboxStagingFailed {
        /// The agent id.
        agent_id: String,
        /// Underlying reason.
        detail: String,
    },
}

/// Subprocess lifecycle errors: non-zero exit, watchdog trigger, hard abort.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The agent process exited non-zero without a watchdog trigger.
    #[error("agent `{agent_id}` exited with code {code:?}")]
    NonZeroExit {
        /// The agent id.
        agent_id: String,
        /// Process exit code, `None` if killed by signal.
        code: Option<i32>,
    },

    /// The watchdog terminated the process.
    #[error("watchdog triggered `{trigger}` for agent `{agent_id}`: {reason}")]
    WatchdogTriggered {
        /// The agent id.
        agent_id: String,
        /// Which trigger fired.
        trigger: String,
        /// Human-readable reason.
        reason: String,
    },

    /// The process did not exit within the hard-abort grace period after
    /// `SIGKILL`.
    #[error("agent `{agent_id}` did not exit after SIGKILL; hard-abort fired")]
    HardAbortTimeout {
        /// The agent id.
        agent_id: String,
    },
}

/// Record-store and path-layout errors (C1, C2).
#[derive(Debug, Error)]
pub enum StoreError {
    /// A record file failed to parse.
    #[error("could not parse record at {}: {reason}", path.display())]
    ParseError {
        /// Display path of the offending file.
        path: PathBuf,
        /// Underlying parse error.
        reason: String,
    },

    /// A requested session record does not exist.
    #[error("session `{session_id}` not found")]
    NotFound {
        /// The session id.
        session_id: String,
    },

    /// A mutation attempted to change a record's id, or mutate a terminal
    /// record outside the `pruned` exception.
    #[error("mutation refused for session `{session_id}`: {reason}")]
    MutationRefused {
        /// The session id.
        session_id: String,
        /// Why the mutation was refused.
        reason: String,
    },

    /// An `append` was attempted for a session that already has a record.
    #[error("session `{session_id}` already exists")]
    AlreadyExists {
        /// The session id.
        session_id: String,
    },

    /// A path segment escaped the repository root or failed validation.
    #[error("path escape or invalid segment: {detail}")]
    PathEscape {
        /// Details about the offending path.
        detail: String,
    },

    /// An I/O error occurred during a store operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Review-pipeline integrity errors (C8) — the highest-stakes error class.
#[derive(Debug, Error)]
pub enum ReviewError {
    /// No run agent has a captured diff to review.
    #[error("no eligible candidates: no run agent has a captured diff")]
    NoEligibleCandidates,

    /// Reviewer-visible text contained a real agent id or model string.
    #[error("leakage validation failed: forbidden identity token `{token}` found in {location}")]
    LeakageValidationFailed {
        /// The token that leaked.
        token: String,
        /// Where it was found (`"prompt"` or `"manifest"`).
        location: String,
    },

    /// The reviewer's output failed schema validation, referenced aliases
    /// outside the eligible set, or diverged from the in-document ranking.
    #[error("review generation failed: {detail}")]
    ReviewGenerationFailed {
        /// Details, including a stderr hint when available.
        detail: String,
    },

    /// Two reviewers in the same session observed different alias maps.
    #[error("alias map diverged for review session `{review_id}`")]
    AliasMapDivergence {
        /// The review session id.
        review_id: String,
    },
}

/// Errors raised by CLI option validation before any core operation runs.
#[derive(Debug, Error)]
pub enum UserError {
    /// An integer option was not positive.
    #[error("`{flag}` must be a positive integer, got {value}")]
    NotPositive {
        /// The flag name, e.g. `"--max-parallel"`.
        flag: String,
        /// The invalid value.
        value: i64,
    },

    /// A repeatable flag was passed the same value twice.
    #[error("`{flag}` was passed more than once with the same value `{value}`")]
    DuplicateFlag {
        /// The flag name.
        flag: String,
        /// The repeated value.
        value: String,
    },

    /// Two flags were passed that conflict with each other.
    #[error("`{a}` conflicts with `{b}`: {detail}")]
    ConflictingFlags {
        /// The first flag.
        a: String,
        /// The second flag.
        b: String,
        /// Why they conflict.
        detail: String,
    },
}

/// The top-level error type surfaced to the CLI.
///
/// `Display` renders a single headline; callers that want hint lines should
/// consult the wrapped variant's own `Display` impl, which already includes
/// them for the variants that have guidance.
#[derive(Debug, Error)]
pub enum VoratiqError {
    /// Configuration-layer error.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Runtime precondition error.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    /// Process lifecycle error.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// Record store / path layout error.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Blinded review pipeline error.
    #[error(transparent)]
    Review(#[from] ReviewError),
    /// CLI option validation error.
    #[error(transparent)]
    User(#[from] UserError),
}

/// A headline + optional hint lines, the shape the CLI renders on exit.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    /// One-line summary of what went wrong.
    pub headline: String,
    /// Additional actionable guidance, rendered as indented lines.
    pub hints: Vec<String>,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.headline)?;
        for hint in &self.hints {
            writeln!(f, "  {hint}")?;
        }
        Ok(())
    }
}

impl From<&VoratiqError> for ErrorReport {
    fn from(err: &VoratiqError) -> Self {
        Self {
            headline: err.to_string(),
            hints: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_report_renders_hints_indented() {
        let report = ErrorReport {
            headline: "something broke".to_owned(),
            hints: vec!["try this".to_owned(), "or that".to_owned()],
        };
        let rendered = report.to_string();
        assert!(rendered.starts_with("something broke\n"));
        assert!(rendered.contains("  try this\n"));
        assert!(rendered.contains("  or that\n"));
    }

    #[test]
    fn voratiq_error_wraps_config_error() {
        let config_err = ConfigError::DuplicateAgentId {
            id: "claude-fast".to_owned(),
        };
        let err: VoratiqError = config_err.into();
        assert!(err.to_string().contains("claude-fast"));
    }
}
