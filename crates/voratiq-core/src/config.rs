//! Typed schemas for `.voratiq/*.yaml` configuration files.
//!
//! Each file maps to one `deny_unknown_fields` struct, parsed with
//! `serde_yaml`. Missing optional fields fall back to documented defaults;
//! a missing file is the caller's concern (`load` surfaces it as
//! [`ConfigError::Unreadable`]), not silently defaulted, since a missing
//! `agents.yaml` usually means an uninitialized repo rather than "use
//! defaults".

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::agent::{AgentDefinition, VendorProvider};
use crate::model::ids::{AgentId, EvalSlug};

fn load_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
        path: path.to_owned(),
        detail: e.to_string(),
    })?;
    serde_yaml::from_str(&contents).map_err(|e| ConfigError::Invalid {
        path: path.to_owned(),
        detail: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// agents.yaml
// ---------------------------------------------------------------------------

/// `.voratiq/agents.yaml`: the agent catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentsConfig {
    /// All configured agents, including disabled ones.
    pub agents: Vec<AgentDefinition>,
}

impl AgentsConfig {
    /// Load and validate `agents.yaml` at `path`.
    ///
    /// # Errors
    /// Returns [`ConfigError::Unreadable`] if the file cannot be read,
    /// [`ConfigError::Invalid`] on a YAML/schema error,
    /// [`ConfigError::DuplicateAgentId`] if two entries share an id, or
    /// a wrapped [`ConfigError::InvalidArgvTemplate`] from per-agent
    /// validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id.clone()) {
                return Err(ConfigError::DuplicateAgentId {
                    id: agent.id.to_string(),
                });
            }
            agent.validate()?;
        }
        Ok(())
    }

    /// Agents with `enabled = true`, in catalog order (§3 invariant).
    pub fn enabled_agents(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents.iter().filter(|a| a.enabled)
    }

    /// Look up an enabled agent by id.
    #[must_use]
    pub fn find_enabled(&self, id: &AgentId) -> Option<&AgentDefinition> {
        self.enabled_agents().find(|a| &a.id == id)
    }
}

// ---------------------------------------------------------------------------
// evals.yaml
// ---------------------------------------------------------------------------

/// One configured evaluation command, run against an agent's workspace
/// after it completes (§4.7 step 4).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvalDefinition {
    /// The eval's catalog slug.
    pub slug: EvalSlug,
    /// The command to execute.
    pub command: String,
    /// Arguments passed to `command`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Timeout before the eval command is killed.
    #[serde(default = "default_eval_timeout_seconds")]
    pub timeout_seconds: u32,
}

const fn default_eval_timeout_seconds() -> u32 {
    300
}

/// `.voratiq/evals.yaml`: the evaluation catalog.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvalsConfig {
    /// Evaluation commands, run in order after an agent completes.
    #[serde(default)]
    pub evals: Vec<EvalDefinition>,
}

impl EvalsConfig {
    /// Load `evals.yaml` at `path`. Absence of the file is a caller
    /// responsibility; an empty `evals: []` is an explicit "no evals"
    /// configuration.
    ///
    /// # Errors
    /// Returns [`ConfigError::Unreadable`] or [`ConfigError::Invalid`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_yaml(path)
    }
}

// ---------------------------------------------------------------------------
// environment.yaml
// ---------------------------------------------------------------------------

/// `.voratiq/environment.yaml`: environment overlay applied on top of the
/// launcher's minimal shell environment before auth staging's
/// provider-specific overrides (§4.4).
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Extra environment variables to set for every agent invocation.
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
    /// Extra `PATH` entries, prepended in order.
    #[serde(default)]
    pub path_entries: Vec<String>,
}

impl EnvironmentConfig {
    /// Load `environment.yaml` at `path`.
    ///
    /// # Errors
    /// Returns [`ConfigError::Unreadable`] or [`ConfigError::Invalid`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_yaml(path)
    }
}

// ---------------------------------------------------------------------------
// orchestration.yaml
// ---------------------------------------------------------------------------

/// Which agents participate in one orchestration stage (run or review).
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Agent ids eligible for this stage, in configured order.
    pub agents: Vec<AgentId>,
}

/// `.voratiq/orchestration.yaml`: which agents compete in runs, which
/// review them, and how much parallelism the competition engine is
/// allowed (§4.6, §5).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestrationConfig {
    /// Maximum concurrently executing candidates per competition.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Agents that compete in a run.
    #[serde(default)]
    pub run: StageConfig,
    /// Agents that review a completed run.
    #[serde(default)]
    pub review: StageConfig,
}

const fn default_max_parallel() -> usize {
    4
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            run: StageConfig::default(),
            review: StageConfig::default(),
        }
    }
}

impl OrchestrationConfig {
    /// Load `orchestration.yaml` at `path`.
    ///
    /// # Errors
    /// Returns [`ConfigError::Unreadable`] or [`ConfigError::Invalid`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_yaml(path)
    }

    /// Verify every agent id referenced by `run`/`review` stages exists in
    /// `agents`.
    ///
    /// # Errors
    /// Returns [`ConfigError::UnknownStageAgent`] for the first dangling
    /// reference found.
    pub fn validate_against(&self, agents: &AgentsConfig) -> Result<(), ConfigError> {
        for (stage, config) in [("run", &self.run), ("review", &self.review)] {
            for agent_id in &config.agents {
                if agents.find_enabled(agent_id).is_none() {
                    return Err(ConfigError::UnknownStageAgent {
                        stage: stage.to_owned(),
                        agent_id: agent_id.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// sandbox.yaml
// ---------------------------------------------------------------------------

/// `.voratiq/sandbox.yaml`: watchdog timing constants and per-provider
/// fatal-pattern regexes (§4.5). All fields default to the constants named
/// in the component design.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    /// Silence timeout in seconds (default 900 = 15 minutes).
    #[serde(default = "default_silence_timeout_seconds")]
    pub silence_timeout_seconds: u64,
    /// Wall-clock cap in seconds (default 7200 = 120 minutes).
    #[serde(default = "default_wall_clock_cap_seconds")]
    pub wall_clock_cap_seconds: u64,
    /// Fatal-pattern retry window in seconds (default 60).
    #[serde(default = "default_fatal_pattern_window_seconds")]
    pub fatal_pattern_window_seconds: u64,
    /// Sandbox-denial second-hit window in seconds (default 30).
    #[serde(default = "default_denial_warn_window_seconds")]
    pub denial_warn_window_seconds: u64,
    /// Sandbox-denial counter reset window in seconds (default 120).
    #[serde(default = "default_denial_reset_window_seconds")]
    pub denial_reset_window_seconds: u64,
    /// `SIGSTOP`/`SIGCONT` delay in milliseconds on the third denial hit
    /// (default 300ms).
    #[serde(default = "default_denial_stop_delay_ms")]
    pub denial_stop_delay_ms: u64,
    /// `SIGTERM` -> `SIGKILL` grace period in seconds (default 5).
    #[serde(default = "default_term_grace_seconds")]
    pub term_grace_seconds: u64,
    /// `SIGKILL` -> hard-abort timeout in seconds (default 10).
    #[serde(default = "default_hard_abort_seconds")]
    pub hard_abort_seconds: u64,
    /// Per-provider fatal-pattern regexes (auth/quota/panic strings).
    #[serde(default)]
    pub fatal_patterns: BTreeMap<VendorProvider, Vec<String>>,
}

const fn default_silence_timeout_seconds() -> u64 {
    15 * 60
}

const fn default_wall_clock_cap_seconds() -> u64 {
    120 * 60
}

const fn default_fatal_pattern_window_seconds() -> u64 {
    60
}

const fn default_denial_warn_window_seconds() -> u64 {
    30
}

const fn default_denial_reset_window_seconds() -> u64 {
    120
}

const fn default_denial_stop_delay_ms() -> u64 {
    300
}

const fn default_term_grace_seconds() -> u64 {
    5
}

const fn default_hard_abort_seconds() -> u64 {
    10
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            silence_timeout_seconds: default_silence_timeout_seconds(),
            wall_clock_cap_seconds: default_wall_clock_cap_seconds(),
            fatal_pattern_window_seconds: default_fatal_pattern_window_seconds(),
            denial_warn_window_seconds: default_denial_warn_window_seconds(),
            denial_reset_window_seconds: default_denial_reset_window_seconds(),
            denial_stop_delay_ms: default_denial_stop_delay_ms(),
            term_grace_seconds: default_term_grace_seconds(),
            hard_abort_seconds: default_hard_abort_seconds(),
            fatal_patterns: BTreeMap::new(),
        }
    }
}

impl SandboxConfig {
    /// Load `sandbox.yaml` at `path`.
    ///
    /// # Errors
    /// Returns [`ConfigError::Unreadable`] or [`ConfigError::Invalid`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_yaml(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_temp(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn agents_config_rejects_duplicate_ids() {
        let yaml = r#"
agents:
  - id: claude-fast
    provider: anthropic
    model: claude-opus-4
    binary: /usr/local/bin/claude
    argv_template: ["--model", "MODEL_PLACEHOLDER"]
  - id: claude-fast
    provider: anthropic
    model: claude-haiku-4
    binary: /usr/local/bin/claude
    argv_template: ["--model", "MODEL_PLACEHOLDER"]
"#;
        let (_dir, path) = write_temp(yaml);
        let err = AgentsConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateAgentId { .. }));
    }

    #[test]
    fn agents_config_enabled_agents_excludes_disabled() {
        let yaml = r#"
agents:
  - id: claude-fast
    provider: anthropic
    model: claude-opus-4
    binary: /usr/local/bin/claude
    argv_template: ["--model", "MODEL_PLACEHOLDER"]
    enabled: false
  - id: gpt-5-codex
    provider: openai
    model: gpt-5-codex
    binary: /usr/local/bin/codex
    argv_template: ["--model", "MODEL_PLACEHOLDER"]
"#;
        let (_dir, path) = write_temp(yaml);
        let config = AgentsConfig::load(&path).unwrap();
        let enabled: Vec<_> = config.enabled_agents().collect();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id.to_string(), "gpt-5-codex");
    }

    #[test]
    fn agents_config_rejects_unknown_field() {
        let yaml = "agents: []\nbogus: true\n";
        let (_dir, path) = write_temp(yaml);
        assert!(AgentsConfig::load(&path).is_err());
    }

    #[test]
    fn evals_config_defaults_timeout() {
        let yaml = r#"
evals:
  - slug: unit-tests
    command: cargo
    args: ["test"]
"#;
        let (_dir, path) = write_temp(yaml);
        let config = EvalsConfig::load(&path).unwrap();
        assert_eq!(config.evals[0].timeout_seconds, 300);
    }

    #[test]
    fn orchestration_config_validate_against_rejects_unknown_agent() {
        let agents = AgentsConfig { agents: vec![] };
        let orchestration = OrchestrationConfig {
            max_parallel: 4,
            run: StageConfig {
                agents: vec![AgentId::new("ghost").unwrap()],
            },
            review: StageConfig::default(),
        };
        let err = orchestration.validate_against(&agents).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownStageAgent { .. }));
    }

    #[test]
    fn sandbox_config_defaults_match_spec_constants() {
        let config = SandboxConfig::default();
        assert_eq!(config.silence_timeout_seconds, 900);
        assert_eq!(config.wall_clock_cap_seconds, 7200);
        assert_eq!(config.fatal_pattern_window_seconds, 60);
        assert_eq!(config.denial_warn_window_seconds, 30);
        assert_eq!(config.denial_reset_window_seconds, 120);
    }

    #[test]
    fn load_missing_file_is_unreadable() {
        let err = AgentsConfig::load(Path::new("/nonexistent/agents.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Unreadable { .. }));
    }
}
