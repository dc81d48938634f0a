//! Agent catalog entries (§2, §4.1).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::ids::AgentId;

/// The placeholder an agent's argv template must contain exactly once.
pub const MODEL_PLACEHOLDER: &str = "MODEL_PLACEHOLDER";

/// The vendor-specific credential and sandbox-staging family an agent
/// belongs to. Unknown providers are rejected at config load time
/// ([`ConfigError::UnknownProvider`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VendorProvider {
    /// Anthropic Claude family.
    Anthropic,
    /// OpenAI family.
    Openai,
    /// Google Gemini family.
    Google,
    /// A provider with no credential staging of its own (local/offline
    /// models, test doubles).
    None,
}

/// A single agent catalog entry, as loaded from `agents.yaml`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// The agent's catalog id.
    pub id: AgentId,
    /// Which vendor's credentials and sandbox staging this agent needs.
    pub provider: VendorProvider,
    /// The model string substituted for [`MODEL_PLACEHOLDER`].
    pub model: String,
    /// Absolute path to the agent's executable.
    pub binary: PathBuf,
    /// Argv template; exactly one element must equal [`MODEL_PLACEHOLDER`].
    pub argv_template: Vec<String>,
    /// Additional fixed arguments appended after template substitution.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Whether this agent is eligible for competitions and reviews.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

impl AgentDefinition {
    /// Validate the argv template invariant: `MODEL_PLACEHOLDER` appears
    /// exactly once in `argv_template`, and `--model` never appears in
    /// `extra_args` (it would silently override the substituted model).
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidArgvTemplate`] if either condition is
    /// violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let placeholder_count = self
            .argv_template
            .iter()
            .filter(|arg| arg.as_str() == MODEL_PLACEHOLDER)
            .count();
        if placeholder_count != 1 {
            return Err(ConfigError::InvalidArgvTemplate {
                agent_id: self.id.to_string(),
                detail: format!(
                    "argv_template must contain {MODEL_PLACEHOLDER} exactly once, found {placeholder_count}"
                ),
            });
        }
        if self.extra_args.iter().any(|arg| arg == "--model") {
            return Err(ConfigError::InvalidArgvTemplate {
                agent_id: self.id.to_string(),
                detail: "extra_args must not contain --model".to_owned(),
            });
        }
        Ok(())
    }

    /// Build the final argv for this agent by substituting
    /// [`MODEL_PLACEHOLDER`] with `self.model` and appending `extra_args`.
    #[must_use]
    pub fn resolve_argv(&self) -> Vec<String> {
        self.argv_template
            .iter()
            .map(|arg| {
                if arg == MODEL_PLACEHOLDER {
                    self.model.clone()
                } else {
                    arg.clone()
                }
            })
            .chain(self.extra_args.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_agent() -> AgentDefinition {
        AgentDefinition {
            id: AgentId::new("claude-fast").unwrap(),
            provider: VendorProvider::Anthropic,
            model: "claude-opus-4".to_owned(),
            binary: PathBuf::from("/usr/local/bin/claude"),
            argv_template: vec!["--model".to_owned(), MODEL_PLACEHOLDER.to_owned()],
            extra_args: vec![],
            enabled: true,
        }
    }

    #[test]
    fn validate_accepts_single_placeholder() {
        assert!(base_agent().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_placeholder() {
        let mut agent = base_agent();
        agent.argv_template = vec!["--model".to_owned(), "fixed".to_owned()];
        assert!(agent.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_placeholder() {
        let mut agent = base_agent();
        agent
            .argv_template
            .push(MODEL_PLACEHOLDER.to_owned());
        assert!(agent.validate().is_err());
    }

    #[test]
    fn validate_rejects_model_in_extra_args() {
        let mut agent = base_agent();
        agent.extra_args = vec!["--model".to_owned()];
        assert!(agent.validate().is_err());
    }

    #[test]
    fn resolve_argv_substitutes_model() {
        let agent = base_agent();
        assert_eq!(agent.resolve_argv(), vec!["--model", "claude-opus-4"]);
    }
}
