//! Session records: the `Run` / `Spec` / `Review` sum type and their
//! per-domain payloads (§3).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::ids::{AgentId, CandidateAlias, EvalSlug, ReviewId, RunId, SessionId, SpecId};

/// The lifecycle status shared by every session domain. Not every status
/// applies to every domain (`drafting`/`refining`/`awaiting-feedback` are
/// spec-only, for instance); the store does not enforce per-domain status
/// subsets, only the terminal-mutation invariant below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    /// Persisted but not yet started.
    Queued,
    /// Actively executing.
    Running,
    /// Spec session: an agent is drafting content.
    Drafting,
    /// Spec session: writing the accepted draft to disk.
    Saving,
    /// Spec session: a follow-up iteration is in progress.
    Refining,
    /// Spec session: waiting on operator feedback between iterations.
    AwaitingFeedback,
    /// Completed successfully.
    Succeeded,
    /// Completed with a failure.
    Failed,
    /// Terminated by the lifecycle supervisor.
    Aborted,
    /// Removed from active consideration after reaching a terminal status.
    Pruned,
    /// Spec session: the draft was written to disk.
    Saved,
    /// Spec session: a draft iteration was produced.
    Drafted,
}

impl SessionStatus {
    /// Terminal statuses forbid further mutation except a later transition
    /// to [`SessionStatus::Pruned`] (§3 invariant).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Aborted | Self::Pruned | Self::Saved | Self::Drafted
        )
    }

    /// Whether a transition from `self` to `next` is allowed: any
    /// non-terminal status may move to any other status, but a terminal
    /// status (other than `pruned` itself) may only move to `pruned`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if matches!(self, Self::Pruned) {
            return false;
        }
        if self.is_terminal() {
            return matches!(next, Self::Pruned);
        }
        true
    }
}

/// Which of the three session domains a [`SessionRecord`] belongs to,
/// without its payload. Used by store filters and index entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// A competition run.
    Run,
    /// A spec-authoring session.
    Spec,
    /// A blinded review session.
    Review,
}

/// A per-agent-invocation lifecycle status within a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    /// Queued but not yet launched.
    Queued,
    /// Currently executing under the watchdog.
    Running,
    /// Completed with exit code 0 and no watchdog trigger.
    Succeeded,
    /// Completed with a non-zero exit code, or a non-fatal runtime error.
    Failed,
    /// Terminated by the watchdog or the lifecycle supervisor.
    Aborted,
}

/// The outcome of the most recent attempt to apply a run's winning diff to
/// the working tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyOutcome {
    /// The diff applied cleanly.
    Applied,
    /// The working tree's current revision no longer matches the run's
    /// recorded base revision.
    BaseMismatch,
    /// `git apply` rejected the patch.
    Conflict,
    /// Some other failure prevented application.
    Failed,
}

/// The most recent apply attempt recorded against a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyStatus {
    /// The agent whose diff was applied.
    pub agent_id: AgentId,
    /// ISO-8601 timestamp of the attempt.
    pub attempted_at: String,
    /// What happened.
    pub outcome: ApplyOutcome,
    /// Additional detail, populated on non-`applied` outcomes.
    pub detail: Option<String>,
}

/// Which transcript format a chat artifact was captured in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatFormat {
    /// A single JSON document.
    Json,
    /// Newline-delimited JSON.
    Jsonl,
}

/// Which artifacts were captured for an agent invocation, and in what
/// format the chat transcript (if any) was captured.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactCapture {
    /// `artifacts/stdout.log` was captured.
    #[serde(default)]
    pub stdout: bool,
    /// `artifacts/stderr.log` was captured.
    #[serde(default)]
    pub stderr: bool,
    /// `artifacts/diff.patch` was captured.
    #[serde(default)]
    pub diff: bool,
    /// `artifacts/summary.txt` was captured.
    #[serde(default)]
    pub summary: bool,
    /// The chat transcript format, if a transcript was captured.
    pub chat: Option<ChatFormat>,
}

/// Whether an evaluation command passed or failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalStatus {
    /// The command exited 0.
    Passed,
    /// The command exited non-zero.
    Failed,
}

/// The outcome of one configured evaluation command run against an agent's
/// workspace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalOutcome {
    /// The eval's catalog slug.
    pub slug: EvalSlug,
    /// Pass/fail outcome.
    pub status: EvalStatus,
    /// The command's exit code, `None` if killed by signal.
    pub exit_code: Option<i32>,
    /// Whether `evals/<slug>.log` was written.
    pub has_log: bool,
}

/// One agent's participation in a run: its lifecycle, captured artifacts,
/// eval results, and any warnings or error encountered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInvocationRecord {
    /// The agent's catalog id.
    pub agent_id: AgentId,
    /// The model string used for this invocation.
    pub model: String,
    /// Current lifecycle status.
    pub status: InvocationStatus,
    /// ISO-8601 timestamp the invocation started.
    pub started_at: Option<String>,
    /// ISO-8601 timestamp the invocation completed.
    pub completed_at: Option<String>,
    /// The `git diff --shortstat` summary line, once captured.
    pub diff_stat: Option<String>,
    /// Per-eval-command outcomes, in configured order.
    #[serde(default)]
    pub evals: Vec<EvalOutcome>,
    /// Which artifacts were captured.
    #[serde(default)]
    pub artifacts: ArtifactCapture,
    /// Non-fatal warnings accumulated during the invocation.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// The error message, if the invocation failed.
    pub error: Option<String>,
}

impl AgentInvocationRecord {
    /// Build a freshly queued invocation record.
    #[must_use]
    pub fn queued(agent_id: AgentId, model: String) -> Self {
        Self {
            agent_id,
            model,
            status: InvocationStatus::Queued,
            started_at: None,
            completed_at: None,
            diff_stat: None,
            evals: Vec::new(),
            artifacts: ArtifactCapture::default(),
            warnings: Vec::new(),
            error: None,
        }
    }
}

/// The `Run` session payload (§3, §4.7).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// The git SHA the run's agent workspaces were branched from.
    pub base_revision: String,
    /// Repo-relative path to the spec this run executed against.
    pub spec_path: String,
    /// Per-agent invocation records, in the order agents were scheduled.
    pub agents: Vec<AgentInvocationRecord>,
    /// The most recent apply attempt, if any.
    pub apply_status: Option<ApplyStatus>,
    /// Soft-deletion timestamp, set by `prune`.
    pub deleted_at: Option<String>,
}

/// A reviewer's participation in a review session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerInvocationRecord {
    /// The reviewer agent's catalog id.
    pub agent_id: AgentId,
    /// The model string used for this reviewer invocation.
    pub model: String,
    /// Current lifecycle status.
    pub status: InvocationStatus,
    /// ISO-8601 timestamp the invocation started.
    pub started_at: Option<String>,
    /// ISO-8601 timestamp the invocation completed.
    pub completed_at: Option<String>,
    /// Repo-relative path to this reviewer's `review.md`, once written.
    pub output_path: Option<String>,
    /// Non-fatal warnings accumulated during the invocation.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// The error message, if the invocation failed.
    pub error: Option<String>,
}

/// The `Review` session payload (§3, §4.8).
///
/// The alias map is shared by every reviewer in the session and, per the
/// alias-map-consistency invariant, must be identical across all of them;
/// it is persisted once, before any reviewer starts, and never mutated
/// afterward.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRecord {
    /// The run this review session evaluates.
    pub run_id: RunId,
    /// `alias -> real agent id`, immutable once the session starts.
    pub alias_map: BTreeMap<CandidateAlias, AgentId>,
    /// Per-reviewer invocation records.
    pub reviewers: Vec<ReviewerInvocationRecord>,
}

/// One iteration of a spec-authoring session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecIteration {
    /// 1-based iteration number.
    pub iteration_number: u32,
    /// ISO-8601 timestamp the iteration was produced.
    pub created_at: String,
    /// Whether the operator accepted this iteration.
    pub accepted: bool,
}

/// The `Spec` session payload (§3).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecRecord {
    /// The spec's slug, derived from its title.
    pub slug: SpecId,
    /// The spec's human-readable title.
    pub title: String,
    /// Repo-relative output path, e.g. `.voratiq/specs/<slug>.md`.
    pub output_path: String,
    /// Iteration history, in order.
    pub iterations: Vec<SpecIteration>,
}

/// A persisted session record: id, timestamps, status, and exactly one
/// domain payload (§3).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SessionRecord {
    /// A competition run.
    Run {
        /// The session id.
        id: SessionId,
        /// ISO-8601 creation timestamp.
        created_at: String,
        /// Current lifecycle status.
        status: SessionStatus,
        /// ISO-8601 completion timestamp, once terminal.
        completed_at: Option<String>,
        /// The run-specific payload.
        payload: RunRecord,
    },
    /// A spec-authoring session.
    Spec {
        /// The session id.
        id: SessionId,
        /// ISO-8601 creation timestamp.
        created_at: String,
        /// Current lifecycle status.
        status: SessionStatus,
        /// ISO-8601 completion timestamp, once terminal.
        completed_at: Option<String>,
        /// The spec-specific payload.
        payload: SpecRecord,
    },
    /// A blinded review session.
    Review {
        /// The session id.
        id: SessionId,
        /// ISO-8601 creation timestamp.
        created_at: String,
        /// Current lifecycle status.
        status: SessionStatus,
        /// ISO-8601 completion timestamp, once terminal.
        completed_at: Option<String>,
        /// The review-specific payload.
        payload: ReviewRecord,
    },
}

impl SessionRecord {
    /// The session's id, regardless of domain.
    #[must_use]
    pub const fn id(&self) -> &SessionId {
        match self {
            Self::Run { id, .. } | Self::Spec { id, .. } | Self::Review { id, .. } => id,
        }
    }

    /// The session's current status, regardless of domain.
    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        match self {
            Self::Run { status, .. } | Self::Spec { status, .. } | Self::Review { status, .. } => {
                *status
            }
        }
    }

    /// Which domain this session belongs to.
    #[must_use]
    pub const fn kind(&self) -> SessionKind {
        match self {
            Self::Run { .. } => SessionKind::Run,
            Self::Spec { .. } => SessionKind::Spec,
            Self::Review { .. } => SessionKind::Review,
        }
    }

    /// The session's creation timestamp, regardless of domain.
    #[must_use]
    pub fn created_at(&self) -> &str {
        match self {
            Self::Run { created_at, .. }
            | Self::Spec { created_at, .. }
            | Self::Review { created_at, .. } => created_at,
        }
    }

    /// The session's completion timestamp, regardless of domain.
    #[must_use]
    pub const fn completed_at(&self) -> Option<&String> {
        match self {
            Self::Run { completed_at, .. }
            | Self::Spec { completed_at, .. }
            | Self::Review { completed_at, .. } => completed_at.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_status_only_transitions_to_pruned() {
        assert!(SessionStatus::Succeeded.can_transition_to(SessionStatus::Pruned));
        assert!(!SessionStatus::Succeeded.can_transition_to(SessionStatus::Running));
    }

    #[test]
    fn pruned_is_a_dead_end() {
        assert!(!SessionStatus::Pruned.can_transition_to(SessionStatus::Queued));
    }

    #[test]
    fn non_terminal_status_can_transition_freely() {
        assert!(SessionStatus::Running.can_transition_to(SessionStatus::Succeeded));
        assert!(SessionStatus::Queued.can_transition_to(SessionStatus::Running));
    }

    #[test]
    fn session_record_accessors_match_variant() {
        let record = SessionRecord::Run {
            id: SessionId::new("20260730-221500-abcde").unwrap(),
            created_at: "2026-07-30T22:15:00Z".to_owned(),
            status: SessionStatus::Running,
            completed_at: None,
            payload: RunRecord {
                base_revision: "deadbeef".to_owned(),
                spec_path: ".voratiq/specs/foo.md".to_owned(),
                agents: Vec::new(),
                apply_status: None,
                deleted_at: None,
            },
        };
        assert_eq!(record.kind(), SessionKind::Run);
        assert_eq!(record.status(), SessionStatus::Running);
        assert_eq!(record.id().as_str(), "20260730-221500-abcde");
    }

    #[test]
    fn session_record_serde_roundtrip() {
        let record = SessionRecord::Spec {
            id: SessionId::new("spec-session-1").unwrap(),
            created_at: "2026-07-30T22:15:00Z".to_owned(),
            status: SessionStatus::Drafted,
            completed_at: Some("2026-07-30T22:20:00Z".to_owned()),
            payload: SpecRecord {
                slug: SpecId::new("widget-rewrite").unwrap(),
                title: "Widget rewrite".to_owned(),
                output_path: ".voratiq/specs/widget-rewrite.md".to_owned(),
                iterations: vec![SpecIteration {
                    iteration_number: 1,
                    created_at: "2026-07-30T22:16:00Z".to_owned(),
                    accepted: true,
                }],
            },
        };
        let json = serde_json::to_string(&record).unwrap();
        let decoded: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
    }
}
