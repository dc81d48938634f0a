//! The blinded review pipeline (§4.8, C8): stages a completed run's diffs
//! under reviewer-visible aliases, runs K reviewer agents through the
//! competition engine against that shared, read-only staging, validates
//! their recommendations, then de-aliases the result. Built atop
//! [`voratiq_core::competition`] the same way [`crate::run`] is.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _};

use voratiq_core::competition::{CompetitionAdapter, CompetitionOutcome, PrepareOutcome, run_competition};
use voratiq_core::error::{ReviewError, StoreError};
use voratiq_core::model::{
    AgentDefinition, AgentId, CandidateAlias, InvocationStatus, ReviewId,
    ReviewRecord, ReviewerInvocationRecord, RunId, RunRecord, SessionId, SessionRecord,
    SessionStatus,
};
use voratiq_core::paths::{self, Domain};
use voratiq_core::sandbox::{self, SandboxPolicy};
use voratiq_core::store::RecordStore;

use voratiq_git::GitRepo;

use crate::auth::{self, StagedAuth};
use crate::launcher::{self, LaunchRequest};
use crate::supervisor::{ABORT_WARNING, ActiveContext, LifecycleSupervisor};
use crate::watchdog::{self, WatchdogConfig, WatchdogOutcome};

/// A candidate run-agent invocation eligible for review: an agent whose
/// diff was captured on disk.
struct EligibleCandidate {
    agent_id: AgentId,
    diff_path: PathBuf,
}

/// Everything needed to run one blinded review of a completed run.
pub struct ReviewRequest {
    /// Absolute path to the repository root.
    pub repo_root: PathBuf,
    /// The run this review evaluates.
    pub run_id: RunId,
    /// The run's record, already loaded by the caller.
    pub run_record: RunRecord,
    /// Absolute path to the spec the run executed against.
    pub spec_abs_path: PathBuf,
    /// Reviewer agents, in catalog order. §6 requires exactly one; enforced
    /// by the caller's CLI validation, not here (the pipeline itself is
    /// agnostic to reviewer count).
    pub reviewers: Vec<AgentDefinition>,
    /// Watchdog tunables, resolved per reviewer's vendor by the caller.
    pub watchdog_configs: BTreeMap<AgentId, WatchdogConfig>,
    /// Maximum reviewers executing concurrently.
    pub max_parallel: usize,
    /// The operator's `$HOME`, used to discover vendor credentials.
    pub operator_home: PathBuf,
    /// Environment overlay applied under each reviewer's staged auth.
    pub environment: voratiq_core::config::EnvironmentConfig,
}

/// What [`run`] hands back once the review record is finalized.
pub struct ReviewHandle {
    /// The generated review id.
    pub review_id: ReviewId,
    /// Whether every reviewer succeeded and produced a valid recommendation.
    pub succeeded: bool,
}

/// Parsed `recommendation.json`, per the §4.8 schema.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct RecommendationDoc {
    version: u32,
    preferred_agents: Vec<String>,
    rationale: String,
    next_actions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolved_preferred_agents: Option<Vec<String>>,
}

/// Stage a completed run's diffs, run reviewers, and validate + de-alias
/// their recommendations (§4.8 steps 1-7).
///
/// # Errors
/// Returns [`ReviewError::NoEligibleCandidates`] if no run agent has a
/// captured diff, a leakage/validation error if a reviewer's output fails
/// the blinded-review invariants, or any store/git/IO error encountered
/// along the way. Individual reviewer failures do not fail this call — they
/// are captured in the review record.
pub async fn run(
    repo: &(dyn GitRepo + Send + Sync),
    store: &Arc<RecordStore>,
    supervisor: &Arc<LifecycleSupervisor>,
    request: ReviewRequest,
    now_iso: &str,
    id_timestamp: &str,
) -> anyhow::Result<ReviewHandle> {
    let eligible = eligible_candidates(&request.repo_root, &request.run_id, &request.run_record)?;
    if eligible.is_empty() {
        bail!(ReviewError::NoEligibleCandidates);
    }
    if request.reviewers.is_empty() {
        bail!("at least one reviewer is required to start a review");
    }
    for reviewer in &request.reviewers {
        auth::resolve_provider(reviewer.provider, &request.operator_home)
            .verify()
            .with_context(|| format!("verifying credentials for reviewer `{}`", reviewer.id))?;
    }

    let review_id = ReviewId::generate(id_timestamp);
    let session_id = review_id.as_session_id().clone();

    store.append(
        SessionRecord::Review {
            id: session_id.clone(),
            created_at: now_iso.to_owned(),
            status: SessionStatus::Running,
            completed_at: None,
            payload: ReviewRecord {
                run_id: request.run_id.clone(),
                alias_map: BTreeMap::new(),
                reviewers: Vec::new(),
            },
        },
        format!("review of run {}", request.run_id),
    )?;

    supervisor
        .register(ActiveContext {
            label: format!("review {}", review_id.as_str()),
            store: Arc::clone(store),
            session_id: session_id.clone(),
            mark_aborted: Box::new({
                let aborted_at = now_iso.to_owned();
                move |mut record| {
                    if let SessionRecord::Review { status, completed_at, payload, .. } = &mut record {
                        *status = SessionStatus::Aborted;
                        *completed_at = Some(aborted_at);
                        for reviewer in &mut payload.reviewers {
                            if matches!(reviewer.status, InvocationStatus::Queued | InvocationStatus::Running) {
                                reviewer.status = InvocationStatus::Aborted;
                                reviewer.warnings.push(ABORT_WARNING.to_owned());
                            }
                        }
                    }
                    record
                }
            }),
            staged_auths: Vec::new(),
        })
        .await;

    let shared_rel = format!(
        "{}/.shared",
        paths::session_dir(Domain::Reviews, &session_id)?
    );
    let shared_root = request.repo_root.join(&shared_rel);
    let inputs_dir = shared_root.join("inputs");
    let base_dir = inputs_dir.join("base");
    let candidates_dir = inputs_dir.join("candidates");
    std::fs::create_dir_all(&candidates_dir)?;

    std::fs::copy(&request.spec_abs_path, inputs_dir.join("spec.md"))
        .context("copying spec into shared review staging")?;
    repo.worktree_add(&base_dir, &request.run_record.base_revision)
        .context("creating the shared base snapshot")?;

    let mut alias_map = BTreeMap::new();
    for candidate in &eligible {
        let alias = CandidateAlias::generate();
        let alias_dir = candidates_dir.join(alias.as_str());
        std::fs::create_dir_all(&alias_dir)?;
        std::fs::copy(&candidate.diff_path, alias_dir.join("diff.patch"))
            .with_context(|| format!("copying diff for agent `{}`", candidate.agent_id))?;
        alias_map.insert(alias, candidate.agent_id.clone());
    }

    store.rewrite(&session_id, {
        let alias_map = alias_map.clone();
        let reviewers = request
            .reviewers
            .iter()
            .map(|r| ReviewerInvocationRecord {
                agent_id: r.id.clone(),
                model: r.model.clone(),
                status: InvocationStatus::Queued,
                started_at: None,
                completed_at: None,
                output_path: None,
                warnings: Vec::new(),
                error: None,
            })
            .collect::<Vec<_>>();
        move |mut record| {
            if let SessionRecord::Review { payload, .. } = &mut record {
                payload.alias_map = alias_map.clone();
                payload.reviewers = reviewers.clone();
            }
            record
        }
    })?;
    store.flush(&session_id)?;

    let forbidden_tokens: Vec<String> = eligible
        .iter()
        .flat_map(|c| [c.agent_id.to_string()])
        .chain(
            request
                .run_record
                .agents
                .iter()
                .map(|a| a.model.clone()),
        )
        .collect();

    let run_session_dir = request
        .repo_root
        .join(paths::session_dir(Domain::Runs, request.run_id.as_session_id())?);
    let run_index_path = request.repo_root.join(paths::index_path(Domain::Runs));
    let run_index_lock_path = request.repo_root.join(paths::index_lock_path(Domain::Runs));

    let candidates: Vec<ReviewCandidate> = request
        .reviewers
        .iter()
        .cloned()
        .map(|agent| ReviewCandidate { agent })
        .collect();

    let eligible_aliases: Vec<CandidateAlias> = alias_map.keys().cloned().collect();

    let adapter = ReviewAdapter {
        store,
        session_id: session_id.clone(),
        repo_root: request.repo_root.clone(),
        review_id: review_id.clone(),
        inputs_dir,
        alias_map,
        eligible_aliases,
        forbidden_tokens,
        run_session_dir,
        run_index_path,
        run_index_lock_path,
        shared_base_snapshot: base_dir,
        watchdog_configs: request.watchdog_configs,
        operator_home: request.operator_home,
        environment: request.environment,
        all_reviewer_ids: request.reviewers.iter().map(|a| a.id.clone()).collect(),
    };

    let outcome = run_competition(&adapter, candidates, request.max_parallel.max(1)).await;
    let (status, succeeded) = finalize_status(&outcome);

    store.rewrite(&session_id, move |mut record| {
        if let SessionRecord::Review { status: s, completed_at, .. } = &mut record {
            *s = status;
            *completed_at = Some(now_iso.to_owned());
        }
        record
    })?;
    store.flush(&session_id)?;
    store.dispose(&session_id);
    supervisor.clear().await;

    Ok(ReviewHandle { review_id, succeeded })
}

/// Derive the review's final status from the competition outcome: succeeded
/// iff every reviewer's result (not just the aggregate `failed` flag) is
/// [`InvocationStatus::Succeeded`].
fn finalize_status(
    outcome: &CompetitionOutcome<ReviewExecutionResult, anyhow::Error>,
) -> (SessionStatus, bool) {
    match outcome {
        CompetitionOutcome::PrepareFailed { .. } => (SessionStatus::Failed, false),
        CompetitionOutcome::Completed { results, .. } => {
            let all_succeeded = results
                .iter()
                .all(|r| matches!(r, Ok(result) if result.status == InvocationStatus::Succeeded));
            if all_succeeded {
                (SessionStatus::Succeeded, true)
            } else {
                (SessionStatus::Failed, false)
            }
        }
    }
}

/// Filter run agents to those with a captured diff on disk (§4.8 step 1).
fn eligible_candidates(
    repo_root: &Path,
    run_id: &RunId,
    run_record: &RunRecord,
) -> anyhow::Result<Vec<EligibleCandidate>> {
    let mut eligible = Vec::new();
    for invocation in &run_record.agents {
        if !invocation.artifacts.diff {
            continue;
        }
        let diff_path = repo_root.join(paths::agent_subdir(
            Domain::Runs,
            run_id.as_session_id(),
            &invocation.agent_id,
            "artifacts",
        )?)
        .join("diff.patch");
        if diff_path.is_file() {
            eligible.push(EligibleCandidate {
                agent_id: invocation.agent_id.clone(),
                diff_path,
            });
        }
    }
    Ok(eligible)
}

struct ReviewCandidate {
    agent: AgentDefinition,
}

struct ReviewPrepared {
    agent: AgentDefinition,
    workspace: PathBuf,
    artifacts_dir: PathBuf,
    staged_auth: StagedAuth,
}

impl Drop for ReviewPrepared {
    fn drop(&mut self) {
        self.staged_auth.teardown();
    }
}

struct ReviewExecutionResult {
    agent_id: AgentId,
    status: InvocationStatus,
    completed_at: String,
    output_path: Option<String>,
    warnings: Vec<String>,
    error: Option<String>,
}

struct ReviewAdapter<'a> {
    store: &'a RecordStore,
    session_id: SessionId,
    repo_root: PathBuf,
    review_id: ReviewId,
    inputs_dir: PathBuf,
    alias_map: BTreeMap<CandidateAlias, AgentId>,
    eligible_aliases: Vec<CandidateAlias>,
    forbidden_tokens: Vec<String>,
    run_session_dir: PathBuf,
    run_index_path: PathBuf,
    run_index_lock_path: PathBuf,
    shared_base_snapshot: PathBuf,
    watchdog_configs: BTreeMap<AgentId, WatchdogConfig>,
    operator_home: PathBuf,
    environment: voratiq_core::config::EnvironmentConfig,
    all_reviewer_ids: Vec<AgentId>,
}

impl ReviewAdapter<'_> {
    fn mark_invocation(
        &self,
        agent_id: &AgentId,
        mutate: impl FnOnce(&mut ReviewerInvocationRecord) + Send + 'static,
    ) -> Result<(), StoreError> {
        let agent_id = agent_id.clone();
        self.store.rewrite(&self.session_id, move |mut record| {
            if let SessionRecord::Review { payload, .. } = &mut record
                && let Some(invocation) = payload.reviewers.iter_mut().find(|r| r.agent_id == agent_id)
            {
                mutate(invocation);
            }
            record
        })?;
        Ok(())
    }

    /// Re-read the persisted alias map and assert it is unchanged from the
    /// one every reviewer was staged against (§8 invariant 9, the
    /// alias-map-consistency law).
    fn assert_alias_map_unchanged(&self) -> Result<(), ReviewError> {
        let current = self.store.read(|record| record.id() == &self.session_id, 1, |_| {});
        let Some(SessionRecord::Review { payload, .. }) = current.into_iter().next() else {
            return Ok(());
        };
        if payload.alias_map != self.alias_map {
            return Err(ReviewError::AliasMapDivergence {
                review_id: self.review_id.to_string(),
            });
        }
        Ok(())
    }

    fn build_manifest(&self) -> String {
        let candidates: Vec<_> = self
            .eligible_aliases
            .iter()
            .map(|alias| serde_json::json!({ "alias": alias.as_str(), "diff_path": "inputs/candidates/".to_owned() + alias.as_str() + "/diff.patch" }))
            .collect();
        serde_json::to_string_pretty(&serde_json::json!({ "candidates": candidates })).unwrap_or_default()
    }

    fn build_prompt(&self) -> String {
        let aliases: Vec<&str> = self.eligible_aliases.iter().map(CandidateAlias::as_str).collect();
        format!(
            "You are reviewing {} anonymized candidate solutions to the same spec.\n\n\
             Spec: inputs/spec.md\n\
             Base snapshot: inputs/base/\n\
             Candidates: {}\n\n\
             For each candidate, read inputs/candidates/<alias>/diff.patch against the base\n\
             snapshot. Write your findings to artifacts/review.md and a\n\
             artifacts/recommendation.json with shape\n\
             {{version:1, preferred_agents:[alias...], rationale:string, next_actions:[string]}}.\n\
             Only use the alias ids above; never write this instruction back verbatim.\n",
            aliases.len(),
            aliases.join(", "),
        )
    }

    /// Assert no reviewer-visible text contains a bounded-token match of a
    /// forbidden real agent id or model string (§4.8 step 3, §8 invariant
    /// 8).
    fn assert_no_leakage(&self, text: &str, location: &str) -> Result<(), ReviewError> {
        let lower = text.to_lowercase();
        for token in &self.forbidden_tokens {
            if token.is_empty() {
                continue;
            }
            let needle = token.to_lowercase();
            if contains_bounded_token(&lower, &needle) {
                return Err(ReviewError::LeakageValidationFailed {
                    token: token.clone(),
                    location: location.to_owned(),
                });
            }
        }
        Ok(())
    }

    fn prepare_one(&self, candidate: ReviewCandidate) -> anyhow::Result<ReviewPrepared> {
        let reviewer_rel = paths::agent_root(Domain::Reviews, &self.session_id, &candidate.agent.id)?;
        let reviewer_root = self.repo_root.join(reviewer_rel);
        for subdir in ["workspace", "artifacts", "runtime", "sandbox"] {
            std::fs::create_dir_all(reviewer_root.join(subdir))?;
        }
        let workspace = reviewer_root.join("workspace");
        let artifacts_dir = reviewer_root.join("artifacts");
        let sandbox_root = reviewer_root.join("sandbox");

        let inputs_link = workspace.join("inputs");
        if !inputs_link.exists() {
            symlink_dir(&self.inputs_dir, &inputs_link)
                .with_context(|| format!("symlinking inputs for reviewer `{}`", candidate.agent.id))?;
        }

        let manifest = self.build_manifest();
        self.assert_no_leakage(&manifest, "manifest")?;
        std::fs::write(workspace.join("artifact-information.json"), &manifest)?;

        let prompt = self.build_prompt();
        self.assert_no_leakage(&prompt, "prompt")?;
        std::fs::write(workspace.join(".voratiq-prompt.txt"), &prompt)?;

        let mut staged_auth = auth::resolve_provider(candidate.agent.provider, &self.operator_home)
            .stage(&sandbox_root, candidate.agent.id.as_str())?;
        auth::apply_environment_overlay(&mut staged_auth.env_overrides, &self.environment);

        let sibling_reviewer_roots: Vec<PathBuf> = self
            .all_reviewer_ids
            .iter()
            .filter(|id| **id != candidate.agent.id)
            .map(|id| {
                paths::agent_root(Domain::Reviews, &self.session_id, id).map(|rel| self.repo_root.join(rel))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut policy: SandboxPolicy = sandbox::baseline_policy(
            &self.repo_root,
            &workspace,
            &staged_auth.sandbox_path,
            &staged_auth.sandbox_path.join("tmp"),
            &sibling_reviewer_roots,
        )
        .union(sandbox::review_stage_policy(
            &sibling_reviewer_roots,
            &self.run_index_path,
            &self.run_index_lock_path,
            &self.shared_base_snapshot,
        ));
        policy.deny_write.push(self.run_session_dir.clone());
        policy.deny_write.push(self.inputs_dir.clone());
        policy.deny_read.push(self.run_session_dir.clone());
        let _ = std::fs::write(
            reviewer_root.join("runtime").join("sandbox.json"),
            serde_json::to_string_pretty(&policy)?,
        );

        Ok(ReviewPrepared {
            agent: candidate.agent,
            workspace,
            artifacts_dir,
            staged_auth,
        })
    }
}

/// A crude reviewer-output token check: the needle must appear surrounded
/// by non-alphanumeric boundaries (or string edges), so `"gpt-5"` does not
/// false-positive inside an unrelated longer token.
fn contains_bounded_token(haystack: &str, needle: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let abs = start + pos;
        let before_ok = haystack[..abs].chars().next_back().is_none_or(|c| !c.is_alphanumeric());
        let after_idx = abs + needle.len();
        let after_ok = haystack[after_idx..].chars().next().is_none_or(|c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        start = abs + 1;
        if start >= haystack.len() {
            break;
        }
    }
    false
}

#[cfg(unix)]
fn symlink_dir(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(not(unix))]
fn symlink_dir(original: &Path, link: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(link)?;
    // Best effort for non-Unix hosts without symlink privileges: copy the
    // spec and candidate diffs so the reviewer still has something to read.
    for entry in walkdir_shallow(original)? {
        let dest = link.join(entry.strip_prefix(original).unwrap_or(&entry));
        if entry.is_dir() {
            std::fs::create_dir_all(dest)?;
        } else {
            std::fs::copy(&entry, dest)?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn walkdir_shallow(_root: &Path) -> std::io::Result<Vec<PathBuf>> {
    Ok(Vec::new())
}

impl CompetitionAdapter for ReviewAdapter<'_> {
    type Candidate = ReviewCandidate;
    type Prepared = ReviewPrepared;
    type ExecutionResult = ReviewExecutionResult;
    type Error = anyhow::Error;

    async fn prepare_candidates(
        &self,
        candidates: Vec<Self::Candidate>,
    ) -> PrepareOutcome<Self::Prepared, Self::Error> {
        let mut ready = Vec::with_capacity(candidates.len());
        let mut failures = Vec::new();

        for candidate in candidates {
            match self.prepare_one(candidate) {
                Ok(prepared) => ready.push(prepared),
                Err(e) => failures.push(e),
            }
        }

        if !failures.is_empty() {
            for prepared in &ready {
                prepared.staged_auth.teardown();
            }
            ready.clear();
        }

        PrepareOutcome { ready, failures }
    }

    async fn execute_candidate(
        &self,
        prepared: &Self::Prepared,
    ) -> Result<Self::ExecutionResult, Self::Error> {
        self.mark_invocation(&prepared.agent.id, |invocation| {
            invocation.status = InvocationStatus::Running;
            invocation.started_at = Some(now_iso());
        })?;

        let stdout_log = prepared.artifacts_dir.join("stdout.log");
        let stderr_log = prepared.artifacts_dir.join("stderr.log");
        let argv = prepared.agent.resolve_argv();
        let request = LaunchRequest {
            binary: &prepared.agent.binary,
            argv: &argv,
            cwd: &prepared.workspace,
            env_overrides: &prepared.staged_auth.env_overrides,
            stdout_log: &stdout_log,
            stderr_log: &stderr_log,
        };

        let mut launched = launcher::launch(&request).await?;
        let watchdog_config = self
            .watchdog_configs
            .get(&prepared.agent.id)
            .cloned()
            .unwrap_or_else(default_watchdog_config);
        let cancel = tokio_util::sync::CancellationToken::new();
        let outcome = watchdog::supervise(
            &mut launched,
            &watchdog_config,
            prepared.agent.id.as_str(),
            &stderr_log,
            &cancel,
        )
        .await?;

        let (status, error, warnings) = match &outcome {
            WatchdogOutcome::ChildExited(exit_status) if exit_status.success() => {
                (InvocationStatus::Succeeded, None, Vec::new())
            }
            WatchdogOutcome::ChildExited(exit_status) => (
                InvocationStatus::Failed,
                Some(format!("reviewer exited with {exit_status}")),
                Vec::new(),
            ),
            WatchdogOutcome::Triggered { trigger, reason } => (
                InvocationStatus::Failed,
                Some(format!("{trigger:?}: {reason}")),
                vec![reason.clone()],
            ),
        };

        let mut output_path = None;
        let mut final_status = status;
        let mut final_error = error;

        if matches!(final_status, InvocationStatus::Succeeded) {
            match self.validate_and_dealias(prepared) {
                Ok(path) => output_path = Some(path),
                Err(e) => {
                    final_status = InvocationStatus::Failed;
                    final_error = Some(e.to_string());
                }
            }
        }

        if let Err(e) = self.assert_alias_map_unchanged() {
            final_status = InvocationStatus::Failed;
            final_error = Some(e.to_string());
        }

        Ok(ReviewExecutionResult {
            agent_id: prepared.agent.id.clone(),
            status: final_status,
            completed_at: now_iso(),
            output_path,
            warnings,
            error: final_error,
        })
    }

    async fn on_candidate_completed(&self, result: &Self::ExecutionResult) {
        let outcome_status = result.status;
        let completed_at = result.completed_at.clone();
        let output_path = result.output_path.clone();
        let warnings = result.warnings.clone();
        let error = result.error.clone();
        let _ = self.mark_invocation(&result.agent_id, move |invocation| {
            invocation.status = outcome_status;
            invocation.completed_at = Some(completed_at);
            invocation.output_path = output_path;
            invocation.warnings = warnings;
            invocation.error = error;
        });
        let _ = self.store.flush(&self.session_id);
    }

    fn capture_execution_failure(
        &self,
        prepared: &Self::Prepared,
        error: &Self::Error,
    ) -> Option<Self::ExecutionResult> {
        Some(ReviewExecutionResult {
            agent_id: prepared.agent.id.clone(),
            status: InvocationStatus::Failed,
            completed_at: now_iso(),
            output_path: None,
            warnings: Vec::new(),
            error: Some(error.to_string()),
        })
    }

    async fn finalize_competition(&self, _failed: bool) {}
}

impl ReviewAdapter<'_> {
    /// Read `review.md` + `recommendation.json`, validate them against §4.8
    /// step 5's invariants, then de-alias and overwrite the recommendation
    /// (§4.8 step 6). Returns the repo-relative display path of
    /// `review.md` on success.
    fn validate_and_dealias(&self, prepared: &ReviewPrepared) -> anyhow::Result<String> {
        let review_md = prepared.artifacts_dir.join("review.md");
        let review_text = std::fs::read_to_string(&review_md).unwrap_or_default();
        if review_text.trim().is_empty() {
            bail!(ReviewError::ReviewGenerationFailed {
                detail: "review.md is missing or empty".to_owned(),
            });
        }

        let recommendation_path = prepared.artifacts_dir.join("recommendation.json");
        let recommendation_text = std::fs::read_to_string(&recommendation_path)
            .map_err(|e| ReviewError::ReviewGenerationFailed {
                detail: format!("reading recommendation.json: {e}"),
            })?;
        let mut doc: RecommendationDoc = serde_json::from_str(&recommendation_text).map_err(|e| {
            ReviewError::ReviewGenerationFailed {
                detail: format!("recommendation.json failed schema validation: {e}"),
            }
        })?;
        if doc.version != 1 {
            bail!(ReviewError::ReviewGenerationFailed {
                detail: format!("unsupported recommendation version {}", doc.version),
            });
        }

        let eligible_set: std::collections::BTreeSet<&str> =
            self.alias_map.keys().map(CandidateAlias::as_str).collect();
        if !doc.preferred_agents.iter().all(|a| eligible_set.contains(a.as_str())) {
            bail!(ReviewError::ReviewGenerationFailed {
                detail: "preferred_agents references an alias outside the eligible set".to_owned(),
            });
        }
        if !ranking_matches_document(&doc.preferred_agents, &review_text) {
            bail!(ReviewError::ReviewGenerationFailed {
                detail: "preferred_agents order diverges from the in-document ranking".to_owned(),
            });
        }

        let resolved: Vec<String> = doc
            .preferred_agents
            .iter()
            .filter_map(|alias| {
                self.alias_map
                    .iter()
                    .find(|(a, _)| a.as_str() == alias)
                    .map(|(_, real)| real.to_string())
            })
            .collect();
        doc.resolved_preferred_agents = Some(resolved);
        std::fs::write(&recommendation_path, serde_json::to_string_pretty(&doc)?)?;

        Ok(paths::to_display_path(
            recommendation_path
                .strip_prefix(&self.repo_root)
                .unwrap_or(&recommendation_path),
        ))
    }
}

/// Whether `preferred_agents`' order matches the order its aliases are
/// first mentioned in `review_text` (the "in-document ranking" §4.8 step 5
/// requires preferred_agents to be consistent with).
fn ranking_matches_document(preferred_agents: &[String], review_text: &str) -> bool {
    let lower = review_text.to_lowercase();
    let positions: Vec<Option<usize>> = preferred_agents
        .iter()
        .map(|alias| lower.find(&alias.to_lowercase()))
        .collect();
    if positions.iter().any(Option::is_none) {
        return false;
    }
    #[allow(clippy::unwrap_used)]
    positions.windows(2).all(|pair| pair[0].unwrap() <= pair[1].unwrap())
}

fn default_watchdog_config() -> WatchdogConfig {
    WatchdogConfig::from_sandbox_config(
        &voratiq_core::config::SandboxConfig::default(),
        voratiq_core::model::VendorProvider::None,
    )
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_token_ignores_substring_inside_longer_word() {
        assert!(!contains_bounded_token("the gpt-5-codex model", "gpt-5"));
        assert!(contains_bounded_token("model gpt-5 was used", "gpt-5"));
    }

    #[test]
    fn ranking_matches_document_requires_monotonic_order() {
        let text = "Candidate r_aaaaaaaaaa is stronger than r_bbbbbbbbbb overall.";
        assert!(ranking_matches_document(
            &["r_aaaaaaaaaa".to_owned(), "r_bbbbbbbbbb".to_owned()],
            text
        ));
        assert!(!ranking_matches_document(
            &["r_bbbbbbbbbb".to_owned(), "r_aaaaaaaaaa".to_owned()],
            text
        ));
    }

    fn adapter(repo_root: PathBuf, alias_map: BTreeMap<CandidateAlias, AgentId>) -> ReviewAdapter<'static> {
        // Leaked on purpose: unit tests only need the adapter for the
        // duration of one assertion, and `RecordStore` has no `Default`.
        let store: &'static RecordStore =
            Box::leak(Box::new(RecordStore::new(repo_root.clone(), Domain::Reviews)));
        ReviewAdapter {
            store,
            session_id: SessionId::new("20260731-000000-aaaaa").unwrap(),
            repo_root: repo_root.clone(),
            review_id: ReviewId::new("20260731-000000-aaaaa".to_owned()).unwrap(),
            inputs_dir: repo_root.join("inputs"),
            alias_map: alias_map.clone(),
            eligible_aliases: alias_map.keys().cloned().collect(),
            forbidden_tokens: Vec::new(),
            run_session_dir: repo_root.join("run"),
            run_index_path: repo_root.join("run-index.json"),
            run_index_lock_path: repo_root.join("run-index.lock"),
            shared_base_snapshot: repo_root.join("base"),
            watchdog_configs: BTreeMap::new(),
            operator_home: repo_root.clone(),
            environment: voratiq_core::config::EnvironmentConfig::default(),
            all_reviewer_ids: Vec::new(),
        }
    }

    fn staged_auth() -> StagedAuth {
        StagedAuth {
            provider: voratiq_core::model::VendorProvider::None,
            env_overrides: BTreeMap::new(),
            sandbox_path: PathBuf::from("/tmp/does-not-matter"),
            secret_handles: Vec::new(),
        }
    }

    /// S6: a reviewer's recommendation naming a blinded alias is de-aliased
    /// into the real agent id it maps to, both fields survive on disk, and
    /// the alias map itself is untouched.
    #[test]
    fn validate_and_dealias_resolves_alias_to_real_agent_id() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = dir.path().to_path_buf();
        let artifacts_dir = repo_root.join("artifacts");
        std::fs::create_dir_all(&artifacts_dir).unwrap();

        let alpha = AgentId::new("alpha".to_owned()).unwrap();
        let beta = AgentId::new("beta".to_owned()).unwrap();
        let alias_alpha = CandidateAlias::new("r_aaaaaaaaaa".to_owned()).unwrap();
        let mut alias_map = BTreeMap::new();
        alias_map.insert(alias_alpha.clone(), alpha.clone());
        alias_map.insert(CandidateAlias::new("r_bbbbbbbbbb".to_owned()).unwrap(), beta);

        std::fs::write(
            artifacts_dir.join("review.md"),
            format!("Candidate {} is the strongest submission overall.", alias_alpha.as_str()),
        )
        .unwrap();
        std::fs::write(
            artifacts_dir.join("recommendation.json"),
            serde_json::json!({
                "version": 1,
                "preferred_agents": [alias_alpha.as_str()],
                "rationale": "cleaner diff, passing evals",
                "next_actions": ["apply"],
            })
            .to_string(),
        )
        .unwrap();

        let adapter = adapter(repo_root, alias_map.clone());
        let prepared = ReviewPrepared {
            agent: AgentDefinition {
                id: alpha.clone(),
                provider: voratiq_core::model::VendorProvider::None,
                model: "test-model".to_owned(),
                binary: PathBuf::from("/usr/bin/true"),
                argv_template: vec![voratiq_core::model::MODEL_PLACEHOLDER.to_owned()],
                extra_args: Vec::new(),
                enabled: true,
            },
            workspace: adapter.repo_root.join("workspace"),
            artifacts_dir: artifacts_dir.clone(),
            staged_auth: staged_auth(),
        };

        let display_path = adapter.validate_and_dealias(&prepared).unwrap();
        assert!(display_path.ends_with("recommendation.json"));

        let on_disk: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(artifacts_dir.join("recommendation.json")).unwrap())
                .unwrap();
        assert_eq!(on_disk["preferred_agents"], serde_json::json!([alias_alpha.as_str()]));
        assert_eq!(on_disk["resolved_preferred_agents"], serde_json::json!(["alpha"]));
        assert_eq!(adapter.alias_map, alias_map, "alias map must not be mutated by de-aliasing");
    }

    fn dummy_result(agent_id: &str, status: InvocationStatus) -> ReviewExecutionResult {
        ReviewExecutionResult {
            agent_id: AgentId::new(agent_id).unwrap(),
            status,
            completed_at: "2026-01-01T00:00:00Z".to_owned(),
            output_path: None,
            warnings: Vec::new(),
            error: None,
        }
    }

    #[test]
    fn finalize_status_succeeds_only_when_reviewer_succeeded() {
        let outcome = CompetitionOutcome::Completed {
            results: vec![Ok(dummy_result("alpha", InvocationStatus::Succeeded))],
            failed: false,
        };
        assert_eq!(finalize_status(&outcome), (SessionStatus::Succeeded, true));
    }

    #[test]
    fn finalize_status_fails_when_reviewer_failed() {
        let outcome = CompetitionOutcome::Completed {
            results: vec![Ok(dummy_result("alpha", InvocationStatus::Failed))],
            failed: false,
        };
        assert_eq!(finalize_status(&outcome), (SessionStatus::Failed, false));
    }

    #[test]
    fn finalize_status_fails_when_reviewer_aborted() {
        let outcome = CompetitionOutcome::Completed {
            results: vec![Ok(dummy_result("alpha", InvocationStatus::Aborted))],
            failed: false,
        };
        assert_eq!(finalize_status(&outcome), (SessionStatus::Failed, false));
    }

    #[test]
    fn finalize_status_fails_on_prepare_failure() {
        let outcome: CompetitionOutcome<ReviewExecutionResult, anyhow::Error> =
            CompetitionOutcome::PrepareFailed {
                ready: Vec::new(),
                failures: vec![anyhow::anyhow!("boom")],
            };
        assert_eq!(finalize_status(&outcome), (SessionStatus::Failed, false));
    }
}
