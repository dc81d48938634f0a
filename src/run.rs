//! The run orchestrator (§4.7, C7): stages one competition of agents
//! against a spec, captures each agent's diff and eval results, and
//! finalizes the run record. Built atop [`voratiq_core::competition`]'s
//! adapter-driven engine; this module supplies the run-specific meaning of
//! "prepare", "execute", and "finalize".

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _};

use voratiq_core::competition::{CompetitionAdapter, CompetitionOutcome, PrepareOutcome, run_competition};
use voratiq_core::config::EvalDefinition;
use voratiq_core::error::StoreError;
use voratiq_core::model::{
    AgentDefinition, AgentId, AgentInvocationRecord, ArtifactCapture, EvalOutcome, EvalStatus,
    InvocationStatus, RunId, RunRecord, SessionId, SessionRecord, SessionStatus,
};
use voratiq_core::paths::{self, Domain};
use voratiq_core::sandbox::{self, SandboxPolicy};
use voratiq_core::store::RecordStore;

use voratiq_git::GitRepo;

use crate::auth::{self, StagedAuth};
use crate::launcher::{self, LaunchRequest};
use crate::supervisor::{ABORT_WARNING, ActiveContext, LifecycleSupervisor};
use crate::watchdog::{self, WatchdogConfig, WatchdogOutcome};

/// Everything needed to run one competition of agents against a spec.
pub struct RunRequest {
    /// Absolute path to the repository root.
    pub repo_root: PathBuf,
    /// Repo-relative display path of the spec this run executes against.
    pub spec_path: String,
    /// The absolute path of the spec on disk, read to build the prompt.
    pub spec_abs_path: PathBuf,
    /// Competing agents, in catalog order.
    pub agents: Vec<AgentDefinition>,
    /// Evaluation commands run against every agent's workspace afterward.
    pub evals: Vec<EvalDefinition>,
    /// Watchdog tunables, already resolved per agent's vendor by the caller
    /// via [`WatchdogConfig::from_sandbox_config`].
    pub watchdog_configs: std::collections::BTreeMap<AgentId, WatchdogConfig>,
    /// Maximum agents executing concurrently.
    pub max_parallel: usize,
    /// The operator's `$HOME`, used to discover vendor credentials.
    pub operator_home: PathBuf,
    /// Environment overlay applied under each agent's staged auth.
    pub environment: voratiq_core::config::EnvironmentConfig,
}

/// What [`run`] hands back once the run record is finalized.
pub struct RunHandle {
    /// The generated run id.
    pub run_id: RunId,
    /// Whether every agent succeeded and no watchdog fired.
    pub succeeded: bool,
}

/// Validate preconditions, create the run record and per-agent worktrees,
/// run the competition, and finalize the record (§4.7 steps 1-5).
///
/// # Errors
/// Returns an error if the working tree is dirty, a binary/credential
/// precondition fails, or any store/git operation fails. Individual agent
/// failures do not fail this call — they are captured in the run record.
pub async fn run(
    repo: &(dyn GitRepo + Send + Sync),
    store: &Arc<RecordStore>,
    supervisor: &Arc<LifecycleSupervisor>,
    request: RunRequest,
    now_iso: &str,
    id_timestamp: &str,
) -> anyhow::Result<RunHandle> {
    if !repo.is_clean().context("checking working tree cleanliness")? {
        bail!("working tree is not clean; commit or stash changes before starting a run");
    }
    if request.agents.is_empty() {
        bail!("at least one agent is required to start a run");
    }
    for agent in &request.agents {
        precheck_binary(agent)?;
        auth::resolve_provider(agent.provider, &request.operator_home)
            .verify()
            .with_context(|| format!("verifying credentials for agent `{}`", agent.id))?;
    }

    let base_revision = repo
        .rev_parse("HEAD")
        .context("resolving the run's base revision")?;

    let run_id = RunId::generate(id_timestamp);
    let session_id = run_id.as_session_id().clone();

    store.append(
        SessionRecord::Run {
            id: session_id.clone(),
            created_at: now_iso.to_owned(),
            status: SessionStatus::Running,
            completed_at: None,
            payload: RunRecord {
                base_revision: base_revision.clone(),
                spec_path: request.spec_path.clone(),
                agents: Vec::new(),
                apply_status: None,
                deleted_at: None,
            },
        },
        request.spec_path.clone(),
    )?;

    supervisor
        .register(ActiveContext {
            label: format!("run {}", run_id.as_str()),
            store: Arc::clone(store),
            session_id: session_id.clone(),
            mark_aborted: Box::new({
                let aborted_at = now_iso.to_owned();
                move |mut record| {
                    if let SessionRecord::Run { status, completed_at, payload, .. } = &mut record {
                        *status = SessionStatus::Aborted;
                        *completed_at = Some(aborted_at);
                        for agent in &mut payload.agents {
                            if matches!(agent.status, InvocationStatus::Queued | InvocationStatus::Running) {
                                agent.status = InvocationStatus::Aborted;
                                agent.warnings.push(ABORT_WARNING.to_owned());
                            }
                        }
                    }
                    record
                }
            }),
            staged_auths: Vec::new(),
        })
        .await;

    let spec_text = std::fs::read_to_string(&request.spec_abs_path)
        .with_context(|| format!("reading spec at {}", request.spec_abs_path.display()))?;

    let mut candidates = Vec::with_capacity(request.agents.len());
    for agent in &request.agents {
        let workspace_rel = paths::agent_subdir(Domain::Runs, &session_id, &agent.id, "workspace")?;
        let workspace = request.repo_root.join(&workspace_rel);
        repo.worktree_add(&workspace, &base_revision)
            .with_context(|| format!("creating worktree for agent `{}`", agent.id))?;

        store.rewrite(&session_id, {
            let agent = agent.clone();
            move |mut record| {
                if let SessionRecord::Run { payload, .. } = &mut record {
                    payload
                        .agents
                        .push(AgentInvocationRecord::queued(agent.id.clone(), agent.model.clone()));
                }
                record
            }
        })?;

        candidates.push(RunCandidate {
            agent: agent.clone(),
            workspace,
        });
    }
    store.flush(&session_id)?;

    let adapter = RunAdapter {
        repo,
        store,
        session_id: session_id.clone(),
        repo_root: request.repo_root.clone(),
        base_revision,
        spec_text,
        evals: request.evals,
        watchdog_configs: request.watchdog_configs,
        operator_home: request.operator_home,
        environment: request.environment,
        all_agent_ids: request.agents.iter().map(|a| a.id.clone()).collect(),
    };

    let outcome = run_competition(&adapter, candidates, request.max_parallel.max(1)).await;
    let (status, succeeded) = finalize_status(&outcome);

    store.rewrite(&session_id, move |mut record| {
        if let SessionRecord::Run { status: s, completed_at, .. } = &mut record {
            *s = status;
            *completed_at = Some(now_iso.to_owned());
        }
        record
    })?;
    store.flush(&session_id)?;
    store.dispose(&session_id);
    supervisor.clear().await;

    Ok(RunHandle { run_id, succeeded })
}

pub(crate) fn precheck_binary(agent: &AgentDefinition) -> anyhow::Result<()> {
    if !agent.binary.exists() {
        bail!(voratiq_core::error::RuntimeError::BinaryMissing {
            agent_id: agent.id.to_string(),
            path: agent.binary.clone(),
        });
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        let metadata = std::fs::metadata(&agent.binary)
            .with_context(|| format!("reading metadata for {}", agent.binary.display()))?;
        if metadata.permissions().mode() & 0o111 == 0 {
            bail!(voratiq_core::error::RuntimeError::BinaryNotExecutable {
                agent_id: agent.id.to_string(),
                path: agent.binary.clone(),
            });
        }
    }
    Ok(())
}

struct RunCandidate {
    agent: AgentDefinition,
    workspace: PathBuf,
}

struct RunPrepared {
    agent: AgentDefinition,
    workspace: PathBuf,
    artifacts_dir: PathBuf,
    evals_dir: PathBuf,
    staged_auth: StagedAuth,
}

struct RunExecutionResult {
    agent_id: AgentId,
    status: InvocationStatus,
    completed_at: String,
    diff_stat: Option<String>,
    evals: Vec<EvalOutcome>,
    artifacts: ArtifactCapture,
    warnings: Vec<String>,
    error: Option<String>,
}

struct RunAdapter<'a> {
    repo: &'a (dyn GitRepo + Send + Sync),
    store: &'a RecordStore,
    session_id: SessionId,
    repo_root: PathBuf,
    base_revision: String,
    spec_text: String,
    evals: Vec<EvalDefinition>,
    watchdog_configs: std::collections::BTreeMap<AgentId, WatchdogConfig>,
    operator_home: PathBuf,
    environment: voratiq_core::config::EnvironmentConfig,
    all_agent_ids: Vec<AgentId>,
}

impl RunAdapter<'_> {
    fn build_prompt(&self, candidate: &RunCandidate) -> String {
        format!(
            "You are competing to implement the following specification.\n\n\
             Base revision: {}\n\
             Workspace: {}\n\n\
             --- SPEC ---\n{}\n",
            self.base_revision,
            candidate.workspace.display(),
            self.spec_text
        )
    }

    fn mark_invocation(
        &self,
        agent_id: &AgentId,
        mutate: impl FnOnce(&mut AgentInvocationRecord) + Send + 'static,
    ) -> Result<(), StoreError> {
        let agent_id = agent_id.clone();
        self.store.rewrite(&self.session_id, move |mut record| {
            if let SessionRecord::Run { payload, .. } = &mut record
                && let Some(invocation) = payload.agents.iter_mut().find(|a| a.agent_id == agent_id)
            {
                mutate(invocation);
            }
            record
        })?;
        Ok(())
    }
}

impl CompetitionAdapter for RunAdapter<'_> {
    type Candidate = RunCandidate;
    type Prepared = RunPrepared;
    type ExecutionResult = RunExecutionResult;
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
            WatchdogOutcome::ChildExited(exit) if exit.success() => {
                (InvocationStatus::Succeeded, None, Vec::new())
            }
            WatchdogOutcome::ChildExited(exit) => (
                InvocationStatus::Failed,
                Some(format!("agent exited with status {exit}")),
                Vec::new(),
            ),
            WatchdogOutcome::Triggered { reason, .. } => {
                (InvocationStatus::Aborted, Some(reason.clone()), vec![reason.clone()])
            }
        };

        let diff_stat = self
            .repo
            .diff_shortstat(&prepared.workspace, &self.base_revision)
            .ok()
            .map(|stat| stat.raw);

        let mut artifacts = ArtifactCapture::default();
        if matches!(status, InvocationStatus::Succeeded) {
            if let Ok(diff) = self.repo.diff(&prepared.workspace, &self.base_revision) {
                let _ = std::fs::write(prepared.artifacts_dir.join("diff.patch"), diff);
                artifacts.diff = true;
            }
            if let Some(summary) = final_message(&stdout_log) {
                artifacts.summary = std::fs::write(prepared.artifacts_dir.join("summary.txt"), summary).is_ok();
            }
        }
        artifacts.stdout = stdout_log.exists();
        artifacts.stderr = stderr_log.exists();

        let evals = if matches!(status, InvocationStatus::Succeeded) {
            run_evals(&self.evals, &prepared.workspace, &prepared.evals_dir).await
        } else {
            Vec::new()
        };

        Ok(RunExecutionResult {
            agent_id: prepared.agent.id.clone(),
            status,
            completed_at: now_iso(),
            diff_stat,
            evals,
            artifacts,
            warnings,
            error,
        })
    }

    async fn on_candidate_completed(&self, result: &Self::ExecutionResult) {
        let agent_id = result.agent_id.clone();
        let status = result.status;
        let completed_at = result.completed_at.clone();
        let diff_stat = result.diff_stat.clone();
        let evals = result.evals.clone();
        let artifacts = result.artifacts.clone();
        let warnings = result.warnings.clone();
        let error = result.error.clone();
        let _ = self.mark_invocation(&agent_id, move |invocation| {
            invocation.status = status;
            invocation.completed_at = Some(completed_at);
            invocation.diff_stat = diff_stat;
            invocation.evals = evals;
            invocation.artifacts = artifacts;
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
        Some(RunExecutionResult {
            agent_id: prepared.agent.id.clone(),
            status: InvocationStatus::Failed,
            completed_at: now_iso(),
            diff_stat: None,
            evals: Vec::new(),
            artifacts: ArtifactCapture::default(),
            warnings: Vec::new(),
            error: Some(error.to_string()),
        })
    }

    async fn finalize_competition(&self, _failed: bool) {
        // Auth teardown happens per-candidate once execution completes,
        // not here: prepare_candidates tears down eagerly on a prepare
        // failure, and each execute_candidate's staged auth is torn down
        // by the caller-visible RunPrepared drop below.
    }
}

impl RunAdapter<'_> {
    fn prepare_one(&self, candidate: RunCandidate) -> anyhow::Result<RunPrepared> {
        for subdir in ["artifacts", "runtime", "evals"] {
            let rel = paths::agent_subdir(Domain::Runs, &self.session_id, &candidate.agent.id, subdir)?;
            std::fs::create_dir_all(self.repo_root.join(rel))?;
        }
        let sandbox_rel =
            paths::agent_subdir(Domain::Runs, &self.session_id, &candidate.agent.id, "sandbox")?;
        let sandbox_root = self.repo_root.join(sandbox_rel);

        let mut staged_auth = auth::resolve_provider(candidate.agent.provider, &self.operator_home)
            .stage(&sandbox_root, candidate.agent.id.as_str())?;
        auth::apply_environment_overlay(&mut staged_auth.env_overrides, &self.environment);

        let artifacts_dir = self.repo_root.join(paths::agent_subdir(
            Domain::Runs,
            &self.session_id,
            &candidate.agent.id,
            "artifacts",
        )?);
        let evals_dir = self.repo_root.join(paths::agent_subdir(
            Domain::Runs,
            &self.session_id,
            &candidate.agent.id,
            "evals",
        )?);
        let runtime_dir = self.repo_root.join(paths::agent_subdir(
            Domain::Runs,
            &self.session_id,
            &candidate.agent.id,
            "runtime",
        )?);

        let sibling_session_dirs = self
            .all_agent_ids
            .iter()
            .filter(|id| **id != candidate.agent.id)
            .map(|id| {
                paths::agent_root(Domain::Runs, &self.session_id, id).map(|rel| self.repo_root.join(rel))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let policy = sandbox::baseline_policy(
            &self.repo_root,
            &candidate.workspace,
            &staged_auth.sandbox_path,
            &staged_auth.sandbox_path.join("tmp"),
            &sibling_session_dirs,
        );
        let _ = std::fs::write(
            runtime_dir.join("sandbox.json"),
            serde_json::to_string_pretty(&policy)?,
        );
        let manifest = serde_json::json!({
            "agent_id": candidate.agent.id.as_str(),
            "model": candidate.agent.model,
            "provider": candidate.agent.provider,
            "binary": candidate.agent.binary,
        });
        let _ = std::fs::write(
            runtime_dir.join("manifest.json"),
            serde_json::to_string_pretty(&manifest)?,
        );

        let prompt = self.build_prompt(&candidate);
        let _ = std::fs::write(runtime_dir.join("prompt.ephemeral.txt"), prompt);

        Ok(RunPrepared {
            agent: candidate.agent,
            workspace: candidate.workspace,
            artifacts_dir,
            evals_dir,
            staged_auth,
        })
    }
}

impl Drop for RunPrepared {
    fn drop(&mut self) {
        self.staged_auth.teardown();
    }
}

/// Derive the session's final status from the competition outcome: succeeded
/// iff every candidate's result (not just the aggregate `failed` flag) is
/// [`InvocationStatus::Succeeded`].
fn finalize_status(
    outcome: &CompetitionOutcome<RunExecutionResult, anyhow::Error>,
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

/// Take the agent's final message as the trailing non-empty block of its
/// captured stdout: the last run of contiguous non-blank lines.
fn final_message(stdout_log: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(stdout_log).ok()?;
    let lines: Vec<&str> = contents.lines().collect();
    let end = lines.iter().rposition(|line| !line.trim().is_empty())? + 1;
    let start = lines[..end]
        .iter()
        .rposition(|line| line.trim().is_empty())
        .map_or(0, |i| i + 1);
    let block = lines[start..end].join("\n");
    if block.trim().is_empty() { None } else { Some(block) }
}

fn default_watchdog_config() -> WatchdogConfig {
    let defaults = voratiq_core::config::SandboxConfig::default();
    WatchdogConfig::from_sandbox_config(&defaults, voratiq_core::model::VendorProvider::None)
}

async fn run_evals(evals: &[EvalDefinition], workspace: &Path, evals_dir: &Path) -> Vec<EvalOutcome> {
    let mut outcomes = Vec::with_capacity(evals.len());
    for eval in evals {
        let log_path = evals_dir.join(format!("{}.log", eval.slug));
        let output = tokio::time::timeout(
            std::time::Duration::from_secs(u64::from(eval.timeout_seconds)),
            tokio::process::Command::new(&eval.command)
                .args(&eval.args)
                .current_dir(workspace)
                .output(),
        )
        .await;

        let (status, exit_code, has_log) = match output {
            Ok(Ok(output)) => {
                let mut log = output.stdout.clone();
                log.extend_from_slice(&output.stderr);
                let has_log = std::fs::write(&log_path, log).is_ok();
                let status = if output.status.success() {
                    EvalStatus::Passed
                } else {
                    EvalStatus::Failed
                };
                (status, output.status.code(), has_log)
            }
            Ok(Err(_)) | Err(_) => (EvalStatus::Failed, None, false),
        };

        outcomes.push(EvalOutcome {
            slug: eval.slug.clone(),
            status,
            exit_code,
            has_log,
        });
    }
    outcomes
}

/// Per-invocation timestamps use the system clock directly; `created_at` on
/// the session itself is supplied by the caller, kept deterministic for
/// tests.
fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precheck_binary_rejects_missing_path() {
        let agent = AgentDefinition {
            id: AgentId::new("claude-fast").unwrap(),
            provider: voratiq_core::model::VendorProvider::None,
            model: "m".to_owned(),
            binary: PathBuf::from("/nonexistent/binary"),
            argv_template: vec!["MODEL_PLACEHOLDER".to_owned()],
            extra_args: vec![],
            enabled: true,
        };
        assert!(precheck_binary(&agent).is_err());
    }

    fn dummy_result(agent_id: &str, status: InvocationStatus) -> RunExecutionResult {
        RunExecutionResult {
            agent_id: AgentId::new(agent_id).unwrap(),
            status,
            completed_at: "2026-01-01T00:00:00Z".to_owned(),
            diff_stat: None,
            evals: Vec::new(),
            artifacts: ArtifactCapture::default(),
            warnings: Vec::new(),
            error: None,
        }
    }

    #[test]
    fn finalize_status_succeeds_only_when_every_result_succeeded() {
        let outcome = CompetitionOutcome::Completed {
            results: vec![
                Ok(dummy_result("a", InvocationStatus::Succeeded)),
                Ok(dummy_result("b", InvocationStatus::Succeeded)),
            ],
            failed: false,
        };
        assert_eq!(finalize_status(&outcome), (SessionStatus::Succeeded, true));
    }

    #[test]
    fn finalize_status_fails_when_any_agent_failed() {
        let outcome = CompetitionOutcome::Completed {
            results: vec![
                Ok(dummy_result("a", InvocationStatus::Succeeded)),
                Ok(dummy_result("b", InvocationStatus::Failed)),
            ],
            failed: false,
        };
        assert_eq!(finalize_status(&outcome), (SessionStatus::Failed, false));
    }

    #[test]
    fn finalize_status_fails_when_any_agent_aborted() {
        let outcome = CompetitionOutcome::Completed {
            results: vec![Ok(dummy_result("a", InvocationStatus::Aborted))],
            failed: false,
        };
        assert_eq!(finalize_status(&outcome), (SessionStatus::Failed, false));
    }

    #[test]
    fn finalize_status_fails_on_prepare_failure() {
        let outcome: CompetitionOutcome<RunExecutionResult, anyhow::Error> =
            CompetitionOutcome::PrepareFailed {
                ready: Vec::new(),
                failures: vec![anyhow::anyhow!("boom")],
            };
        assert_eq!(finalize_status(&outcome), (SessionStatus::Failed, false));
    }
}
