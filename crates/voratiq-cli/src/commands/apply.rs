//! `voratiq apply`: apply one agent's diff from a completed run.

use clap::Args as ClapArgs;

use voratiq_core::model::{AgentId, ApplyOutcome, ApplyStatus, RunId, RunRecord, SessionId, SessionRecord};
use voratiq_core::paths::{self, Domain};
use voratiq_git::GitRepo;

use crate::context::Context;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// The run to apply from.
    #[arg(long = "run")]
    pub run_id: String,

    /// The winning agent whose diff to apply.
    #[arg(long)]
    pub agent: String,

    /// Apply even if the repository's current `HEAD` has moved past the
    /// run's recorded base revision.
    #[arg(long)]
    pub ignore_base_mismatch: bool,

    /// Commit the applied diff with the agent's `summary.txt` as message.
    #[arg(long)]
    pub commit: bool,
}

/// # Errors
/// Returns an error if the run or agent cannot be found, the base revision
/// has diverged (without `--ignore-base-mismatch`), or the patch does not
/// apply cleanly.
pub fn run(ctx: &Context, args: Args) -> anyhow::Result<()> {
    let run_id = RunId::new(args.run_id.clone())?;
    let agent_id = AgentId::new(args.agent.clone())?;

    let (session_id, payload) = find_run(ctx, &run_id)?;
    let session_id = &session_id;
    let payload = &payload;

    let invocation = payload
        .agents
        .iter()
        .find(|a| a.agent_id == agent_id)
        .ok_or_else(|| anyhow::anyhow!("agent `{}` did not participate in run `{}`", agent_id, run_id.as_str()))?;

    if !invocation.artifacts.diff {
        anyhow::bail!("agent `{agent_id}` has no captured diff for run `{}`", run_id.as_str());
    }

    if !args.ignore_base_mismatch {
        let head = ctx.repo.rev_parse("HEAD")?;
        if head != payload.base_revision {
            let detail = format!(
                "HEAD ({head}) has diverged from the run's base revision ({})",
                payload.base_revision
            );
            record_apply_status(ctx, session_id, &agent_id, ApplyOutcome::BaseMismatch, Some(detail.clone()))?;
            anyhow::bail!("{detail}\n  Pass `--ignore-base-mismatch` to apply anyway");
        }
    }

    let diff_path = ctx.repo_root.join(paths::agent_subdir(Domain::Runs, session_id, &agent_id, "artifacts")?).join("diff.patch");
    let patch = std::fs::read_to_string(&diff_path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", diff_path.display()))?;

    let apply_result = ctx.repo.apply(&patch);
    let (outcome, detail) = match &apply_result {
        Ok(()) => (ApplyOutcome::Applied, None),
        Err(e) => (ApplyOutcome::Conflict, Some(e.to_string())),
    };
    record_apply_status(ctx, session_id, &agent_id, outcome, detail)?;
    apply_result.map_err(|e| anyhow::anyhow!("applying diff from `{agent_id}`: {e}"))?;
    println!("applied diff from `{agent_id}` onto the working tree");

    if args.commit {
        let summary_path = ctx.repo_root.join(paths::agent_subdir(Domain::Runs, session_id, &agent_id, "artifacts")?).join("summary.txt");
        let message = std::fs::read_to_string(&summary_path)
            .unwrap_or_else(|_| format!("Apply {agent_id}'s changes from run {}", run_id.as_str()));
        let sha = ctx.repo.commit_all(message.trim())?;
        println!("committed: {sha}");
    }

    Ok(())
}

fn record_apply_status(
    ctx: &Context,
    session_id: &SessionId,
    agent_id: &AgentId,
    outcome: ApplyOutcome,
    detail: Option<String>,
) -> anyhow::Result<()> {
    let status = ApplyStatus {
        agent_id: agent_id.clone(),
        attempted_at: super::now_iso(),
        outcome,
        detail,
    };
    ctx.runs.rewrite(session_id, move |mut record| {
        if let SessionRecord::Run { payload, .. } = &mut record {
            payload.apply_status = Some(status.clone());
        }
        record
    })?;
    ctx.runs.flush(session_id)?;
    Ok(())
}

fn find_run(ctx: &Context, run_id: &RunId) -> anyhow::Result<(SessionId, RunRecord)> {
    ctx.runs
        .read(
            |record| matches!(record, SessionRecord::Run { id, .. } if id.as_str() == run_id.as_str()),
            1,
            |warning| eprintln!("warning: {warning}"),
        )
        .into_iter()
        .find_map(|record| match record {
            SessionRecord::Run { id, payload, .. } => Some((id, payload)),
            _ => None,
        })
        .ok_or_else(|| anyhow::anyhow!("run `{}` was not found", run_id.as_str()))
}
