//! `voratiq review`: blindly review a completed run.

use clap::Args as ClapArgs;

use voratiq_core::model::{RunId, SessionRecord};
use voratiq_core::paths;

use crate::context::Context;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// The run to review.
    #[arg(long = "run")]
    pub run_id: String,

    /// Reviewer agent; exactly one is required.
    #[arg(long = "agent")]
    pub agents: Vec<String>,

    /// Named config profile override (currently a no-op; reserved for
    /// future per-profile config sets).
    #[arg(long)]
    pub profile: Option<String>,
}

/// # Errors
/// Returns an error if the run cannot be found, more or fewer than one
/// reviewer is resolved, or the review pipeline fails.
pub async fn run(ctx: &Context, args: Args) -> anyhow::Result<()> {
    let run_id = RunId::new(args.run_id.clone())?;

    let reviewers = super::resolve_agents(ctx, &args.agents, &ctx.orchestration.review.agents)?;
    if reviewers.len() != 1 {
        anyhow::bail!("review requires exactly one reviewer agent, got {}", reviewers.len());
    }

    let run_record = load_run_record(ctx, &run_id)?;
    let spec_abs_path = paths::resolve_within_root(&ctx.repo_root, &run_record.spec_path)?;

    let watchdog_configs = super::watchdog_configs(ctx, &reviewers);
    let max_parallel = ctx.orchestration.max_parallel;

    let request = voratiq::review::ReviewRequest {
        repo_root: ctx.repo_root.clone(),
        run_id: run_id.clone(),
        run_record,
        spec_abs_path,
        reviewers,
        watchdog_configs,
        max_parallel,
        operator_home: ctx.operator_home.clone(),
        environment: ctx.environment.clone(),
    };

    let now_iso = super::now_iso();
    let id_timestamp = super::id_timestamp();
    let handle = voratiq::review::run(&ctx.repo, &ctx.reviews, &ctx.supervisor, request, &now_iso, &id_timestamp).await?;

    println!("review: {}", handle.review_id.as_str());
    if handle.succeeded {
        println!("status: succeeded");
        Ok(())
    } else {
        anyhow::bail!("review `{}` did not succeed; see `voratiq list --run {}`", handle.review_id.as_str(), run_id.as_str())
    }
}

fn load_run_record(ctx: &Context, run_id: &RunId) -> anyhow::Result<voratiq_core::model::RunRecord> {
    let matches = ctx.runs.read(
        |record| matches!(record, SessionRecord::Run { id, .. } if id.as_str() == run_id.as_str()),
        1,
        |warning| eprintln!("warning: {warning}"),
    );
    matches
        .into_iter()
        .find_map(|record| match record {
            SessionRecord::Run { payload, .. } => Some(payload),
            _ => None,
        })
        .ok_or_else(|| anyhow::anyhow!("run `{}` was not found", run_id.as_str()))
}
