//! `voratiq auto`: run, review, and optionally apply in one call.

use clap::Args as ClapArgs;

use voratiq_core::model::SessionRecord;
use voratiq_core::paths;

use crate::context::Context;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Repo-relative path to the spec document.
    #[arg(long)]
    pub spec: String,

    /// Competing agent; repeatable. Defaults to the configured run stage.
    #[arg(long = "run-agent")]
    pub run_agents: Vec<String>,

    /// Reviewer agent; defaults to the configured review stage (exactly
    /// one is required).
    #[arg(long = "review-agent")]
    pub review_agent: Option<String>,

    /// Named config profile override (currently a no-op; reserved for
    /// future per-profile config sets).
    #[arg(long)]
    pub profile: Option<String>,

    /// Apply the reviewer's recommended candidate once the review
    /// completes.
    #[arg(long)]
    pub apply: bool,

    /// Commit the applied diff. Requires `--apply`.
    #[arg(long, requires = "apply")]
    pub commit: bool,
}

/// # Errors
/// Returns an error if any stage of the run/review/apply chain fails.
pub async fn run(ctx: &Context, args: Args) -> anyhow::Result<()> {
    let spec_abs_path = paths::resolve_within_root(&ctx.repo_root, &args.spec)?;
    if !spec_abs_path.is_file() {
        anyhow::bail!("spec `{}` does not exist", args.spec);
    }

    let run_agents = super::resolve_agents(ctx, &args.run_agents, &ctx.orchestration.run.agents)?;
    let run_watchdog_configs = super::watchdog_configs(ctx, &run_agents);

    let run_request = voratiq::run::RunRequest {
        repo_root: ctx.repo_root.clone(),
        spec_path: args.spec.clone(),
        spec_abs_path: spec_abs_path.clone(),
        agents: run_agents,
        evals: ctx.evals.evals.clone(),
        watchdog_configs: run_watchdog_configs,
        max_parallel: ctx.orchestration.max_parallel,
        operator_home: ctx.operator_home.clone(),
        environment: ctx.environment.clone(),
    };

    let now_iso = super::now_iso();
    let id_timestamp = super::id_timestamp();
    let run_handle = voratiq::run::run(&ctx.repo, &ctx.runs, &ctx.supervisor, run_request, &now_iso, &id_timestamp).await?;
    println!("run: {}", run_handle.run_id.as_str());
    if !run_handle.succeeded {
        anyhow::bail!("run `{}` did not fully succeed; stopping before review", run_handle.run_id.as_str());
    }

    let review_requested = args.review_agent.clone().into_iter().collect::<Vec<_>>();
    let reviewers = super::resolve_agents(ctx, &review_requested, &ctx.orchestration.review.agents)?;
    if reviewers.len() != 1 {
        anyhow::bail!("auto requires exactly one reviewer agent, got {}", reviewers.len());
    }

    let run_record = load_run_record(ctx, &run_handle.run_id)?;
    let review_watchdog_configs = super::watchdog_configs(ctx, &reviewers);

    let review_request = voratiq::review::ReviewRequest {
        repo_root: ctx.repo_root.clone(),
        run_id: run_handle.run_id.clone(),
        run_record,
        spec_abs_path,
        reviewers,
        watchdog_configs: review_watchdog_configs,
        max_parallel: ctx.orchestration.max_parallel,
        operator_home: ctx.operator_home.clone(),
        environment: ctx.environment.clone(),
    };

    let now_iso = super::now_iso();
    let id_timestamp = super::id_timestamp();
    let review_handle = voratiq::review::run(&ctx.repo, &ctx.reviews, &ctx.supervisor, review_request, &now_iso, &id_timestamp).await?;
    println!("review: {}", review_handle.review_id.as_str());
    if !review_handle.succeeded {
        anyhow::bail!("review `{}` did not succeed; stopping before apply", review_handle.review_id.as_str());
    }

    if args.apply {
        let winner = load_recommended_agent(ctx, &review_handle.review_id)?;
        let apply_args = super::apply::Args {
            run_id: run_handle.run_id.as_str().to_owned(),
            agent: winner.as_str().to_owned(),
            ignore_base_mismatch: false,
            commit: args.commit,
        };
        super::apply::run(ctx, apply_args)?;
    }

    Ok(())
}

fn load_run_record(ctx: &Context, run_id: &voratiq_core::model::RunId) -> anyhow::Result<voratiq_core::model::RunRecord> {
    ctx.runs
        .read(
            |record| matches!(record, SessionRecord::Run { id, .. } if id.as_str() == run_id.as_str()),
            1,
            |warning| eprintln!("warning: {warning}"),
        )
        .into_iter()
        .find_map(|record| match record {
            SessionRecord::Run { payload, .. } => Some(payload),
            _ => None,
        })
        .ok_or_else(|| anyhow::anyhow!("run `{}` was not found", run_id.as_str()))
}

/// The top-ranked real agent id from the reviewer's de-aliased
/// recommendation.
fn load_recommended_agent(
    ctx: &Context,
    review_id: &voratiq_core::model::ReviewId,
) -> anyhow::Result<voratiq_core::model::AgentId> {
    let review_record = ctx
        .reviews
        .read(
            |record| matches!(record, SessionRecord::Review { id, .. } if id.as_str() == review_id.as_str()),
            1,
            |warning| eprintln!("warning: {warning}"),
        )
        .into_iter()
        .find_map(|record| match record {
            SessionRecord::Review { payload, .. } => Some(payload),
            _ => None,
        })
        .ok_or_else(|| anyhow::anyhow!("review `{}` was not found", review_id.as_str()))?;

    let reviewer = review_record
        .reviewers
        .first()
        .ok_or_else(|| anyhow::anyhow!("review `{}` has no reviewer invocations", review_id.as_str()))?;

    let recommendation_rel = paths::agent_subdir(
        paths::Domain::Reviews,
        review_id.as_session_id(),
        &reviewer.agent_id,
        "artifacts",
    )?;
    let recommendation_path = ctx.repo_root.join(recommendation_rel).join("recommendation.json");
    let raw = std::fs::read_to_string(&recommendation_path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", recommendation_path.display()))?;
    let doc: serde_json::Value = serde_json::from_str(&raw)?;
    let top_pick = doc
        .get("resolved_preferred_agents")
        .and_then(serde_json::Value::as_array)
        .and_then(|agents| agents.first())
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("recommendation.json has no resolved `preferred_agents`"))?;

    voratiq_core::model::AgentId::new(top_pick.to_owned()).map_err(Into::into)
}
