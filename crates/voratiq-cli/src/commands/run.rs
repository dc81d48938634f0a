//! `voratiq run`: compete agents against a spec.

use clap::Args as ClapArgs;

use voratiq_core::paths;

use crate::context::Context;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Repo-relative path to the spec document.
    #[arg(long)]
    pub spec: String,

    /// Competing agent; repeatable. Defaults to the configured run stage.
    #[arg(long = "agent")]
    pub agents: Vec<String>,

    /// Named config profile override (currently a no-op; reserved for
    /// future per-profile config sets).
    #[arg(long)]
    pub profile: Option<String>,

    /// Override the configured maximum parallelism.
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Reserved for branch-based (rather than worktree-based) isolation.
    /// Currently a no-op.
    #[arg(long)]
    pub branch: bool,
}

/// # Errors
/// Returns an error if the spec cannot be read, no agent can be resolved,
/// or the competition fails to start.
pub async fn run(ctx: &Context, args: Args) -> anyhow::Result<()> {
    let spec_abs_path = paths::resolve_within_root(&ctx.repo_root, &args.spec)?;
    if !spec_abs_path.is_file() {
        anyhow::bail!("spec `{}` does not exist", args.spec);
    }

    let agents = super::resolve_agents(ctx, &args.agents, &ctx.orchestration.run.agents)?;
    let watchdog_configs = super::watchdog_configs(ctx, &agents);
    let max_parallel = args.max_parallel.unwrap_or(ctx.orchestration.max_parallel);

    let request = voratiq::run::RunRequest {
        repo_root: ctx.repo_root.clone(),
        spec_path: args.spec.clone(),
        spec_abs_path,
        agents,
        evals: ctx.evals.evals.clone(),
        watchdog_configs,
        max_parallel,
        operator_home: ctx.operator_home.clone(),
        environment: ctx.environment.clone(),
    };

    let now_iso = super::now_iso();
    let id_timestamp = super::id_timestamp();
    let handle = voratiq::run::run(&ctx.repo, &ctx.runs, &ctx.supervisor, request, &now_iso, &id_timestamp).await?;

    println!("run: {}", handle.run_id.as_str());
    if handle.succeeded {
        println!("status: succeeded");
        Ok(())
    } else {
        println!("status: failed (at least one agent did not complete cleanly)");
        anyhow::bail!("run `{}` did not fully succeed; see `voratiq list --run {}`", handle.run_id.as_str(), handle.run_id.as_str())
    }
}
