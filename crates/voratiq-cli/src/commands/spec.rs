//! `voratiq spec`: draft a spec document with one agent.

use clap::Args as ClapArgs;

use voratiq_core::paths;

use crate::context::Context;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Plain-language description of what the spec should cover.
    #[arg(long)]
    pub description: String,

    /// Drafting agent; defaults to the first enabled run-stage agent.
    #[arg(long)]
    pub agent: Option<String>,

    /// Named config profile override (currently a no-op; reserved for
    /// future per-profile config sets).
    #[arg(long)]
    pub profile: Option<String>,

    /// Human-readable title; the session slug is derived from it. Defaults
    /// to a prefix of the description.
    #[arg(long)]
    pub title: Option<String>,

    /// Repo-relative output path override.
    #[arg(long)]
    pub output: Option<String>,
}

/// # Errors
/// Returns an error if the agent id cannot be resolved or the drafting
/// session fails.
pub async fn run(ctx: &Context, args: Args) -> anyhow::Result<()> {
    let requested = args.agent.clone().into_iter().collect::<Vec<_>>();
    let fallback = ctx.orchestration.run.agents.clone();
    let agents = super::resolve_agents(ctx, &requested, &fallback)?;
    let agent = agents
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no agent available to draft a spec"))?;

    let title = args.title.clone().unwrap_or_else(|| default_title(&args.description));

    let request = voratiq::spec::SpecRequest {
        repo_root: ctx.repo_root.clone(),
        description: args.description,
        watchdog_config: voratiq::watchdog::WatchdogConfig::from_sandbox_config(&ctx.sandbox, agent.provider),
        agent,
        title,
        output_path: args.output,
        operator_home: ctx.operator_home.clone(),
        environment: ctx.environment.clone(),
    };

    let now_iso = super::now_iso();
    let id_timestamp = super::id_timestamp();
    let handle = voratiq::spec::run(&ctx.specs, &ctx.supervisor, request, &now_iso, &id_timestamp).await?;

    println!("spec session: {}", handle.session_id.as_str());
    println!("slug:         {}", handle.slug.as_str());
    println!("output:       {}", paths::to_display_path(std::path::Path::new(&handle.output_path)));
    if handle.succeeded {
        println!("status:       drafted");
        Ok(())
    } else {
        anyhow::bail!("spec drafting did not succeed; see artifacts for {}", handle.session_id.as_str())
    }
}

fn default_title(description: &str) -> String {
    let words: Vec<&str> = description.split_whitespace().take(8).collect();
    if words.is_empty() { "untitled".to_owned() } else { words.join(" ") }
}
