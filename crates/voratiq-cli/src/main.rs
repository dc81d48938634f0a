use clap::{Parser, Subcommand};

mod commands;
mod context;

use context::Context;

/// Orchestrates competing coding agents, reviews their work blindly, and
/// applies the winner.
///
/// WORKFLOW:
///
///   voratiq init
///   voratiq spec --description "add rate limiting to the API" --agent claude
///   voratiq run --spec .voratiq/specs/add-rate-limiting.md --agent claude --agent codex
///   voratiq review --run <run-id> --agent claude
///   voratiq apply --run <run-id> --agent codex --commit
///
/// Or the whole run/review/apply chain in one call:
///
///   voratiq auto --spec .voratiq/specs/add-rate-limiting.md \
///     --run-agent claude --run-agent codex --review-agent claude --apply --commit
#[derive(Parser)]
#[command(name = "voratiq")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'voratiq <command> --help' for more information on a specific command.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold `.voratiq/` in the current repository
    Init(commands::init::Args),

    /// Draft a spec document with one agent
    Spec(commands::spec::Args),

    /// Run a competition of agents against a spec
    Run(commands::run::Args),

    /// Blindly review a completed run
    Review(commands::review::Args),

    /// Apply one agent's diff from a completed run
    Apply(commands::apply::Args),

    /// List recent sessions
    List(commands::list::Args),

    /// Soft-delete (or purge) sessions
    Prune(commands::prune::Args),

    /// Run, review, and optionally apply in one call
    Auto(commands::auto::Args),

    /// Generate shell completions
    #[command(hide = true)]
    Completions(commands::completions::Args),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::process::ExitCode {
    let _guard = voratiq::telemetry::init();
    match dispatch().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            print_error(&err);
            std::process::ExitCode::FAILURE
        }
    }
}

async fn dispatch() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init(args) => commands::init::run(&args),
        Commands::Completions(args) => commands::completions::run(&args),
        Commands::Spec(args) => {
            let ctx = Context::load()?;
            run_with_ctrl_c(&ctx, commands::spec::run(&ctx, args)).await
        }
        Commands::Run(args) => {
            let ctx = Context::load()?;
            run_with_ctrl_c(&ctx, commands::run::run(&ctx, args)).await
        }
        Commands::Review(args) => {
            let ctx = Context::load()?;
            run_with_ctrl_c(&ctx, commands::review::run(&ctx, args)).await
        }
        Commands::Apply(args) => commands::apply::run(&Context::load()?, args),
        Commands::List(args) => commands::list::run(&Context::load()?, &args),
        Commands::Prune(args) => commands::prune::run(&Context::load()?, &args),
        Commands::Auto(args) => {
            let ctx = Context::load()?;
            run_with_ctrl_c(&ctx, commands::auto::run(&ctx, args)).await
        }
    }
}

/// Race a supervised command against `Ctrl-C`. On signal, terminate the
/// active run/review/spec in flight (marking in-flight agents aborted and
/// force-flushing) and return an error instead of waiting for the command
/// future to resolve on its own.
async fn run_with_ctrl_c<F>(ctx: &Context, command: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    tokio::select! {
        result = command => result,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
            }
            ctx.supervisor.terminate(voratiq::supervisor::TerminationStatus::ExternalSignal).await;
            anyhow::bail!("interrupted")
        }
    }
}

fn print_error(err: &anyhow::Error) {
    eprintln!("error: {err}");
    for cause in err.chain().skip(1) {
        eprintln!("  caused by: {cause}");
    }
}
