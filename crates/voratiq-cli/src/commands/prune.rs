//! `voratiq prune`: soft-delete (or purge) completed runs.

use std::io::Write as _;

use clap::Args as ClapArgs;

use voratiq_core::model::{RunId, SessionId, SessionRecord, SessionStatus};
use voratiq_core::paths;

use crate::context::Context;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Prune a single run.
    #[arg(long = "run", conflicts_with = "all")]
    pub run_id: Option<String>,

    /// Prune every terminal run.
    #[arg(long)]
    pub all: bool,

    /// Also delete the session's directory tree from disk.
    #[arg(long)]
    pub purge: bool,

    /// Skip the confirmation prompt.
    #[arg(short = 'y', long = "yes")]
    pub yes: bool,
}

/// # Errors
/// Returns an error if neither `--run` nor `--all` is given, the named run
/// cannot be found, or the prune cannot be persisted.
pub fn run(ctx: &Context, args: &Args) -> anyhow::Result<()> {
    let candidates = match (&args.run_id, args.all) {
        (Some(run_id), false) => {
            let run_id = RunId::new(run_id.clone())?;
            vec![find_terminal_run(ctx, &run_id)?]
        }
        (None, true) => ctx
            .runs
            .read(
                |record| matches!(record, SessionRecord::Run { status, payload, .. } if status.is_terminal() && payload.deleted_at.is_none()),
                usize::MAX,
                |warning| eprintln!("warning: {warning}"),
            )
            .into_iter()
            .filter_map(|record| match record {
                SessionRecord::Run { id, .. } => Some(id),
                _ => None,
            })
            .collect(),
        _ => anyhow::bail!("pass exactly one of `--run <id>` or `--all`"),
    };

    if candidates.is_empty() {
        println!("nothing to prune");
        return Ok(());
    }

    if !args.yes {
        print!(
            "about to prune {} run(s){}. Continue? [y/N] ",
            candidates.len(),
            if args.purge { " and delete their session directories" } else { "" }
        );
        std::io::stdout().flush().ok();
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("aborted");
            return Ok(());
        }
    }

    for session_id in &candidates {
        prune_one(ctx, session_id, args.purge)?;
        println!("pruned {}", session_id.as_str());
    }

    Ok(())
}

fn find_terminal_run(ctx: &Context, run_id: &RunId) -> anyhow::Result<SessionId> {
    ctx.runs
        .read(
            |record| matches!(record, SessionRecord::Run { id, .. } if id.as_str() == run_id.as_str()),
            1,
            |warning| eprintln!("warning: {warning}"),
        )
        .into_iter()
        .find_map(|record| match record {
            SessionRecord::Run { id, status, .. } if status.is_terminal() => Some(id),
            _ => None,
        })
        .ok_or_else(|| anyhow::anyhow!("run `{}` was not found, or is still in progress", run_id.as_str()))
}

fn prune_one(ctx: &Context, session_id: &SessionId, purge: bool) -> anyhow::Result<()> {
    let deleted_at = super::now_iso();
    ctx.runs.rewrite(session_id, move |mut record| {
        if let SessionRecord::Run { status, payload, .. } = &mut record {
            *status = SessionStatus::Pruned;
            payload.deleted_at = Some(deleted_at.clone());
        }
        record
    })?;
    ctx.runs.flush(session_id)?;
    ctx.runs.dispose(session_id);

    if purge {
        let session_dir = ctx.repo_root.join(paths::session_dir(voratiq_core::paths::Domain::Runs, session_id)?);
        if session_dir.is_dir() {
            std::fs::remove_dir_all(&session_dir)?;
        }
    }

    Ok(())
}
