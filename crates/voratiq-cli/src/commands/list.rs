//! `voratiq list`: list recent sessions across all three domains.

use clap::Args as ClapArgs;

use voratiq_core::model::SessionRecord;

use crate::context::Context;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Maximum sessions to show per domain.
    #[arg(long, default_value_t = 10)]
    pub limit: usize,

    /// Only show runs against this spec path.
    #[arg(long)]
    pub spec: Option<String>,

    /// Only show sessions related to this run id (the run itself and any
    /// reviews of it).
    #[arg(long = "run")]
    pub run_id: Option<String>,

    /// Include pruned runs in the listing.
    #[arg(long)]
    pub include_pruned: bool,
}

/// # Errors
/// Returns an error if a run id filter is malformed.
pub fn run(ctx: &Context, args: &Args) -> anyhow::Result<()> {
    let run_filter = args.run_id.as_deref();

    println!("RUNS");
    let runs = ctx.runs.read(
        |record| matches_run_filters(record, args),
        args.limit,
        |warning| eprintln!("warning: {warning}"),
    );
    for record in &runs {
        print_record(record);
    }
    if runs.is_empty() {
        println!("  (none)");
    }

    println!();
    println!("SPECS");
    let specs = ctx.specs.read(
        |record| matches!(record, SessionRecord::Spec { .. }),
        args.limit,
        |warning| eprintln!("warning: {warning}"),
    );
    for record in &specs {
        print_record(record);
    }
    if specs.is_empty() {
        println!("  (none)");
    }

    println!();
    println!("REVIEWS");
    let reviews = ctx.reviews.read(
        |record| match record {
            SessionRecord::Review { payload, .. } => {
                run_filter.is_none_or(|rid| payload.run_id.as_str() == rid)
            }
            _ => false,
        },
        args.limit,
        |warning| eprintln!("warning: {warning}"),
    );
    for record in &reviews {
        print_record(record);
    }
    if reviews.is_empty() {
        println!("  (none)");
    }

    Ok(())
}

fn matches_run_filters(record: &SessionRecord, args: &Args) -> bool {
    let SessionRecord::Run { id, payload, .. } = record else {
        return false;
    };
    if !args.include_pruned && payload.deleted_at.is_some() {
        return false;
    }
    if let Some(spec) = &args.spec {
        if &payload.spec_path != spec {
            return false;
        }
    }
    if let Some(run_id) = &args.run_id {
        if id.as_str() != run_id {
            return false;
        }
    }
    true
}

fn print_record(record: &SessionRecord) {
    let completed = record.completed_at().map_or("-", String::as_str);
    println!(
        "  {:<24} {:<10?} {:<20} {}",
        record.id().as_str(),
        record.status(),
        record.created_at(),
        completed
    );
}
