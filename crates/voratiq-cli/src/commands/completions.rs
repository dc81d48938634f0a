//! `voratiq completions`: generate shell completion scripts.

use clap::{Args as ClapArgs, CommandFactory as _};
use clap_complete::{generate, Shell};

use crate::Cli;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// The shell to generate completions for.
    pub shell: Shell,
}

/// # Errors
/// Never fails; returns `Result` for dispatch uniformity.
pub fn run(args: &Args) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_owned();
    generate(args.shell, &mut cmd, name, &mut std::io::stdout());
    Ok(())
}
