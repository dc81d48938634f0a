//! `voratiq init`: scaffold `.voratiq/` in the current repository.

use std::fs;
use std::path::Path;

use anyhow::Context as _;
use clap::Args as ClapArgs;

use voratiq_core::paths::{Domain, VORATIQ_DIR};

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Starter config preset to scaffold.
    #[arg(long, value_enum, default_value_t = Preset::Lite)]
    pub preset: Preset,

    /// Skip the confirmation prompt.
    #[arg(short = 'y', long = "yes")]
    pub yes: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Preset {
    /// One fast agent, no review stage.
    Lite,
    /// Multiple agents competing, one reviewer.
    Pro,
    /// Empty `agents.yaml`; the operator fills it in by hand.
    Manual,
}

const DEFAULT_EVALS: &str = "evals: []\n";
const DEFAULT_ENVIRONMENT: &str = "extra_env: {}\npath_entries: []\n";
const DEFAULT_SANDBOX: &str = "\
silence_timeout_seconds: 900\n\
wall_clock_cap_seconds: 7200\n\
fatal_pattern_window_seconds: 60\n\
denial_warn_window_seconds: 30\n\
denial_reset_window_seconds: 120\n\
denial_stop_delay_ms: 300\n\
term_grace_seconds: 5\n\
hard_abort_seconds: 10\n\
fatal_patterns: {}\n\
";

/// Scaffold `.voratiq/` with config files and empty session stores (§6).
///
/// # Errors
/// Returns an error if the current directory cannot be read, an existing
/// file would be silently clobbered, or the scaffold cannot be written.
pub fn run(args: &Args) -> anyhow::Result<()> {
    let repo_root = std::env::current_dir().context("resolving the current directory")?;
    let voratiq_dir = repo_root.join(VORATIQ_DIR);

    if voratiq_dir.is_dir() && !args.yes {
        anyhow::bail!(
            "{VORATIQ_DIR}/ already exists in {}\n  Pass `-y` to re-scaffold missing pieces",
            repo_root.display()
        );
    }

    println!("Initializing voratiq...");
    println!();

    write_if_absent(&voratiq_dir.join("agents.yaml"), agents_yaml(args.preset))?;
    write_if_absent(&voratiq_dir.join("evals.yaml"), DEFAULT_EVALS)?;
    write_if_absent(&voratiq_dir.join("environment.yaml"), DEFAULT_ENVIRONMENT)?;
    write_if_absent(&voratiq_dir.join("orchestration.yaml"), orchestration_yaml(args.preset))?;
    write_if_absent(&voratiq_dir.join("sandbox.yaml"), DEFAULT_SANDBOX)?;

    for domain in [Domain::Runs, Domain::Specs, Domain::Reviews] {
        scaffold_domain(&repo_root, domain)?;
    }

    ensure_gitignored(&repo_root)?;

    println!();
    println!("voratiq is ready!");
    println!("  Config: {}/", voratiq_dir.display());
    println!("  Next: voratiq spec --description \"...\" --agent <id>");

    Ok(())
}

fn agents_yaml(preset: Preset) -> String {
    match preset {
        Preset::Manual => "agents: []\n".to_owned(),
        Preset::Lite => "\
agents:
  - id: claude
    provider: anthropic
    model: claude-opus-4
    binary: /usr/local/bin/claude
    argv_template: [\"--model\", \"MODEL_PLACEHOLDER\", \"--print\"]
    enabled: true
"
        .to_owned(),
        Preset::Pro => "\
agents:
  - id: claude
    provider: anthropic
    model: claude-opus-4
    binary: /usr/local/bin/claude
    argv_template: [\"--model\", \"MODEL_PLACEHOLDER\", \"--print\"]
    enabled: true
  - id: codex
    provider: openai
    model: gpt-5-codex
    binary: /usr/local/bin/codex
    argv_template: [\"exec\", \"--model\", \"MODEL_PLACEHOLDER\"]
    enabled: true
"
        .to_owned(),
    }
}

fn orchestration_yaml(preset: Preset) -> String {
    match preset {
        Preset::Manual => "max_parallel: 4\nrun:\n  agents: []\nreview:\n  agents: []\n".to_owned(),
        Preset::Lite => "\
max_parallel: 4
run:
  agents: [claude]
review:
  agents: []
"
        .to_owned(),
        Preset::Pro => "\
max_parallel: 4
run:
  agents: [claude, codex]
review:
  agents: [claude]
"
        .to_owned(),
    }
}

fn write_if_absent(path: &Path, contents: impl AsRef<str>) -> anyhow::Result<()> {
    if path.is_file() {
        println!("[OK] {} already exists", path.display());
        return Ok(());
    }
    fs::write(path, contents.as_ref()).with_context(|| format!("writing {}", path.display()))?;
    println!("[..] wrote {}", path.display());
    Ok(())
}

fn scaffold_domain(repo_root: &Path, domain: Domain) -> anyhow::Result<()> {
    let index_path = repo_root.join(voratiq_core::paths::index_path(domain));
    let sessions_dir = index_path
        .parent()
        .expect("index_path always has a parent")
        .join("sessions");
    fs::create_dir_all(&sessions_dir).with_context(|| format!("creating {}", sessions_dir.display()))?;

    if !index_path.is_file() {
        fs::write(&index_path, "{\"sessions\":[]}\n")
            .with_context(|| format!("writing {}", index_path.display()))?;
        println!("[..] wrote {}", index_path.display());
    } else {
        println!("[OK] {} already exists", index_path.display());
    }
    Ok(())
}

fn ensure_gitignored(repo_root: &Path) -> anyhow::Result<()> {
    let gitignore_path = repo_root.join(".gitignore");
    let entry_lines = [
        format!("{VORATIQ_DIR}/runs/sessions/"),
        format!("{VORATIQ_DIR}/specs/sessions/"),
        format!("{VORATIQ_DIR}/reviews/sessions/"),
    ];

    let existing = if gitignore_path.is_file() {
        fs::read_to_string(&gitignore_path).context("reading .gitignore")?
    } else {
        String::new()
    };

    let missing: Vec<&String> = entry_lines
        .iter()
        .filter(|line| !existing.lines().any(|l| l.trim() == line.as_str()))
        .collect();

    if missing.is_empty() {
        println!("[OK] .voratiq session directories are already gitignored");
        return Ok(());
    }

    let separator = if existing.is_empty() || existing.ends_with('\n') { "" } else { "\n" };
    let mut updated = existing;
    updated.push_str(separator);
    updated.push_str("\n# voratiq session workspaces\n");
    for line in &missing {
        updated.push_str(line);
        updated.push('\n');
    }
    fs::write(&gitignore_path, updated).context("writing .gitignore")?;
    println!("[OK] updated .gitignore");
    Ok(())
}
