//! Repo-rooted context shared by every command: loaded config, one
//! [`RecordStore`] per domain, the run-lifecycle supervisor, and the
//! operator's `$HOME`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;

use voratiq::supervisor::LifecycleSupervisor;
use voratiq_core::config::{AgentsConfig, EnvironmentConfig, EvalsConfig, OrchestrationConfig, SandboxConfig};
use voratiq_core::paths::{Domain, VORATIQ_DIR};
use voratiq_core::store::RecordStore;
use voratiq_git::GixRepo;

pub struct Context {
    pub repo_root: PathBuf,
    pub operator_home: PathBuf,
    pub repo: GixRepo,
    pub agents: AgentsConfig,
    pub evals: EvalsConfig,
    pub environment: EnvironmentConfig,
    pub orchestration: OrchestrationConfig,
    pub sandbox: SandboxConfig,
    pub runs: Arc<RecordStore>,
    pub specs: Arc<RecordStore>,
    pub reviews: Arc<RecordStore>,
    pub supervisor: Arc<LifecycleSupervisor>,
}

impl Context {
    /// Discover the repo root (current directory) and load every
    /// `.voratiq/*.yaml` config file plus a store per domain.
    ///
    /// # Errors
    /// Returns an error if any config file is missing/invalid or if the
    /// orchestration config references an unknown agent.
    pub fn load() -> anyhow::Result<Self> {
        let repo_root = std::env::current_dir().context("resolving the current directory")?;
        let voratiq_dir = repo_root.join(VORATIQ_DIR);
        if !voratiq_dir.is_dir() {
            anyhow::bail!(
                "no {VORATIQ_DIR}/ directory found in {}\n  Try: run `voratiq init` first",
                repo_root.display()
            );
        }

        let agents = AgentsConfig::load(&voratiq_dir.join("agents.yaml"))
            .context("loading .voratiq/agents.yaml")?;
        let evals = EvalsConfig::load(&voratiq_dir.join("evals.yaml"))
            .context("loading .voratiq/evals.yaml")?;
        let environment = EnvironmentConfig::load(&voratiq_dir.join("environment.yaml"))
            .context("loading .voratiq/environment.yaml")?;
        let orchestration = OrchestrationConfig::load(&voratiq_dir.join("orchestration.yaml"))
            .context("loading .voratiq/orchestration.yaml")?;
        orchestration
            .validate_against(&agents)
            .context("validating .voratiq/orchestration.yaml")?;
        let sandbox = SandboxConfig::load(&voratiq_dir.join("sandbox.yaml"))
            .context("loading .voratiq/sandbox.yaml")?;

        let operator_home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .context("$HOME is not set")?;

        Ok(Self {
            repo: GixRepo::open(&repo_root).context("opening the repository")?,
            runs: Arc::new(RecordStore::new(repo_root.clone(), Domain::Runs)),
            specs: Arc::new(RecordStore::new(repo_root.clone(), Domain::Specs)),
            reviews: Arc::new(RecordStore::new(repo_root.clone(), Domain::Reviews)),
            supervisor: LifecycleSupervisor::new(),
            repo_root,
            operator_home,
            agents,
            evals,
            environment,
            orchestration,
            sandbox,
        })
    }

    #[must_use]
    pub fn voratiq_dir(&self) -> PathBuf {
        self.repo_root.join(VORATIQ_DIR)
    }
}
