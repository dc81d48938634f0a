//! Per-vendor credential staging (§4.3, C3).
//!
//! Every provider shares the contract `{verify, stage, teardown}`. `stage`
//! builds an ephemeral sandbox `HOME` tree, copies the minimum credential
//! material into it at mode `0600`, and hands back environment overrides the
//! launcher applies to the child process. Every copied secret is tracked as
//! a "secret handle" so teardown can overwrite-then-delete it; on partial
//! failure already-staged handles are disposed before the error propagates.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use voratiq_core::error::RuntimeError;
use voratiq_core::model::VendorProvider;

/// The sandbox HOME subtree every staged provider gets, mirroring a real
/// XDG layout so vendor CLIs that honor `XDG_*` behave normally.
const SANDBOX_HOME_SUBDIRS: [&str; 6] = ["config", "cache", "data", "state", "logs", "tmp"];

/// A secret file copied into a sandbox during staging. Teardown overwrites
/// the file with zero bytes before deleting it.
#[derive(Debug, Clone)]
pub struct SecretHandle {
    path: PathBuf,
}

impl SecretHandle {
    fn dispose(&self) {
        if let Ok(metadata) = fs::metadata(&self.path) {
            let zeros = vec![0_u8; metadata.len() as usize];
            let _ = fs::write(&self.path, zeros);
        }
        let _ = fs::remove_file(&self.path);
    }
}

/// The result of staging one provider's credentials for one agent
/// invocation.
#[derive(Debug, Clone)]
pub struct StagedAuth {
    /// The agent this staging was performed for, for teardown bookkeeping.
    pub provider: VendorProvider,
    /// Environment variables the launcher must set on the child process:
    /// `HOME`, `XDG_*`, `TMPDIR`, and any provider-specific variables.
    pub env_overrides: BTreeMap<String, String>,
    /// The ephemeral sandbox HOME root.
    pub sandbox_path: PathBuf,
    /// Every secret file copied in, for teardown.
    pub secret_handles: Vec<SecretHandle>,
}

impl StagedAuth {
    /// Overwrite and delete every secret handle, then remove the sandbox
    /// tree. Safe to call more than once.
    pub fn teardown(&self) {
        for handle in &self.secret_handles {
            handle.dispose();
        }
        let _ = fs::remove_dir_all(&self.sandbox_path);
    }
}

fn build_sandbox_home(sandbox_home: &Path, agent_id: &str) -> Result<(), RuntimeError> {
    for subdir in SANDBOX_HOME_SUBDIRS {
        fs::create_dir_all(sandbox_home.join(subdir)).map_err(|e| {
            RuntimeError::SandboxStagingFailed {
                agent_id: agent_id.to_owned(),
                detail: format!("failed to create sandbox home subdir `{subdir}`: {e}"),
            }
        })?;
    }
    Ok(())
}

fn copy_secret(
    source: &Path,
    dest: &Path,
    agent_id: &str,
) -> Result<SecretHandle, RuntimeError> {
    let contents = fs::read(source).map_err(|e| RuntimeError::SandboxStagingFailed {
        agent_id: agent_id.to_owned(),
        detail: format!("failed to read credential at {}: {e}", source.display()),
    })?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| RuntimeError::SandboxStagingFailed {
            agent_id: agent_id.to_owned(),
            detail: format!("failed to create {}: {e}", parent.display()),
        })?;
    }
    let mut file = fs::File::create(dest).map_err(|e| RuntimeError::SandboxStagingFailed {
        agent_id: agent_id.to_owned(),
        detail: format!("failed to create {}: {e}", dest.display()),
    })?;
    file.write_all(&contents)
        .map_err(|e| RuntimeError::SandboxStagingFailed {
            agent_id: agent_id.to_owned(),
            detail: format!("failed to write {}: {e}", dest.display()),
        })?;
    set_owner_only_permissions(&file);
    Ok(SecretHandle {
        path: dest.to_owned(),
    })
}

#[cfg(unix)]
fn set_owner_only_permissions(file: &fs::File) {
    use std::os::unix::fs::PermissionsExt as _;
    let _ = file.set_permissions(fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_file: &fs::File) {}

/// Discover, stage, and tear down one vendor's credentials.
///
/// Implementations must not mutate disk in [`verify`](Self::verify); it is
/// a cheap pre-flight invoked once per unique provider in a stage plan.
pub trait AuthProvider {
    /// Confirm credentials are present and plausible without copying
    /// anything.
    ///
    /// # Errors
    /// Returns [`RuntimeError::StaleCredentials`] if nothing usable is
    /// discoverable.
    fn verify(&self) -> Result<(), RuntimeError>;

    /// Build a sandbox HOME under `sandbox_root` and stage credentials into
    /// it for `agent_id`.
    ///
    /// # Errors
    /// Returns [`RuntimeError::SandboxStagingFailed`] if any step fails;
    /// whatever was staged before the failure is disposed first.
    fn stage(&self, sandbox_root: &Path, agent_id: &str) -> Result<StagedAuth, RuntimeError>;
}

fn base_env_overrides(sandbox_home: &Path) -> BTreeMap<String, String> {
    let home = sandbox_home.to_string_lossy().into_owned();
    let mut env = BTreeMap::new();
    env.insert("HOME".to_owned(), home.clone());
    env.insert("XDG_CONFIG_HOME".to_owned(), format!("{home}/config"));
    env.insert("XDG_CACHE_HOME".to_owned(), format!("{home}/cache"));
    env.insert("XDG_DATA_HOME".to_owned(), format!("{home}/data"));
    env.insert("XDG_STATE_HOME".to_owned(), format!("{home}/state"));
    env.insert("TMPDIR".to_owned(), format!("{home}/tmp"));
    env
}

/// Layer `environment.yaml`'s `extra_env`/`path_entries` under staging's own
/// overrides: a provider's credential env always wins over the operator's
/// overlay.
pub fn apply_environment_overlay(
    env_overrides: &mut BTreeMap<String, String>,
    config: &voratiq_core::config::EnvironmentConfig,
) {
    for (key, value) in &config.extra_env {
        env_overrides.entry(key.clone()).or_insert_with(|| value.clone());
    }
    if !config.path_entries.is_empty() {
        let inherited = std::env::var("PATH").unwrap_or_default();
        env_overrides
            .entry("PATH".to_owned())
            .or_insert_with(|| format!("{}:{inherited}", config.path_entries.join(":")));
    }
}

/// Claude credential discovery: on macOS, the login keychain service
/// `claude-service`; elsewhere, an on-disk credential file with an API-key
/// fallback from the vendor config directory.
pub struct AnthropicAuthProvider {
    /// Override for the on-disk credential file (non-macOS path).
    pub credentials_path: PathBuf,
    /// Vendor config directory, staged wholesale if `credentials_path` is
    /// absent.
    pub config_dir: PathBuf,
}

impl AnthropicAuthProvider {
    #[cfg(target_os = "macos")]
    fn read_keychain_credential() -> Result<Option<String>, RuntimeError> {
        let output = std::process::Command::new("security")
            .args(["find-generic-password", "-s", "claude-service", "-w"])
            .output()
            .map_err(|e| RuntimeError::StaleCredentials {
                provider: "anthropic".to_owned(),
                detail: format!("failed to invoke `security`: {e}"),
            })?;
        if output.status.success() {
            Ok(Some(
                String::from_utf8_lossy(&output.stdout).trim().to_owned(),
            ))
        } else {
            Ok(None)
        }
    }

    #[cfg(not(target_os = "macos"))]
    const fn read_keychain_credential() -> Result<Option<String>, RuntimeError> {
        Ok(None)
    }
}

impl AuthProvider for AnthropicAuthProvider {
    fn verify(&self) -> Result<(), RuntimeError> {
        if cfg!(target_os = "macos") {
            return Self::read_keychain_credential()?.map_or_else(
                || {
                    Err(RuntimeError::StaleCredentials {
                        provider: "anthropic".to_owned(),
                        detail: "login keychain item `claude-service` not found; run `claude login`".to_owned(),
                    })
                },
                |_| Ok(()),
            );
        }
        if self.credentials_path.is_file() || self.config_dir.is_dir() {
            Ok(())
        } else {
            Err(RuntimeError::StaleCredentials {
                provider: "anthropic".to_owned(),
                detail: format!(
                    "no credential file at {} and no config dir at {}; run `claude login`",
                    self.credentials_path.display(),
                    self.config_dir.display()
                ),
            })
        }
    }

    fn stage(&self, sandbox_root: &Path, agent_id: &str) -> Result<StagedAuth, RuntimeError> {
        let sandbox_home = sandbox_root.join("home");
        build_sandbox_home(&sandbox_home, agent_id)?;
        let mut handles = Vec::new();

        let result: Result<(), RuntimeError> = (|| {
            if cfg!(target_os = "macos") {
                if let Some(credential) = Self::read_keychain_credential()? {
                    let dest = sandbox_home.join("config/claude/credential");
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent).map_err(|e| {
                            RuntimeError::SandboxStagingFailed {
                                agent_id: agent_id.to_owned(),
                                detail: e.to_string(),
                            }
                        })?;
                    }
                    fs::write(&dest, credential).map_err(|e| {
                        RuntimeError::SandboxStagingFailed {
                            agent_id: agent_id.to_owned(),
                            detail: e.to_string(),
                        }
                    })?;
                    set_owner_only_permissions(&fs::File::open(&dest).map_err(|e| {
                        RuntimeError::SandboxStagingFailed {
                            agent_id: agent_id.to_owned(),
                            detail: e.to_string(),
                        }
                    })?);
                    handles.push(SecretHandle { path: dest });
                    return Ok(());
                }
            }
            if self.credentials_path.is_file() {
                handles.push(copy_secret(
                    &self.credentials_path,
                    &sandbox_home.join("config/claude/credentials.json"),
                    agent_id,
                )?);
            } else if self.config_dir.is_dir() {
                copy_dir_recursive(
                    &self.config_dir,
                    &sandbox_home.join("config/claude"),
                    agent_id,
                    &mut handles,
                )?;
            } else {
                return Err(RuntimeError::StaleCredentials {
                    provider: "anthropic".to_owned(),
                    detail: "no credential source found at stage time".to_owned(),
                });
            }
            Ok(())
        })();

        if let Err(err) = result {
            for handle in &handles {
                handle.dispose();
            }
            let _ = fs::remove_dir_all(&sandbox_home);
            return Err(err);
        }

        Ok(StagedAuth {
            provider: VendorProvider::Anthropic,
            env_overrides: base_env_overrides(&sandbox_home),
            sandbox_path: sandbox_home,
            secret_handles: handles,
        })
    }
}

/// Codex/Gemini-style discovery: copy the vendor's config directory
/// wholesale into the sandbox.
pub struct ConfigDirAuthProvider {
    /// Which provider this instance stages for.
    pub provider: VendorProvider,
    /// The vendor config directory to copy (e.g. `~/.codex`, `~/.gemini`).
    pub config_dir: PathBuf,
}

impl AuthProvider for ConfigDirAuthProvider {
    fn verify(&self) -> Result<(), RuntimeError> {
        if self.config_dir.is_dir() {
            Ok(())
        } else {
            Err(RuntimeError::StaleCredentials {
                provider: format!("{:?}", self.provider).to_lowercase(),
                detail: format!("config directory {} does not exist", self.config_dir.display()),
            })
        }
    }

    fn stage(&self, sandbox_root: &Path, agent_id: &str) -> Result<StagedAuth, RuntimeError> {
        let sandbox_home = sandbox_root.join("home");
        build_sandbox_home(&sandbox_home, agent_id)?;
        let dest_dir_name = format!("{:?}", self.provider).to_lowercase();
        let mut handles = Vec::new();

        let result = copy_dir_recursive(
            &self.config_dir,
            &sandbox_home.join("config").join(dest_dir_name),
            agent_id,
            &mut handles,
        );

        if let Err(err) = result {
            for handle in &handles {
                handle.dispose();
            }
            let _ = fs::remove_dir_all(&sandbox_home);
            return Err(err);
        }

        Ok(StagedAuth {
            provider: self.provider,
            env_overrides: base_env_overrides(&sandbox_home),
            sandbox_path: sandbox_home,
            secret_handles: handles,
        })
    }
}

/// The no-op provider for the `None` vendor tag, used by test fixture
/// agents that need no credentials at all.
pub struct NoneAuthProvider;

impl AuthProvider for NoneAuthProvider {
    fn verify(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn stage(&self, sandbox_root: &Path, agent_id: &str) -> Result<StagedAuth, RuntimeError> {
        let sandbox_home = sandbox_root.join("home");
        build_sandbox_home(&sandbox_home, agent_id)?;
        Ok(StagedAuth {
            provider: VendorProvider::None,
            env_overrides: base_env_overrides(&sandbox_home),
            sandbox_path: sandbox_home,
            secret_handles: Vec::new(),
        })
    }
}

fn copy_dir_recursive(
    source: &Path,
    dest: &Path,
    agent_id: &str,
    handles: &mut Vec<SecretHandle>,
) -> Result<(), RuntimeError> {
    fs::create_dir_all(dest).map_err(|e| RuntimeError::SandboxStagingFailed {
        agent_id: agent_id.to_owned(),
        detail: format!("failed to create {}: {e}", dest.display()),
    })?;
    let entries = fs::read_dir(source).map_err(|e| RuntimeError::SandboxStagingFailed {
        agent_id: agent_id.to_owned(),
        detail: format!("failed to read {}: {e}", source.display()),
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| RuntimeError::SandboxStagingFailed {
            agent_id: agent_id.to_owned(),
            detail: e.to_string(),
        })?;
        let entry_dest = dest.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| RuntimeError::SandboxStagingFailed {
                agent_id: agent_id.to_owned(),
                detail: e.to_string(),
            })?;
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &entry_dest, agent_id, handles)?;
        } else if file_type.is_file() {
            handles.push(copy_secret(&entry.path(), &entry_dest, agent_id)?);
        }
    }
    Ok(())
}

/// Build the concrete provider for a vendor tag, given the caller's HOME
/// directory to discover credentials under.
#[must_use]
pub fn resolve_provider(provider: VendorProvider, home: &Path) -> Box<dyn AuthProvider + Send + Sync> {
    match provider {
        VendorProvider::Anthropic => Box::new(AnthropicAuthProvider {
            credentials_path: home.join(".claude").join(".credentials.json"),
            config_dir: home.join(".claude"),
        }),
        VendorProvider::Openai => Box::new(ConfigDirAuthProvider {
            provider,
            config_dir: home.join(".codex"),
        }),
        VendorProvider::Google => Box::new(ConfigDirAuthProvider {
            provider,
            config_dir: home.join(".gemini"),
        }),
        VendorProvider::None => Box::new(NoneAuthProvider),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_provider_stages_and_tears_down() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = NoneAuthProvider;
        provider.verify().unwrap();
        let staged = provider.stage(tmp.path(), "agent-a").unwrap();
        assert!(staged.sandbox_path.join("config").is_dir());
        assert!(staged.sandbox_path.join("tmp").is_dir());
        staged.teardown();
        assert!(!staged.sandbox_path.exists());
    }

    #[test]
    fn config_dir_provider_requires_existing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = ConfigDirAuthProvider {
            provider: VendorProvider::Openai,
            config_dir: tmp.path().join("does-not-exist"),
        };
        assert!(provider.verify().is_err());
    }

    #[test]
    fn config_dir_provider_copies_tree_with_owner_only_permissions() {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join("codex-config");
        fs::create_dir_all(config_dir.join("nested")).unwrap();
        fs::write(config_dir.join("auth.json"), b"{}").unwrap();
        fs::write(config_dir.join("nested/token.txt"), b"secret").unwrap();

        let provider = ConfigDirAuthProvider {
            provider: VendorProvider::Openai,
            config_dir,
        };
        let sandbox_root = tmp.path().join("sandbox");
        let staged = provider.stage(&sandbox_root, "agent-a").unwrap();
        assert_eq!(staged.secret_handles.len(), 2);
        let copied = staged.sandbox_path.join("config/openai/auth.json");
        assert!(copied.is_file());
        staged.teardown();
    }

    #[test]
    fn staging_failure_disposes_partial_handles() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = AnthropicAuthProvider {
            credentials_path: tmp.path().join("missing-credentials.json"),
            config_dir: tmp.path().join("missing-config-dir"),
        };
        let sandbox_root = tmp.path().join("sandbox");
        let result = provider.stage(&sandbox_root, "agent-a");
        assert!(result.is_err());
        assert!(!sandbox_root.join("home").exists());
    }
}
