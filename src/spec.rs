//! The spec-authoring orchestrator (§3, §6): a single agent drafts a spec
//! document from an operator-supplied description, writing it to
//! `.voratiq/specs/<slug>.md`. Unlike [`crate::run`] and [`crate::review`]
//! this is a one-candidate flow, so it drives the launcher and watchdog
//! directly instead of going through [`voratiq_core::competition`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use rand::Rng as _;

use voratiq_core::error::StoreError;
use voratiq_core::model::{
    AgentDefinition, SessionId, SessionRecord, SessionStatus, SpecId, SpecIteration, SpecRecord,
};
use voratiq_core::paths::{self, Domain};
use voratiq_core::store::RecordStore;

use crate::auth;
use crate::launcher::{self, LaunchRequest};
use crate::supervisor::{ActiveContext, LifecycleSupervisor};
use crate::watchdog::{self, WatchdogConfig, WatchdogOutcome};

/// Everything needed to run one spec-authoring session.
pub struct SpecRequest {
    /// Absolute path to the repository root.
    pub repo_root: PathBuf,
    /// The operator's description of what the spec should cover.
    pub description: String,
    /// The drafting agent.
    pub agent: AgentDefinition,
    /// Human-readable title; the session slug is derived from it.
    pub title: String,
    /// Repo-relative output path override. Defaults to
    /// `.voratiq/specs/<slug>.md`.
    pub output_path: Option<String>,
    /// Watchdog tunables for this agent's vendor.
    pub watchdog_config: WatchdogConfig,
    /// The operator's `$HOME`, used to discover vendor credentials.
    pub operator_home: PathBuf,
    /// Environment overlay applied under the agent's staged auth.
    pub environment: voratiq_core::config::EnvironmentConfig,
}

/// What [`run`] hands back once the draft is written.
pub struct SpecHandle {
    /// The generated (or reused) session id.
    pub session_id: SessionId,
    /// The spec's slug.
    pub slug: SpecId,
    /// Repo-relative path the draft was written to.
    pub output_path: String,
    /// Whether the agent produced a non-empty draft.
    pub succeeded: bool,
}

/// Slugify a title into a [`SpecId`]: lowercase, non-alphanumerics collapsed
/// to single hyphens, leading/trailing hyphens trimmed.
fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_was_hyphen = true;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_was_hyphen = false;
        } else if !last_was_hyphen {
            slug.push('-');
            last_was_hyphen = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

fn random_session_suffix() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..5)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Draft (or redraft) a spec document with one agent (§3).
///
/// If a spec session already exists for this title's slug, this call
/// refines it: a new iteration is appended and the draft is overwritten.
/// Otherwise a fresh session is created.
///
/// # Errors
/// Returns an error if the agent's binary/credentials fail precheck, the
/// launch fails, or the draft cannot be persisted.
pub async fn run(
    store: &Arc<RecordStore>,
    supervisor: &Arc<LifecycleSupervisor>,
    request: SpecRequest,
    now_iso: &str,
    id_timestamp: &str,
) -> anyhow::Result<SpecHandle> {
    crate::run::precheck_binary(&request.agent)?;
    auth::resolve_provider(request.agent.provider, &request.operator_home)
        .verify()
        .with_context(|| format!("verifying credentials for agent `{}`", request.agent.id))?;

    let slug_raw = slugify(&request.title);
    if slug_raw.is_empty() {
        bail!("title `{}` does not produce a usable slug", request.title);
    }
    let slug = SpecId::new(slug_raw.clone()).with_context(|| format!("slug `{slug_raw}` is invalid"))?;
    let output_path = request
        .output_path
        .clone()
        .unwrap_or_else(|| format!(".voratiq/specs/{slug_raw}.md"));

    let existing = store
        .read(
            |record| matches!(record, SessionRecord::Spec { payload, .. } if payload.slug == slug),
            1,
            |_| {},
        )
        .into_iter()
        .find_map(|record| match record {
            SessionRecord::Spec { id, payload, .. } => Some((id, payload.iterations.len())),
            _ => None,
        });

    let (session_id, iteration_number) = if let Some((id, iteration_count)) = existing {
        let iteration_number = u32::try_from(iteration_count).unwrap_or(u32::MAX) + 1;
        (id, iteration_number)
    } else {
        let raw = format!("{id_timestamp}-{}", random_session_suffix());
        (SessionId::new(raw)?, 1)
    };

    if iteration_number == 1 {
        store.append(
            SessionRecord::Spec {
                id: session_id.clone(),
                created_at: now_iso.to_owned(),
                status: SessionStatus::Drafting,
                completed_at: None,
                payload: SpecRecord {
                    slug: slug.clone(),
                    title: request.title.clone(),
                    output_path: output_path.clone(),
                    iterations: Vec::new(),
                },
            },
            request.title.clone(),
        )?;
    } else {
        store.rewrite(&session_id, |mut record| {
            if let SessionRecord::Spec { status, .. } = &mut record {
                *status = SessionStatus::Refining;
            }
            record
        })?;
        store.flush(&session_id)?;
    }

    supervisor
        .register(ActiveContext {
            label: format!("spec {}", session_id.as_str()),
            store: Arc::clone(store),
            session_id: session_id.clone(),
            mark_aborted: Box::new({
                let aborted_at = now_iso.to_owned();
                move |mut record| {
                    if let SessionRecord::Spec { status, completed_at, .. } = &mut record {
                        *status = SessionStatus::Aborted;
                        *completed_at = Some(aborted_at);
                    }
                    record
                }
            }),
            staged_auths: Vec::new(),
        })
        .await;

    let workspace_rel = paths::agent_subdir(Domain::Specs, &session_id, &request.agent.id, "workspace")?;
    let workspace = request.repo_root.join(&workspace_rel);
    std::fs::create_dir_all(&workspace)?;
    for subdir in ["artifacts", "runtime", "sandbox"] {
        let rel = paths::agent_subdir(Domain::Specs, &session_id, &request.agent.id, subdir)?;
        std::fs::create_dir_all(request.repo_root.join(rel))?;
    }

    let sandbox_rel = paths::agent_subdir(Domain::Specs, &session_id, &request.agent.id, "sandbox")?;
    let sandbox_root = request.repo_root.join(sandbox_rel);
    let mut staged_auth = auth::resolve_provider(request.agent.provider, &request.operator_home)
        .stage(&sandbox_root, request.agent.id.as_str())?;
    auth::apply_environment_overlay(&mut staged_auth.env_overrides, &request.environment);

    let artifacts_dir = request.repo_root.join(paths::agent_subdir(
        Domain::Specs,
        &session_id,
        &request.agent.id,
        "artifacts",
    )?);
    let stdout_log = artifacts_dir.join("stdout.log");
    let stderr_log = artifacts_dir.join("stderr.log");
    let draft_path = workspace.join("draft.md");

    let prompt = format!(
        "Write a complete specification document and save it to `draft.md` in your \
         working directory.\n\nTitle: {}\n\n--- DESCRIPTION ---\n{}\n",
        request.title, request.description
    );
    let runtime_dir = request.repo_root.join(paths::agent_subdir(
        Domain::Specs,
        &session_id,
        &request.agent.id,
        "runtime",
    )?);
    let _ = std::fs::write(runtime_dir.join("prompt.ephemeral.txt"), &prompt);

    let argv = request.agent.resolve_argv();
    let launch_request = LaunchRequest {
        binary: &request.agent.binary,
        argv: &argv,
        cwd: &workspace,
        env_overrides: &staged_auth.env_overrides,
        stdout_log: &stdout_log,
        stderr_log: &stderr_log,
    };

    let result: anyhow::Result<(SessionStatus, bool)> = async {
        let mut launched = launcher::launch(&launch_request).await?;
        let cancel = tokio_util::sync::CancellationToken::new();
        let outcome = watchdog::supervise(
            &mut launched,
            &request.watchdog_config,
            request.agent.id.as_str(),
            &stderr_log,
            &cancel,
        )
        .await?;

        match outcome {
            WatchdogOutcome::ChildExited(exit) if exit.success() && draft_path.is_file() => {
                let draft = std::fs::read_to_string(&draft_path)?;
                if draft.trim().is_empty() {
                    bail!("agent produced an empty draft");
                }
                let abs_output_path = paths::resolve_within_root(&request.repo_root, &output_path)?;
                if let Some(parent) = abs_output_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&abs_output_path, draft)?;
                Ok((SessionStatus::Drafted, true))
            }
            WatchdogOutcome::ChildExited(exit) if exit.success() => {
                bail!("agent exited successfully but wrote no draft.md")
            }
            WatchdogOutcome::ChildExited(exit) => {
                bail!("agent exited with status {exit}")
            }
            WatchdogOutcome::Triggered { reason, .. } => bail!(reason),
        }
    }
    .await;

    staged_auth.teardown();

    let (status, succeeded, error) = match result {
        Ok((status, succeeded)) => (status, succeeded, None),
        Err(e) => (SessionStatus::Failed, false, Some(e.to_string())),
    };

    store.rewrite(&session_id, {
        let now_iso = now_iso.to_owned();
        move |mut record| {
            if let SessionRecord::Spec {
                status: s,
                completed_at,
                payload,
                ..
            } = &mut record
            {
                *s = status;
                *completed_at = Some(now_iso.clone());
                payload.iterations.push(SpecIteration {
                    iteration_number,
                    created_at: now_iso.clone(),
                    accepted: succeeded,
                });
            }
            record
        }
    })?;
    store.flush(&session_id)?;
    supervisor.clear().await;

    if let Some(error) = error {
        bail!(error);
    }

    Ok(SpecHandle {
        session_id,
        slug,
        output_path,
        succeeded,
    })
}

/// Surfaced so callers can report [`StoreError`] precisely when wiring the
/// CLI's error report.
#[must_use]
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<StoreError>()
        .is_some_and(|e| matches!(e, StoreError::NotFound { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_punctuation_and_case() {
        assert_eq!(slugify("Widget Rewrite!!"), "widget-rewrite");
        assert_eq!(slugify("  leading and trailing  "), "leading-and-trailing");
    }

    #[test]
    fn slugify_empty_title_yields_empty_slug() {
        assert_eq!(slugify("!!!"), "");
    }
}
