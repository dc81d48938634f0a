//! Repo-relative, traversal-safe path construction (§4.1, C1).
//!
//! All session artifacts live under
//! `.voratiq/<domain>/sessions/<session-id>/<agent-id>/` with subdirectories
//! `workspace/`, `artifacts/`, `runtime/`, `sandbox/`, `evals/`. Every
//! function here returns forward-slash, repo-relative [`String`]s; absolute
//! resolution is a separate step that asserts containment within the repo
//! root.

use std::path::{Component, Path, PathBuf};

use crate::error::StoreError;
use crate::model::ids::{AgentId, SessionId};

/// The on-disk root all voratiq state lives under.
pub const VORATIQ_DIR: &str = ".voratiq";

/// A session domain: which top-level directory under `.voratiq/` a session
/// belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Domain {
    /// `.voratiq/runs/`
    Runs,
    /// `.voratiq/specs/`
    Specs,
    /// `.voratiq/reviews/`
    Reviews,
}

impl Domain {
    const fn segment(self) -> &'static str {
        match self {
            Self::Runs => "runs",
            Self::Specs => "specs",
            Self::Reviews => "reviews",
        }
    }
}

/// Validate a single path segment: non-empty, no `/`, `\`, or `..`.
///
/// # Errors
/// Returns [`StoreError::PathEscape`] if the segment is empty or contains a
/// forbidden character sequence.
pub fn validate_segment(segment: &str) -> Result<(), StoreError> {
    if segment.is_empty() {
        return Err(StoreError::PathEscape {
            detail: "path segment must not be empty".to_owned(),
        });
    }
    if segment.contains('/') || segment.contains('\\') || segment.contains("..") {
        return Err(StoreError::PathEscape {
            detail: format!("path segment `{segment}` contains a forbidden character"),
        });
    }
    Ok(())
}

/// The directory for a session within its domain, e.g.
/// `.voratiq/runs/sessions/20260730-221500-abcde`.
///
/// # Errors
/// Returns [`StoreError::PathEscape`] if `session_id` fails segment
/// validation (defensive; [`SessionId`] already validates on construction).
pub fn session_dir(domain: Domain, session_id: &SessionId) -> Result<String, StoreError> {
    validate_segment(session_id.as_str())?;
    Ok(format!(
        "{VORATIQ_DIR}/{}/sessions/{}",
        domain.segment(),
        session_id.as_str()
    ))
}

/// The per-agent root within a session, e.g.
/// `.voratiq/runs/sessions/<id>/<agent-id>`.
///
/// # Errors
/// Returns [`StoreError::PathEscape`] if either id fails segment validation.
pub fn agent_root(
    domain: Domain,
    session_id: &SessionId,
    agent_id: &AgentId,
) -> Result<String, StoreError> {
    validate_segment(agent_id.as_str())?;
    let session = session_dir(domain, session_id)?;
    Ok(format!("{session}/{}", agent_id.as_str()))
}

/// The five fixed subdirectories created under every agent root.
pub const AGENT_SUBDIRS: [&str; 5] = ["workspace", "artifacts", "runtime", "sandbox", "evals"];

/// One of the fixed subdirectories under an agent root.
///
/// # Errors
/// Returns [`StoreError::PathEscape`] if either id fails segment validation.
pub fn agent_subdir(
    domain: Domain,
    session_id: &SessionId,
    agent_id: &AgentId,
    subdir: &str,
) -> Result<String, StoreError> {
    debug_assert!(AGENT_SUBDIRS.contains(&subdir));
    let root = agent_root(domain, session_id, agent_id)?;
    Ok(format!("{root}/{subdir}"))
}

/// The index file for a domain, e.g. `.voratiq/runs/index.json`.
#[must_use]
pub fn index_path(domain: Domain) -> String {
    format!("{VORATIQ_DIR}/{}/index.json", domain.segment())
}

/// The advisory lock file guarding index upserts for a domain.
#[must_use]
pub fn index_lock_path(domain: Domain) -> String {
    format!("{VORATIQ_DIR}/{}/index.lock", domain.segment())
}

/// The `record.json` path for a session.
///
/// # Errors
/// Returns [`StoreError::PathEscape`] if `session_id` fails segment
/// validation.
pub fn record_path(domain: Domain, session_id: &SessionId) -> Result<String, StoreError> {
    Ok(format!("{}/record.json", session_dir(domain, session_id)?))
}

/// Resolve a repo-relative path against `repo_root`, asserting the result
/// stays within the root (rejecting `..` traversal and absolute overrides).
///
/// # Errors
/// Returns [`StoreError::PathEscape`] if `relative` contains a `..`
/// component, an absolute/prefix component, or if the resolved path would
/// not be contained within `repo_root`.
pub fn resolve_within_root(repo_root: &Path, relative: &str) -> Result<PathBuf, StoreError> {
    let relative_path = Path::new(relative);
    for component in relative_path.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StoreError::PathEscape {
                    detail: format!("`{relative}` contains a disallowed path component"),
                });
            }
        }
    }
    let resolved = repo_root.join(relative_path);
    if !resolved.starts_with(repo_root) {
        return Err(StoreError::PathEscape {
            detail: format!("`{relative}` resolves outside the repository root"),
        });
    }
    Ok(resolved)
}

/// Render a path as a forward-slash, repo-relative display string. Used when
/// persisting paths into records so they stay portable across platforms.
#[must_use]
pub fn to_display_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    fn aid(s: &str) -> AgentId {
        AgentId::new(s).unwrap()
    }

    #[test]
    fn session_dir_builds_expected_path() {
        let path = session_dir(Domain::Runs, &sid("20260730-221500-abcde")).unwrap();
        assert_eq!(path, ".voratiq/runs/sessions/20260730-221500-abcde");
    }

    #[test]
    fn agent_subdir_builds_expected_path() {
        let path = agent_subdir(
            Domain::Runs,
            &sid("20260730-221500-abcde"),
            &aid("claude-fast"),
            "workspace",
        )
        .unwrap();
        assert_eq!(
            path,
            ".voratiq/runs/sessions/20260730-221500-abcde/claude-fast/workspace"
        );
    }

    #[test]
    fn validate_segment_rejects_traversal() {
        assert!(validate_segment("..").is_err());
        assert!(validate_segment("foo/bar").is_err());
        assert!(validate_segment("").is_err());
    }

    #[test]
    fn resolve_within_root_rejects_parent_dir() {
        let root = Path::new("/repo");
        assert!(resolve_within_root(root, "../escape").is_err());
        assert!(resolve_within_root(root, "/etc/passwd").is_err());
    }

    #[test]
    fn resolve_within_root_accepts_normal_relative_path() {
        let root = Path::new("/repo");
        let resolved = resolve_within_root(root, ".voratiq/specs/foo.md").unwrap();
        assert_eq!(resolved, Path::new("/repo/.voratiq/specs/foo.md"));
    }

    #[test]
    fn to_display_path_uses_forward_slashes() {
        let path = PathBuf::from("a").join("b").join("c");
        assert_eq!(to_display_path(&path), "a/b/c");
    }

    proptest::proptest! {
        /// Any relative path containing a `..` component is rejected,
        /// regardless of what surrounds it.
        #[test]
        fn resolve_within_root_always_rejects_parent_dir(
            prefix in "[a-z]{0,8}",
            suffix in "[a-z]{0,8}",
        ) {
            let root = Path::new("/repo");
            let relative = format!("{prefix}/../{suffix}");
            prop_assert!(resolve_within_root(root, &relative).is_err());
        }

        /// Any relative path built only from plain alphanumeric segments
        /// resolves to a descendant of `repo_root`.
        #[test]
        fn resolve_within_root_contains_plain_segments(
            segments in proptest::collection::vec("[a-zA-Z0-9_-]{1,12}", 1..5),
        ) {
            let root = Path::new("/repo");
            let relative = segments.join("/");
            let resolved = resolve_within_root(root, &relative)?;
            prop_assert!(resolved.starts_with(root));
        }

        /// [`validate_segment`] never accepts a segment containing a path
        /// separator or a `..` component, no matter what else it contains.
        #[test]
        fn validate_segment_rejects_any_embedded_traversal(
            before in "[a-z]{0,6}",
            after in "[a-z]{0,6}",
        ) {
            let segment = format!("{before}/../{after}");
            prop_assert!(validate_segment(&segment).is_err());
        }
    }
}
