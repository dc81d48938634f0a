//! Sandbox policy composition (§3, §4.4).
//!
//! A [`SandboxPolicy`] is a pure value: sorted, deduplicated path lists.
//! Enforcement (the actual OS-level sandboxing wrapper and subprocess
//! launch) lives in the root crate's launcher; this module only composes
//! the policy a given agent invocation gets.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// `{deny_read, deny_write, allow_write}`, all absolute paths, sorted and
/// deduplicated for deterministic serialization (§3 invariant).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxPolicy {
    /// Paths the agent must not read.
    pub deny_read: Vec<PathBuf>,
    /// Paths the agent must not write.
    pub deny_write: Vec<PathBuf>,
    /// Paths the agent is explicitly allowed to write (its own workspace,
    /// sandbox home, and `TMPDIR`).
    pub allow_write: Vec<PathBuf>,
}

fn sorted_unique(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.sort();
    paths.dedup();
    paths
}

impl SandboxPolicy {
    /// Build a policy from raw lists, sorting and deduplicating each.
    #[must_use]
    pub fn new(deny_read: Vec<PathBuf>, deny_write: Vec<PathBuf>, allow_write: Vec<PathBuf>) -> Self {
        Self {
            deny_read: sorted_unique(deny_read),
            deny_write: sorted_unique(deny_write),
            allow_write: sorted_unique(allow_write),
        }
    }

    /// Union this policy with another, re-sorting and deduplicating.
    #[must_use]
    pub fn union(mut self, other: Self) -> Self {
        self.deny_read.extend(other.deny_read);
        self.deny_write.extend(other.deny_write);
        self.allow_write.extend(other.allow_write);
        self.deny_read = sorted_unique(self.deny_read);
        self.deny_write = sorted_unique(self.deny_write);
        self.allow_write = sorted_unique(self.allow_write);
        self
    }
}

/// The four config files and the session-store index/lock every sandbox
/// policy's baseline denies regardless of stage (§4.4).
fn baseline_denied_config_files(repo_root: &Path) -> Vec<PathBuf> {
    [
        "agents.yaml",
        "evals.yaml",
        "environment.yaml",
        "orchestration.yaml",
        "sandbox.yaml",
    ]
    .into_iter()
    .map(|name| repo_root.join(".voratiq").join(name))
    .collect()
}

/// Compose the broad baseline policy shared by every agent invocation: deny
/// read/write on the `.voratiq/*.yaml` config files, sibling session
/// directories, and (during review) the parent run workspace.
///
/// `sibling_session_dirs` and `deny_read_extra`/`deny_write_extra` let
/// callers layer stage-specific additions (review's sibling-reviewer and
/// run-index denials) on top without duplicating the baseline.
#[must_use]
pub fn baseline_policy(
    repo_root: &Path,
    own_workspace: &Path,
    own_sandbox_home: &Path,
    tmpdir: &Path,
    sibling_session_dirs: &[PathBuf],
) -> SandboxPolicy {
    let mut deny_read = baseline_denied_config_files(repo_root);
    let mut deny_write = baseline_denied_config_files(repo_root);
    deny_read.extend(sibling_session_dirs.iter().cloned());
    deny_write.extend(sibling_session_dirs.iter().cloned());

    SandboxPolicy::new(
        deny_read,
        deny_write,
        vec![own_workspace.to_owned(), own_sandbox_home.to_owned(), tmpdir.to_owned()],
    )
}

/// Stage-specific additions applied during a blinded review (§4.4, §4.8):
/// deny read on other reviewers' roots, the run index, and its lock file;
/// deny write on the shared base snapshot.
#[must_use]
pub fn review_stage_policy(
    other_reviewer_roots: &[PathBuf],
    run_index_path: &Path,
    run_index_lock_path: &Path,
    shared_base_snapshot: &Path,
) -> SandboxPolicy {
    let mut deny_read: Vec<PathBuf> = other_reviewer_roots.to_vec();
    deny_read.push(run_index_path.to_owned());
    deny_read.push(run_index_lock_path.to_owned());

    SandboxPolicy::new(deny_read, vec![shared_base_snapshot.to_owned()], vec![])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_policy_denies_config_files() {
        let policy = baseline_policy(
            Path::new("/repo"),
            Path::new("/repo/.voratiq/runs/sessions/r1/agent-a/workspace"),
            Path::new("/repo/.voratiq/runs/sessions/r1/agent-a/sandbox/home"),
            Path::new("/tmp/voratiq-r1-agent-a"),
            &[],
        );
        assert!(policy.deny_read.contains(&PathBuf::from("/repo/.voratiq/agents.yaml")));
        assert!(policy.deny_write.contains(&PathBuf::from("/repo/.voratiq/sandbox.yaml")));
    }

    #[test]
    fn allow_write_contains_own_subtrees_and_tmpdir() {
        let policy = baseline_policy(
            Path::new("/repo"),
            Path::new("/repo/.voratiq/runs/sessions/r1/agent-a/workspace"),
            Path::new("/repo/.voratiq/runs/sessions/r1/agent-a/sandbox/home"),
            Path::new("/tmp/voratiq-r1-agent-a"),
            &[],
        );
        assert_eq!(policy.allow_write.len(), 3);
        assert!(policy.allow_write.contains(&PathBuf::from("/tmp/voratiq-r1-agent-a")));
    }

    #[test]
    fn union_deduplicates_and_sorts() {
        let a = SandboxPolicy::new(vec![PathBuf::from("/b"), PathBuf::from("/a")], vec![], vec![]);
        let b = SandboxPolicy::new(vec![PathBuf::from("/a"), PathBuf::from("/c")], vec![], vec![]);
        let merged = a.union(b);
        assert_eq!(
            merged.deny_read,
            vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]
        );
    }

    #[test]
    fn review_stage_policy_denies_run_index_and_siblings() {
        let policy = review_stage_policy(
            &[PathBuf::from("/repo/.voratiq/reviews/sessions/rv1/other-reviewer")],
            Path::new("/repo/.voratiq/runs/index.json"),
            Path::new("/repo/.voratiq/runs/index.lock"),
            Path::new("/repo/.voratiq/reviews/sessions/rv1/.shared/inputs/base"),
        );
        assert!(policy.deny_read.contains(&PathBuf::from("/repo/.voratiq/runs/index.json")));
        assert!(
            policy
                .deny_write
                .contains(&PathBuf::from("/repo/.voratiq/reviews/sessions/rv1/.shared/inputs/base"))
        );
    }
}
