//! The [`GitRepo`] trait — the single abstraction boundary between voratiq
//! and git.
//!
//! The trait is object-safe so callers can use `dyn GitRepo`. It only
//! exposes the operations the orchestrator actually performs: detached
//! worktrees anchored to a frozen base revision, diff capture, patch
//! application, and commit creation.

use std::path::Path;

use crate::error::GitError;
use crate::types::{DiffStat, WorktreeHandle};

/// The git abstraction trait used by the orchestration layer.
pub trait GitRepo {
    /// Resolve `HEAD` (or another revision spec) to a full 40-char SHA.
    ///
    /// # Errors
    /// Returns [`GitError::RevisionNotFound`] if `spec` does not resolve.
    fn rev_parse(&self, spec: &str) -> Result<String, GitError>;

    /// Return `true` if the working tree has no uncommitted changes
    /// (tracked modifications, staged changes, or untracked files).
    ///
    /// # Errors
    /// Returns [`GitError`] if `git status` cannot be run.
    fn is_clean(&self) -> Result<bool, GitError>;

    /// Create a detached worktree at `path`, checked out at `base_revision`.
    ///
    /// # Errors
    /// Returns [`GitError::WorktreeFailed`] if the worktree already exists
    /// or git refuses the operation.
    fn worktree_add(&self, path: &Path, base_revision: &str) -> Result<WorktreeHandle, GitError>;

    /// Remove a worktree previously created with [`worktree_add`](Self::worktree_add).
    ///
    /// Best-effort: does not error if the directory is already gone.
    ///
    /// # Errors
    /// Returns [`GitError::WorktreeFailed`] if git's own bookkeeping cannot
    /// be cleaned up.
    fn worktree_remove(&self, path: &Path) -> Result<(), GitError>;

    /// Produce a unified diff of `worktree` against `base_revision`, including
    /// untracked files.
    ///
    /// # Errors
    /// Returns [`GitError`] if the diff cannot be computed.
    fn diff(&self, worktree: &Path, base_revision: &str) -> Result<String, GitError>;

    /// Compute `git diff --shortstat` between `worktree` and `base_revision`.
    ///
    /// # Errors
    /// Returns [`GitError`] if the diff cannot be computed.
    fn diff_shortstat(&self, worktree: &Path, base_revision: &str) -> Result<DiffStat, GitError>;

    /// Apply `patch` to the repository's working tree.
    ///
    /// # Errors
    /// Returns [`GitError::ApplyFailed`] if the patch no longer applies
    /// cleanly.
    fn apply(&self, patch: &str) -> Result<(), GitError>;

    /// Create a commit of the current index/working-tree state with the
    /// given message. Stages all changes first (`git add -A`).
    ///
    /// # Errors
    /// Returns [`GitError`] if nothing is staged or the commit otherwise
    /// fails.
    fn commit_all(&self, message: &str) -> Result<String, GitError>;
}
