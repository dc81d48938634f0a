//! Error types for git operations.
//!
//! [`GitError`] is the single error type returned by all [`GitRepo`](crate::GitRepo)
//! trait methods. Rich enum variants let callers match on specific failure
//! modes (e.g. base-revision mismatch, dirty worktree) without parsing error
//! messages.

use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by [`GitRepo`](crate::GitRepo) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository's working tree has uncommitted changes where a clean
    /// tree was required.
    #[error("dirty worktree at {}: {message}", path.display())]
    DirtyWorktree {
        /// Path to the worktree root.
        path: PathBuf,
        /// What was dirty.
        message: String,
    },

    /// A revision string (SHA, ref, etc.) could not be resolved.
    #[error("revision `{spec}` could not be resolved: {message}")]
    RevisionNotFound {
        /// The revision spec that failed to resolve.
        spec: String,
        /// Details from git.
        message: String,
    },

    /// `git apply` refused the patch because the tree no longer matches the
    /// base revision the patch was generated from.
    #[error("patch no longer applies cleanly against {base}: {message}")]
    ApplyFailed {
        /// The base revision the patch was generated from.
        base: String,
        /// stderr from `git apply`.
        message: String,
    },

    /// A `git worktree add`/`remove` call failed.
    #[error("worktree operation failed: {message}")]
    WorktreeFailed {
        /// Details from git.
        message: String,
    },

    /// An I/O error occurred spawning or communicating with the `git` process.
    #[error("I/O error running git: {0}")]
    Io(#[from] std::io::Error),

    /// `git` exited non-zero for a reason not covered by a more specific
    /// variant.
    #[error("git {command} exited with code {code:?}: {stderr}")]
    CommandFailed {
        /// The git subcommand invoked, e.g. `"diff"`.
        command: String,
        /// Process exit code, `None` if killed by signal.
        code: Option<i32>,
        /// Captured stderr.
        stderr: String,
    },

    /// The gix backend returned an unclassified error.
    ///
    /// Catch-all for failures that don't fit a more specific variant; the
    /// `message` carries enough context from gix to diagnose the failure.
    #[error("git backend error: {message}")]
    BackendError {
        /// Freeform error description from the backend.
        message: String,
    },
}
