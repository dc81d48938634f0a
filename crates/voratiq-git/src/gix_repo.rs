//! gix-backed implementation of [`GitRepo`].
//!
//! Ref resolution, dirty checks, and tree checkout go through
//! [gix](https://github.com/GitoxideLabs/gitoxide) directly. Whole-worktree
//! diff rendering, patch application, and "stage everything and commit" stay
//! on a `git` subprocess ([`CliGitRepo`]) — the same way the teacher's own
//! push implementation stays on the CLI because gix has no high-level
//! porcelain for it; here the analogous gap is textual unified diffs against
//! an arbitrary working directory and whole-tree staging.
//!
//! The handle stores a [`gix::ThreadSafeRepository`] rather than a
//! [`gix::Repository`]: the latter carries interior-mutable object caches
//! and is not `Sync`, but callers hold this behind a shared
//! `dyn GitRepo + Send + Sync` reference across concurrent agent
//! invocations. Each operation checks out a cheap thread-local handle.

use std::path::Path;
use std::sync::atomic::AtomicBool;

use crate::cli::CliGitRepo;
use crate::error::GitError;
use crate::repo::GitRepo;
use crate::types::{DiffStat, WorktreeHandle};

/// A [`GitRepo`] implementation backed by gix for the operations it has
/// turnkey support for, delegating the rest to [`CliGitRepo`].
pub struct GixRepo {
    repo: gix::ThreadSafeRepository,
    cli: CliGitRepo,
}

impl GixRepo {
    /// Open the git repository at exactly `root` (no parent discovery).
    ///
    /// # Errors
    /// Returns [`GitError::BackendError`] if `root` is not a git repository.
    pub fn open(root: &Path) -> Result<Self, GitError> {
        let repo = gix::ThreadSafeRepository::open_opts(root, gix::open::Options::isolated())
            .map_err(|e| GitError::BackendError { message: e.to_string() })?;
        Ok(Self {
            repo,
            cli: CliGitRepo::new(root),
        })
    }

    fn local(&self) -> gix::Repository {
        self.repo.to_thread_local()
    }
}

impl GitRepo for GixRepo {
    fn rev_parse(&self, spec: &str) -> Result<String, GitError> {
        let repo = self.local();
        let id = repo.rev_parse_single(spec).map_err(|e| GitError::RevisionNotFound {
            spec: spec.to_owned(),
            message: e.to_string(),
        })?;
        Ok(id.detach().to_hex().to_string())
    }

    fn is_clean(&self) -> Result<bool, GitError> {
        let dirty = self
            .local()
            .is_dirty()
            .map_err(|e| GitError::BackendError { message: e.to_string() })?;
        Ok(!dirty)
    }

    fn worktree_add(&self, path: &Path, base_revision: &str) -> Result<WorktreeHandle, GitError> {
        let repo = self.local();
        let commit_id = repo
            .rev_parse_single(base_revision)
            .map_err(|e| GitError::RevisionNotFound {
                spec: base_revision.to_owned(),
                message: e.to_string(),
            })?
            .detach();
        let tree_id = resolve_tree(&repo, commit_id)?;

        let admin_name = sanitize_path_for_admin_name(path);
        let git_dir = repo.git_dir();
        let admin_dir = git_dir.join("worktrees").join(&admin_name);
        std::fs::create_dir_all(&admin_dir).map_err(GitError::Io)?;
        std::fs::create_dir_all(path).map_err(GitError::Io)?;

        let worktree_git_file = path.join(".git");
        std::fs::write(admin_dir.join("HEAD"), format!("{}\n", commit_id.to_hex())).map_err(GitError::Io)?;
        std::fs::write(admin_dir.join("commondir"), "../..\n").map_err(GitError::Io)?;
        std::fs::write(admin_dir.join("gitdir"), format!("{}\n", worktree_git_file.display()))
            .map_err(GitError::Io)?;
        std::fs::write(&worktree_git_file, format!("gitdir: {}\n", admin_dir.display())).map_err(GitError::Io)?;

        checkout_tree_into(&repo, tree_id, path).map_err(|e| GitError::WorktreeFailed {
            message: e.to_string(),
        })?;

        Ok(WorktreeHandle {
            path: path.to_owned(),
            base_revision: commit_id.to_hex().to_string(),
        })
    }

    fn worktree_remove(&self, path: &Path) -> Result<(), GitError> {
        if path.exists() {
            std::fs::remove_dir_all(path).map_err(|e| GitError::WorktreeFailed {
                message: e.to_string(),
            })?;
        }
        let admin_dir = self.local().git_dir().join("worktrees").join(sanitize_path_for_admin_name(path));
        if admin_dir.exists() {
            std::fs::remove_dir_all(&admin_dir).map_err(|e| GitError::WorktreeFailed {
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    fn diff(&self, worktree: &Path, base_revision: &str) -> Result<String, GitError> {
        self.cli.diff(worktree, base_revision)
    }

    fn diff_shortstat(&self, worktree: &Path, base_revision: &str) -> Result<DiffStat, GitError> {
        self.cli.diff_shortstat(worktree, base_revision)
    }

    fn apply(&self, patch: &str) -> Result<(), GitError> {
        self.cli.apply(patch)
    }

    fn commit_all(&self, message: &str) -> Result<String, GitError> {
        self.cli.commit_all(message)
    }
}

/// Resolve `id` (a commit or tree) to the tree it checks out to.
fn resolve_tree(repo: &gix::Repository, id: gix::ObjectId) -> Result<gix::ObjectId, GitError> {
    let object = repo.find_object(id).map_err(|e| GitError::BackendError {
        message: format!("resolving base revision object: {e}"),
    })?;
    match object.kind {
        gix::object::Kind::Commit => object
            .into_commit()
            .tree_id()
            .map(gix::Id::detach)
            .map_err(|e| GitError::BackendError {
                message: format!("reading tree for base revision: {e}"),
            }),
        gix::object::Kind::Tree => Ok(id),
        other => Err(GitError::BackendError {
            message: format!("expected commit or tree as base revision, got {other}"),
        }),
    }
}

/// Populate a freshly created, empty `workdir` with `tree_id`'s contents.
fn checkout_tree_into(repo: &gix::Repository, tree_id: gix::ObjectId, workdir: &Path) -> Result<(), GitError> {
    let mut index_file = repo.index_from_tree(&tree_id).map_err(|e| GitError::BackendError {
        message: format!("building index from tree: {e}"),
    })?;

    let mut opts = repo
        .checkout_options(gix::worktree::stack::state::attributes::Source::IdMapping)
        .map_err(|e| GitError::BackendError {
            message: format!("reading checkout options: {e}"),
        })?;
    opts.overwrite_existing = true;
    opts.destination_is_initially_empty = true;

    let objects = repo.objects.clone().into_arc().map_err(|e| GitError::BackendError {
        message: format!("sharing object store: {e}"),
    })?;

    let outcome = gix::worktree::state::checkout(
        &mut index_file,
        workdir,
        objects,
        &gix::progress::Discard,
        &gix::progress::Discard,
        &AtomicBool::new(false),
        opts,
    )
    .map_err(|e| GitError::BackendError {
        message: format!("checkout failed: {e}"),
    })?;

    if let Some(first) = outcome.errors.first() {
        return Err(GitError::BackendError {
            message: format!(
                "checkout had {} error(s), first: {}: {}",
                outcome.errors.len(),
                first.path,
                first.error
            ),
        });
    }
    Ok(())
}

/// Derive a stable, collision-free `.git/worktrees/<name>` admin directory
/// name from a worktree's absolute path.
fn sanitize_path_for_admin_name(path: &Path) -> String {
    path.to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn init_repo(dir: &Path) {
        Command::new("git").args(["init", "-q"]).current_dir(dir).output().expect("git init");
        Command::new("git")
            .args(["config", "user.email", "test@voratiq.dev"])
            .current_dir(dir)
            .output()
            .expect("git config email");
        Command::new("git")
            .args(["config", "user.name", "voratiq test"])
            .current_dir(dir)
            .output()
            .expect("git config name");
    }

    #[test]
    fn rev_parse_and_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let cli = CliGitRepo::new(dir.path());
        cli.commit_all("initial").unwrap();

        let repo = GixRepo::open(dir.path()).unwrap();
        assert!(repo.is_clean().unwrap());
        let head = repo.rev_parse("HEAD").unwrap();
        assert_eq!(head.len(), 40);
    }

    #[test]
    fn rev_parse_unknown_errors() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let cli = CliGitRepo::new(dir.path());
        cli.commit_all("initial").unwrap();

        let repo = GixRepo::open(dir.path()).unwrap();
        let err = repo.rev_parse("not-a-ref").unwrap_err();
        assert!(matches!(err, GitError::RevisionNotFound { .. }));
    }

    #[test]
    fn worktree_add_checks_out_base_revision_contents() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let cli = CliGitRepo::new(dir.path());
        let base = cli.commit_all("initial").unwrap();

        let repo = GixRepo::open(dir.path()).unwrap();
        let ws_dir = tempfile::tempdir().unwrap();
        let ws_path = ws_dir.path().join("agent-workspace");
        let handle = repo.worktree_add(&ws_path, &base).unwrap();

        assert_eq!(handle.base_revision, base);
        assert_eq!(std::fs::read_to_string(ws_path.join("a.txt")).unwrap(), "hello\n");
        assert!(ws_path.join(".git").is_file());
    }

    #[test]
    fn worktree_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let cli = CliGitRepo::new(dir.path());
        let base = cli.commit_all("initial").unwrap();

        let repo = GixRepo::open(dir.path()).unwrap();
        let ws_dir = tempfile::tempdir().unwrap();
        let ws_path = ws_dir.path().join("agent-workspace");
        repo.worktree_add(&ws_path, &base).unwrap();

        repo.worktree_remove(&ws_path).unwrap();
        assert!(!ws_path.exists());
        repo.worktree_remove(&ws_path).unwrap();
    }
}
