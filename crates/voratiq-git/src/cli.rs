//! `git`-CLI-backed implementation of [`GitRepo`].

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tracing::debug;

use crate::error::GitError;
use crate::repo::GitRepo;
use crate::types::{DiffStat, WorktreeHandle};

/// A [`GitRepo`] implementation that shells out to the `git` binary on
/// `PATH`, scoped to a single repository root.
#[derive(Clone, Debug)]
pub struct CliGitRepo {
    root: PathBuf,
}

impl CliGitRepo {
    /// Create a handle scoped to the repository at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The repository root this handle operates against.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run(&self, args: &[&str]) -> Result<Output, GitError> {
        debug!(?args, "running git");
        Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(GitError::Io)
    }

    fn run_ok(&self, command: &str, args: &[&str]) -> Result<String, GitError> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: command.to_owned(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl GitRepo for CliGitRepo {
    fn rev_parse(&self, spec: &str) -> Result<String, GitError> {
        let output = self.run(&["rev-parse", "--verify", spec])?;
        if !output.status.success() {
            return Err(GitError::RevisionNotFound {
                spec: spec.to_owned(),
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    fn is_clean(&self) -> Result<bool, GitError> {
        let out = self.run_ok("status", &["status", "--porcelain"])?;
        Ok(out.trim().is_empty())
    }

    fn worktree_add(&self, path: &Path, base_revision: &str) -> Result<WorktreeHandle, GitError> {
        let path_str = path.to_string_lossy().into_owned();
        self.run_ok(
            "worktree add",
            &["worktree", "add", "--detach", &path_str, base_revision],
        )
        .map_err(|e| GitError::WorktreeFailed {
            message: e.to_string(),
        })?;
        Ok(WorktreeHandle {
            path: path.to_owned(),
            base_revision: base_revision.to_owned(),
        })
    }

    fn worktree_remove(&self, path: &Path) -> Result<(), GitError> {
        let path_str = path.to_string_lossy().into_owned();
        let output = self.run(&["worktree", "remove", "--force", &path_str])?;
        if !output.status.success() && path.exists() {
            return Err(GitError::WorktreeFailed {
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    fn diff(&self, worktree: &Path, base_revision: &str) -> Result<String, GitError> {
        let worktree_str = worktree.to_string_lossy().into_owned();
        Command::new("git")
            .args(["diff", "--no-color", base_revision, "--"])
            .current_dir(&worktree_str)
            .output()
            .map_err(GitError::Io)
            .and_then(|output| {
                if output.status.success() {
                    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
                } else {
                    Err(GitError::CommandFailed {
                        command: "diff".to_owned(),
                        code: output.status.code(),
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    })
                }
            })
    }

    fn diff_shortstat(&self, worktree: &Path, base_revision: &str) -> Result<DiffStat, GitError> {
        let output = Command::new("git")
            .args(["diff", "--shortstat", base_revision])
            .current_dir(worktree)
            .output()
            .map_err(GitError::Io)?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: "diff --shortstat".to_owned(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(DiffStat::parse(&String::from_utf8_lossy(&output.stdout)))
    }

    fn apply(&self, patch: &str) -> Result<(), GitError> {
        use std::io::Write as _;
        use std::process::Stdio;

        let mut child = Command::new("git")
            .args(["apply", "--whitespace=nowarn"])
            .current_dir(&self.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(GitError::Io)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(patch.as_bytes()).map_err(GitError::Io)?;
        }

        let output = child.wait_with_output().map_err(GitError::Io)?;
        if !output.status.success() {
            return Err(GitError::ApplyFailed {
                base: "HEAD".to_owned(),
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    fn commit_all(&self, message: &str) -> Result<String, GitError> {
        self.run_ok("add", &["add", "-A"])?;
        self.run_ok("commit", &["commit", "-m", message])?;
        self.rev_parse("HEAD")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) {
        Command::new("git")
            .args(["init", "-q"])
            .current_dir(dir)
            .output()
            .expect("git init");
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
        let repo = CliGitRepo::new(dir.path());
        repo.commit_all("initial").unwrap();

        assert!(repo.is_clean().unwrap());
        let head = repo.rev_parse("HEAD").unwrap();
        assert_eq!(head.len(), 40);
    }

    #[test]
    fn rev_parse_unknown_errors() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let repo = CliGitRepo::new(dir.path());
        repo.commit_all("initial").unwrap();

        let err = repo.rev_parse("not-a-ref").unwrap_err();
        assert!(matches!(err, GitError::RevisionNotFound { .. }));
    }

    #[test]
    fn worktree_add_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let repo = CliGitRepo::new(dir.path());
        let base = repo.commit_all("initial").unwrap();

        let ws_dir = tempfile::tempdir().unwrap();
        let ws_path = ws_dir.path().join("agent-workspace");
        let handle = repo.worktree_add(&ws_path, &base).unwrap();
        assert!(handle.path.join("a.txt").exists());

        repo.worktree_remove(&ws_path).unwrap();
    }

    #[test]
    fn diff_and_shortstat_reflect_changes() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let repo = CliGitRepo::new(dir.path());
        let base = repo.commit_all("initial").unwrap();

        let ws_dir = tempfile::tempdir().unwrap();
        let ws_path = ws_dir.path().join("agent-workspace");
        repo.worktree_add(&ws_path, &base).unwrap();
        std::fs::write(ws_path.join("a.txt"), "hello world\n").unwrap();

        let ws_repo = CliGitRepo::new(&ws_path);
        let diff = ws_repo.diff(&ws_path, &base).unwrap();
        assert!(diff.contains("hello world"));

        let stat = ws_repo.diff_shortstat(&ws_path, &base).unwrap();
        assert_eq!(stat.files_changed, 1);
    }

    #[test]
    fn apply_rejects_stale_patch() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let repo = CliGitRepo::new(dir.path());
        repo.commit_all("initial").unwrap();

        let bogus_patch = "diff --git a/nonexistent.txt b/nonexistent.txt\n\
            index 0000000..1111111 100644\n\
            --- a/nonexistent.txt\n\
            +++ b/nonexistent.txt\n\
            @@ -1 +1 @@\n\
            -old\n\
            +new\n";
        let err = repo.apply(bogus_patch).unwrap_err();
        assert!(matches!(err, GitError::ApplyFailed { .. }));
    }
}
