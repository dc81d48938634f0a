//! Value types used in [`GitRepo`](crate::GitRepo) trait signatures.

use std::path::PathBuf;

/// A detached worktree created for a single agent or reviewer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorktreeHandle {
    /// Absolute path to the worktree's working directory.
    pub path: PathBuf,
    /// The base revision (full 40-char SHA) the worktree was created from.
    pub base_revision: String,
}

/// Summary statistics for a diff, as produced by `git diff --shortstat`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiffStat {
    /// Number of files changed.
    pub files_changed: u32,
    /// Number of inserted lines.
    pub insertions: u32,
    /// Number of deleted lines.
    pub deletions: u32,
    /// The raw shortstat line, e.g. `"3 files changed, 12 insertions(+), 4 deletions(-)"`.
    pub raw: String,
}

impl DiffStat {
    /// Parse a `git diff --shortstat` line.
    ///
    /// Returns the zero value (all counts 0, `raw` empty) for an empty diff,
    /// matching git's behavior of printing nothing when there are no changes.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self::default();
        }

        let mut stat = Self {
            raw: raw.to_owned(),
            ..Self::default()
        };

        for part in raw.split(',') {
            let part = part.trim();
            let Some(n) = part.split_whitespace().next().and_then(|s| s.parse().ok()) else {
                continue;
            };
            if part.contains("file") {
                stat.files_changed = n;
            } else if part.contains("insertion") {
                stat.insertions = n;
            } else if part.contains("deletion") {
                stat.deletions = n;
            }
        }

        stat
    }
}
