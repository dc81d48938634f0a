//! Git abstraction layer for voratiq.
//!
//! This crate defines the [`GitRepo`] trait — the single interface through
//! which the orchestration layer touches git. No other voratiq crate shells
//! out to `git` directly; they depend on `voratiq-git` and program against
//! the trait.
//!
//! The default implementation, [`GixRepo`], is backed by
//! [gix](https://github.com/GitoxideLabs/gitoxide) for ref resolution, dirty
//! checks, and tree checkout. [`CliGitRepo`], a thin wrapper over the `git`
//! binary on `PATH`, remains available both as [`GixRepo`]'s fallback for
//! the porcelain surfaces gix has no high-level API for (whole-worktree
//! diff, patch application, stage-and-commit) and as a standalone
//! implementation in its own right.
//!
//! # Crate layout
//!
//! - [`repo`] — the [`GitRepo`] trait definition.
//! - [`types`] — value types used in trait signatures ([`DiffStat`],
//!   [`WorktreeHandle`], ...).
//! - [`error`] — the [`GitError`] enum returned by all trait methods.
//! - [`gix_repo`] — the gix-backed implementation.
//! - [`cli`] — the `git`-CLI-backed implementation.

pub mod cli;
pub mod error;
pub mod gix_repo;
pub mod repo;
pub mod types;

pub use cli::CliGitRepo;
pub use error::GitError;
pub use gix_repo::GixRepo;
pub use repo::GitRepo;
pub use types::{DiffStat, WorktreeHandle};
