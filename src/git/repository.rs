//! Repository handles.
//!
//! A [`Repository`] is only a pair of paths; opening one checks that the
//! object store is there, and it is cheap to clone.  Each request or command
//! opens its own handle.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use tracing::{debug, warn};

/// Reference to a git object store, with the work tree it belongs to if it
/// is not bare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    git_dir: PathBuf,
    work_tree: Option<PathBuf>,
}

impl Repository {
    /// Handle on the repository checked out in `work_tree` (`work_tree/.git`),
    /// whether or not it exists yet.
    pub fn for_work_tree(work_tree: impl Into<PathBuf>) -> Self {
        let work_tree = work_tree.into();
        Self {
            git_dir: work_tree.join(".git"),
            work_tree: Some(work_tree),
        }
    }

    /// Handle on a bare repository at `git_dir`, whether or not it exists yet.
    pub fn bare(git_dir: impl Into<PathBuf>) -> Self {
        Self {
            git_dir: git_dir.into(),
            work_tree: None,
        }
    }

    /// Open the repository at `path`: either a work tree containing `.git`
    /// or a bare repository.
    pub fn open(path: &Path) -> Result<Self> {
        let candidate = Self::for_work_tree(path);
        if candidate.exists() {
            return Ok(candidate);
        }
        let candidate = Self::bare(path);
        if candidate.exists() {
            return Ok(candidate);
        }
        bail!("not a git repository: {}", path.display())
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    pub fn work_tree(&self) -> Option<&Path> {
        self.work_tree.as_deref()
    }

    /// Whether the object store looks like a git repository.
    ///
    /// A repository must be a directory that contains a `HEAD` file.  This
    /// is a lightweight heuristic, not a full integrity check.
    pub fn exists(&self) -> bool {
        if !self.git_dir.join("HEAD").is_file() {
            return false;
        }
        if !self.git_dir.join("objects").is_dir() || !self.git_dir.join("refs").is_dir() {
            warn!(
                git_dir = %self.git_dir.display(),
                "HEAD exists but objects/ or refs/ directory is missing"
            );
        }
        debug!(git_dir = %self.git_dir.display(), "repository present");
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
