//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function in this module shells out to the configured `git` binary.
//! Commands that operate on a work tree use `-C <work_tree>`; commands that
//! only need the object store use `--git-dir <git_dir>`, so they work for
//! bare and non-bare repositories alike.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Handle on the git binary acting as the pack-protocol engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Git {
    program: PathBuf,
}

impl Default for Git {
    fn default() -> Self {
        Self::new("git")
    }
}

impl Git {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// A command for this binary with interactive prompting disabled.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.kill_on_drop(true);
        cmd
    }

    /// A command bound to an object store.
    pub fn with_git_dir(&self, git_dir: &Path) -> Command {
        let mut cmd = self.command();
        cmd.arg("--git-dir").arg(git_dir);
        cmd
    }

    /// A command running inside a work tree.
    pub fn in_work_tree(&self, work_tree: &Path) -> Command {
        let mut cmd = self.command();
        cmd.arg("-C").arg(work_tree);
        cmd
    }

    /// `git --version`, e.g. `git version 2.43.0`.
    #[instrument(skip(self), fields(program = %self.program.display()))]
    pub async fn version(&self) -> Result<String> {
        let mut cmd = self.command();
        cmd.arg("--version");
        let output = run_checked(cmd, "git --version").await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// `git init` a non-bare repository in `work_tree` whose unborn `HEAD`
    /// points at `initial_branch`.
    #[instrument(skip(self), fields(work_tree = %work_tree.display()))]
    pub async fn init(&self, work_tree: &Path, initial_branch: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("-c")
            .arg(format!("init.defaultBranch={initial_branch}"))
            .arg("init")
            .arg("--quiet")
            .arg(work_tree);
        run_checked(cmd, "git init").await?;
        debug!("repository initialised");
        Ok(())
    }

    /// `git init --bare` at `git_dir`.
    #[instrument(skip(self), fields(git_dir = %git_dir.display()))]
    pub async fn init_bare(&self, git_dir: &Path, initial_branch: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("-c")
            .arg(format!("init.defaultBranch={initial_branch}"))
            .arg("init")
            .arg("--bare")
            .arg("--quiet")
            .arg(git_dir);
        run_checked(cmd, "git init --bare").await?;
        Ok(())
    }

    /// Stage everything in the work tree.
    pub async fn add_all(&self, work_tree: &Path) -> Result<()> {
        let mut cmd = self.in_work_tree(work_tree);
        cmd.args(["add", "--all", "."]);
        run_checked(cmd, "git add").await?;
        Ok(())
    }

    /// Commit the index with a fixed author and committer, even when
    /// nothing is staged.
    pub async fn commit(
        &self,
        work_tree: &Path,
        author_name: &str,
        author_email: &str,
        message: &str,
    ) -> Result<()> {
        let mut cmd = self.in_work_tree(work_tree);
        cmd.arg("-c")
            .arg(format!("user.name={author_name}"))
            .arg("-c")
            .arg(format!("user.email={author_email}"))
            .args(["commit", "--quiet", "--allow-empty", "-m", message]);
        run_checked(cmd, "git commit").await?;
        Ok(())
    }

    /// `git reset --hard <rev>` inside the work tree.
    #[instrument(skip(self), fields(work_tree = %work_tree.display()))]
    pub async fn reset_hard(&self, work_tree: &Path, rev: &str) -> Result<()> {
        let mut cmd = self.in_work_tree(work_tree);
        cmd.args(["reset", "--hard", "--quiet", rev]);
        run_checked(cmd, "git reset --hard").await?;
        Ok(())
    }

    /// Resolve `rev` to an object id, or `None` if it does not exist.
    pub async fn rev_parse(&self, git_dir: &Path, rev: &str) -> Result<Option<String>> {
        let mut cmd = self.with_git_dir(git_dir);
        cmd.args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("{rev}^{{commit}}"));
        let output = output_of(cmd, "git rev-parse").await?;
        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Whether the object store contains `oid`.
    pub async fn has_object(&self, git_dir: &Path, oid: &str) -> Result<bool> {
        let mut cmd = self.with_git_dir(git_dir);
        cmd.args(["cat-file", "-e", oid]);
        let output = output_of(cmd, "git cat-file").await?;
        Ok(output.status.success())
    }

    /// Point `name` at `oid`.
    pub async fn update_ref(&self, git_dir: &Path, name: &str, oid: &str) -> Result<()> {
        let mut cmd = self.with_git_dir(git_dir);
        cmd.args(["update-ref", name, oid]);
        run_checked(cmd, "git update-ref").await?;
        Ok(())
    }
}

/// Run `cmd` to completion, capturing its output regardless of status.
async fn output_of(mut cmd: Command, what: &str) -> Result<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.output()
        .await
        .with_context(|| format!("failed to spawn {what}"))
}

/// Run `cmd` and fail with its stderr if it exits unsuccessfully.
pub(crate) async fn run_checked(cmd: Command, what: &str) -> Result<Output> {
    let output = output_of(cmd, what).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{what} failed (status {}): {}", output.status, stderr.trim());
    }
    Ok(output)
}

/// Render `args` the way they would be typed, for log fields.
pub(crate) fn display_args<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    args.into_iter()
        .map(|a| a.as_ref().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn version_reports_git() {
        let version = Git::default().version().await.unwrap();
        assert!(version.starts_with("git version"), "got {version:?}");
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let git = Git::new("/nonexistent/definitely-not-git");
        let err = git.version().await.unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn commit_and_resolve() {
        let tmp = tempfile::tempdir().unwrap();
        let git = Git::default();
        git.init(tmp.path(), "master").await.unwrap();
        std::fs::write(tmp.path().join("a.txt"), "hello").unwrap();
        git.add_all(tmp.path()).await.unwrap();
        git.commit(tmp.path(), "Tester", "tester@example.com", "first")
            .await
            .unwrap();

        let git_dir = tmp.path().join(".git");
        let head = git.rev_parse(&git_dir, "HEAD").await.unwrap().unwrap();
        assert_eq!(head.len(), 40);
        assert!(git.has_object(&git_dir, &head).await.unwrap());
        assert!(git.rev_parse(&git_dir, "refs/heads/nope").await.unwrap().is_none());
    }

    #[test]
    fn display_args_joins() {
        assert_eq!(display_args(["upload-pack", "/srv/a.git"]), "upload-pack /srv/a.git");
    }
}
