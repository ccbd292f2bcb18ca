//! Workspace repositories.
//!
//! A [`FileBackedRepository`] is a non-bare repository whose work tree is a
//! directory the host already maintains.  The repository is created on
//! first use, importing whatever the directory holds, and the work tree is
//! reset to the sync branch after every push.  It is served over HTTP at
//! `/{name}/` and claimed by the resolver chain under `name`.

use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::auth::{AccessDenied, AccessRule, Identity, Permission};
use crate::config::WorkspaceConfig;
use crate::git::{Git, PostReceiveHook, ReceivePack, Repository, UploadPack};
use crate::http::HttpGitRepository;
use crate::resolver::{normalize_name, RepositoryResolver, ResolveError};

const IMPORT_AUTHOR_NAME: &str = "gitserver";
const IMPORT_AUTHOR_EMAIL: &str = "noreply@gitserver.invalid";
const IMPORT_MESSAGE: &str = "Initial import of the existing contents";

pub struct FileBackedRepository {
    name: String,
    workspace: PathBuf,
    access: AccessRule,
    sync_branch: String,
    git: Git,
    // Serialises first-use creation.
    create_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for FileBackedRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackedRepository")
            .field("name", &self.name)
            .field("workspace", &self.workspace)
            .field("sync_branch", &self.sync_branch)
            .finish()
    }
}

impl FileBackedRepository {
    /// Creates the workspace directory if it is missing.  Failure to do so
    /// is logged; the repository is still usable if the directory appears
    /// later.
    pub fn new(config: &WorkspaceConfig, git: Git) -> Self {
        match std::fs::create_dir(&config.path) {
            Ok(()) => info!(workspace = %config.path.display(), "created workspace directory"),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => warn!(
                workspace = %config.path.display(),
                error = %e,
                "cannot create workspace directory"
            ),
        }
        Self {
            name: config.name.clone(),
            workspace: config.path.clone(),
            access: config.access.clone(),
            sync_branch: config.sync_branch.clone(),
            git,
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// The workspace repository, created on first use.
    #[instrument(skip(self), fields(workspace = %self.workspace.display()))]
    async fn open_or_create(&self) -> Result<Repository> {
        let _guard = self.create_lock.lock().await;
        let repo = Repository::for_work_tree(&self.workspace);
        if !repo.exists() {
            self.create_initial_repository().await?;
        }
        Ok(repo)
    }

    /// `git init` the workspace and commit its current contents.  A failed
    /// import leaves an empty repository behind.
    async fn create_initial_repository(&self) -> Result<()> {
        self.git
            .init(&self.workspace, &self.sync_branch)
            .await
            .with_context(|| format!("cannot create repository in {}", self.workspace.display()))?;

        let imported = async {
            self.git.add_all(&self.workspace).await?;
            self.git
                .commit(&self.workspace, IMPORT_AUTHOR_NAME, IMPORT_AUTHOR_EMAIL, IMPORT_MESSAGE)
                .await
        }
        .await;
        match imported {
            Ok(()) => info!(repository = %self.name, "imported existing workspace contents"),
            Err(e) => warn!(
                repository = %self.name,
                error = %e,
                "initial import of the workspace failed"
            ),
        }
        Ok(())
    }

    fn receive_pack_for(&self, repository: Repository) -> ReceivePack {
        let mut rp = ReceivePack::new(self.git.clone(), repository);
        // The work tree is refreshed by the hook, so pushing into the
        // checked-out branch is fine.
        rp.set_config("receive.denyCurrentBranch", "ignore");
        rp.set_post_receive_hook(Arc::new(WorkspaceSync {
            git: self.git.clone(),
            branch: self.sync_branch.clone(),
        }));
        rp
    }

    fn claims(&self, repository: &str) -> bool {
        normalize_name(repository) == self.name
    }
}

#[async_trait::async_trait]
impl HttpGitRepository for FileBackedRepository {
    fn check_pull_permission(&self, identity: &Identity) -> Result<(), AccessDenied> {
        self.access.check(identity, Permission::Read)
    }

    fn check_push_permission(&self, identity: &Identity) -> Result<(), AccessDenied> {
        self.access.check(identity, Permission::Write)
    }

    async fn open_repository(&self) -> Result<Repository> {
        self.open_or_create().await
    }

    fn create_upload_pack(&self, repository: Repository) -> UploadPack {
        UploadPack::new(self.git.clone(), repository)
    }

    fn create_receive_pack(
        &self,
        repository: Repository,
        identity: &Identity,
        remote: Option<IpAddr>,
    ) -> ReceivePack {
        let mut rp = self.receive_pack_for(repository);
        let host = remote.map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
        let name = identity.name();
        rp.set_ref_log_ident(name, &format!("{name}@{host}"));
        rp
    }
}

#[async_trait::async_trait]
impl RepositoryResolver for FileBackedRepository {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_receive_pack(
        &self,
        repository: &str,
        identity: &Identity,
    ) -> Result<Option<ReceivePack>, ResolveError> {
        if !self.claims(repository) {
            return Ok(None);
        }
        self.check_pull_permission(identity)?;
        self.check_push_permission(identity)?;
        let repo = self.open_or_create().await?;
        Ok(Some(self.receive_pack_for(repo)))
    }

    async fn create_upload_pack(
        &self,
        repository: &str,
        identity: &Identity,
    ) -> Result<Option<UploadPack>, ResolveError> {
        if !self.claims(repository) {
            return Ok(None);
        }
        self.check_pull_permission(identity)?;
        let repo = self.open_or_create().await?;
        Ok(Some(UploadPack::new(self.git.clone(), repo)))
    }
}

// ---------------------------------------------------------------------------
// Post-receive sync
// ---------------------------------------------------------------------------

/// Resets the work tree to a fixed branch after a push.
struct WorkspaceSync {
    git: Git,
    branch: String,
}

#[async_trait::async_trait]
impl PostReceiveHook for WorkspaceSync {
    async fn on_post_receive(&self, repository: &Repository) -> Result<()> {
        let work_tree = repository
            .work_tree()
            .context("workspace repository has no work tree")?;
        self.git.reset_hard(work_tree, &self.branch).await?;
        info!(work_tree = %work_tree.display(), branch = %self.branch, "workspace updated");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config(path: &Path, read: &[&str], write: &[&str]) -> WorkspaceConfig {
        WorkspaceConfig {
            name: "userContent.git".into(),
            path: path.to_path_buf(),
            access: AccessRule::new(read.iter().copied(), write.iter().copied()),
            sync_branch: "master".into(),
        }
    }

    #[tokio::test]
    async fn first_open_imports_existing_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("userContent");
        let ws = FileBackedRepository::new(&config(&dir, &["*"], &["alice"]), Git::default());
        assert!(dir.is_dir());
        std::fs::write(dir.join("readme.txt"), "hello").unwrap();

        let repo = ws.open_repository().await.unwrap();
        assert_eq!(repo.work_tree(), Some(dir.as_path()));
        let head = Git::default()
            .rev_parse(repo.git_dir(), "refs/heads/master")
            .await
            .unwrap();
        assert!(head.is_some());

        // Second open reuses the repository.
        let again = ws.open_repository().await.unwrap();
        assert_eq!(again, repo);
    }

    #[tokio::test]
    async fn empty_workspace_still_gets_a_branch() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = FileBackedRepository::new(&config(tmp.path(), &["*"], &[]), Git::default());
        let repo = ws.open_repository().await.unwrap();
        let head = Git::default().rev_parse(repo.git_dir(), "master").await.unwrap();
        assert!(head.is_some());
    }

    #[tokio::test]
    async fn sync_hook_resets_work_tree() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("page.html"), "v1").unwrap();
        let ws = FileBackedRepository::new(&config(tmp.path(), &["*"], &["*"]), Git::default());
        let repo = ws.open_repository().await.unwrap();

        std::fs::write(tmp.path().join("page.html"), "scribbled").unwrap();
        let hook = WorkspaceSync {
            git: Git::default(),
            branch: "master".into(),
        };
        hook.on_post_receive(&repo).await.unwrap();
        assert_eq!(std::fs::read_to_string(tmp.path().join("page.html")).unwrap(), "v1");
    }

    #[tokio::test]
    async fn resolver_claims_exact_name_only() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = FileBackedRepository::new(&config(tmp.path(), &["*"], &["alice"]), Git::default());
        let alice = Identity::user("alice");

        assert!(RepositoryResolver::create_upload_pack(&ws, "/userContent.git", &alice)
            .await
            .unwrap()
            .is_some());
        assert!(RepositoryResolver::create_upload_pack(&ws, "userContent", &alice)
            .await
            .unwrap()
            .is_none());

        let err = RepositoryResolver::create_receive_pack(&ws, "userContent.git", &Identity::user("bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Denied(_)));
    }

    #[tokio::test]
    async fn denied_pull_never_creates_repository() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = FileBackedRepository::new(&config(tmp.path(), &["alice"], &[]), Git::default());

        let err = ws.upload_pack(&Identity::Anonymous).await.unwrap_err();
        assert!(matches!(err, ResolveError::Denied(_)));
        assert!(!tmp.path().join(".git").exists());
    }
}
