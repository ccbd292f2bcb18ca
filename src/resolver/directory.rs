//! Resolver serving every existing repository below a root directory.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, instrument, warn};

use super::{normalize_name, RepositoryResolver, ResolveError};
use crate::auth::{AccessRule, Identity, Permission};
use crate::git::{Git, ReceivePack, Repository, UploadPack};

/// Claims `{prefix}{path}` and maps it to `{root}/{path}` (or
/// `{root}/{path}.git`).  Never creates repositories.
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    label: String,
    prefix: String,
    root: PathBuf,
    access: AccessRule,
    git: Git,
}

impl DirectoryResolver {
    pub fn new(prefix: impl Into<String>, root: impl Into<PathBuf>, access: AccessRule, git: Git) -> Self {
        let prefix = prefix.into();
        Self {
            label: format!("directory:{prefix}"),
            prefix,
            root: root.into(),
            access,
            git,
        }
    }

    /// The part of `repository` below the prefix, or `None` if the name is
    /// not ours.
    fn claim<'a>(&self, repository: &'a str) -> Option<&'a str> {
        normalize_name(repository).strip_prefix(self.prefix.as_str())
    }

    /// Find the repository for `relative`, rejecting anything that would
    /// escape the root.
    fn locate(&self, relative: &str) -> Option<Repository> {
        if relative.is_empty() {
            return None;
        }
        let path = Path::new(relative);
        if !path.components().all(|c| matches!(c, Component::Normal(_))) {
            warn!(prefix = %self.prefix, relative, "rejecting repository path outside the root");
            return None;
        }

        let mut candidates = vec![self.root.join(path)];
        if !relative.ends_with(".git") {
            candidates.push(self.root.join(format!("{relative}.git")));
        }

        for candidate in candidates {
            if let Ok(repo) = Repository::open(&candidate) {
                return Some(repo);
            }
        }
        debug!(root = %self.root.display(), relative, "no repository on disk");
        None
    }
}

#[async_trait::async_trait]
impl RepositoryResolver for DirectoryResolver {
    fn name(&self) -> &str {
        &self.label
    }

    #[instrument(skip(self, identity), fields(resolver = %self.label))]
    async fn create_receive_pack(
        &self,
        repository: &str,
        identity: &Identity,
    ) -> Result<Option<ReceivePack>, ResolveError> {
        let Some(relative) = self.claim(repository) else {
            return Ok(None);
        };
        self.access.check(identity, Permission::Read)?;
        self.access.check(identity, Permission::Write)?;

        Ok(self
            .locate(relative)
            .map(|repo| ReceivePack::new(self.git.clone(), repo)))
    }

    #[instrument(skip(self, identity), fields(resolver = %self.label))]
    async fn create_upload_pack(
        &self,
        repository: &str,
        identity: &Identity,
    ) -> Result<Option<UploadPack>, ResolveError> {
        let Some(relative) = self.claim(repository) else {
            return Ok(None);
        };
        self.access.check(identity, Permission::Read)?;

        Ok(self
            .locate(relative)
            .map(|repo| UploadPack::new(self.git.clone(), repo)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> (tempfile::TempDir, DirectoryResolver) {
        let tmp = tempfile::tempdir().unwrap();
        Git::default()
            .init_bare(&tmp.path().join("tools.git"), "master")
            .await
            .unwrap();
        let resolver = DirectoryResolver::new(
            "acme/",
            tmp.path(),
            AccessRule::new(["*"], ["alice"]),
            Git::default(),
        );
        (tmp, resolver)
    }

    #[tokio::test]
    async fn claims_with_and_without_suffix() {
        let (tmp, resolver) = fixture().await;
        let alice = Identity::user("alice");

        for name in ["acme/tools", "acme/tools.git", "/acme/tools.git"] {
            let up = resolver
                .create_upload_pack(name, &alice)
                .await
                .unwrap()
                .unwrap_or_else(|| panic!("{name} should resolve"));
            assert_eq!(up.repository().git_dir(), tmp.path().join("tools.git"));
        }
    }

    #[tokio::test]
    async fn declines_foreign_and_missing_names() {
        let (_tmp, resolver) = fixture().await;
        let alice = Identity::user("alice");

        assert!(resolver.create_upload_pack("other/tools.git", &alice).await.unwrap().is_none());
        assert!(resolver.create_upload_pack("acme/missing.git", &alice).await.unwrap().is_none());
        assert!(resolver.create_upload_pack("acme/", &alice).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_traversal() {
        let (tmp, resolver) = fixture().await;
        let inner = tmp.path().join("inner");
        std::fs::create_dir(&inner).unwrap();
        let nested = DirectoryResolver::new("acme/", &inner, AccessRule::new(["*"], ["*"]), Git::default());

        let out = nested
            .create_upload_pack("acme/../tools.git", &Identity::user("alice"))
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn checks_capability_before_lookup() {
        let (_tmp, resolver) = fixture().await;

        // Denied even though the repository does not exist.
        let err = resolver
            .create_upload_pack("acme/missing.git", &Identity::Anonymous)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Denied(_)));

        let err = resolver
            .create_receive_pack("acme/tools.git", &Identity::user("bob"))
            .await
            .unwrap_err();
        match err {
            ResolveError::Denied(denied) => assert_eq!(denied.permission, Permission::Write),
            other => panic!("expected denial, got {other:?}"),
        }

        assert!(resolver
            .create_receive_pack("acme/tools.git", &Identity::user("alice"))
            .await
            .unwrap()
            .is_some());
    }
}
