//! Repository resolution.
//!
//! A client names a repository the way it typed it: `acme/foo.git` for
//! `git push host:acme/foo.git`, `/acme/foo.git` for
//! `git push ssh://host/acme/foo.git`.  Resolvers are consulted in
//! registration order; each either claims the name and hands back a pack
//! handler bound to one repository, or declines so the next one can try.
//! Resolvers should claim only names under a prefix of their own and accept
//! both spellings of the leading `/`.

pub mod directory;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::auth::{AccessDenied, Identity};
use crate::git::{ReceivePack, UploadPack};

pub use directory::DirectoryResolver;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// A resolver claimed the name but the caller lacks the capability.
    #[error(transparent)]
    Denied(#[from] AccessDenied),
    /// No resolver claimed the name.
    #[error("no such repository")]
    NotFound,
    /// A resolver hit a local failure while resolving.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Resolver trait
// ---------------------------------------------------------------------------

/// One entry of the resolution chain.
///
/// `Ok(None)` declines the name and must leave no side effects behind.
#[async_trait::async_trait]
pub trait RepositoryResolver: Send + Sync {
    /// Label used in logs.
    fn name(&self) -> &str;

    /// Handler for a `git push` into `repository`.
    async fn create_receive_pack(
        &self,
        repository: &str,
        identity: &Identity,
    ) -> Result<Option<ReceivePack>, ResolveError>;

    /// Handler for a `git fetch` from `repository`.
    async fn create_upload_pack(
        &self,
        repository: &str,
        identity: &Identity,
    ) -> Result<Option<UploadPack>, ResolveError>;
}

/// Drop one leading `/` so `ssh://host/acme/x.git` and `host:acme/x.git`
/// name the same repository.
pub fn normalize_name(repository: &str) -> &str {
    repository.strip_prefix('/').unwrap_or(repository)
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// Ordered set of resolvers.  First claim wins.
#[derive(Default, Clone)]
pub struct ResolverChain {
    resolvers: Vec<Arc<dyn RepositoryResolver>>,
}

impl ResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resolver: Arc<dyn RepositoryResolver>) {
        debug!(resolver = resolver.name(), "registered repository resolver");
        self.resolvers.push(resolver);
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    pub async fn resolve_push(
        &self,
        repository: &str,
        identity: &Identity,
    ) -> Result<ReceivePack, ResolveError> {
        for resolver in &self.resolvers {
            let outcome = resolver.create_receive_pack(repository, identity).await;
            if let Some(done) = settle(resolver.as_ref(), repository, identity, outcome) {
                return done;
            }
        }
        debug!(repository, "no resolver claimed repository for push");
        Err(ResolveError::NotFound)
    }

    pub async fn resolve_fetch(
        &self,
        repository: &str,
        identity: &Identity,
    ) -> Result<UploadPack, ResolveError> {
        for resolver in &self.resolvers {
            let outcome = resolver.create_upload_pack(repository, identity).await;
            if let Some(done) = settle(resolver.as_ref(), repository, identity, outcome) {
                return done;
            }
        }
        debug!(repository, "no resolver claimed repository for fetch");
        Err(ResolveError::NotFound)
    }
}

impl std::fmt::Debug for ResolverChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.resolvers.iter().map(|r| r.name()))
            .finish()
    }
}

/// Decide whether one resolver's answer ends the walk.  `None` means try
/// the next resolver.
fn settle<T>(
    resolver: &dyn RepositoryResolver,
    repository: &str,
    identity: &Identity,
    outcome: Result<Option<T>, ResolveError>,
) -> Option<Result<T, ResolveError>> {
    match outcome {
        Ok(Some(handler)) => {
            debug!(resolver = resolver.name(), repository, "resolver claimed repository");
            Some(Ok(handler))
        }
        Ok(None) => None,
        Err(ResolveError::Denied(denied)) => {
            info!(
                resolver = resolver.name(),
                repository,
                %identity,
                permission = %denied.permission,
                "repository access denied"
            );
            Some(Err(ResolveError::Denied(denied)))
        }
        Err(ResolveError::Failed(e)) => {
            warn!(
                resolver = resolver.name(),
                repository,
                error = %e,
                "resolver failed; trying the next one"
            );
            None
        }
        // A resolver reporting not-found is the same as declining.
        Err(ResolveError::NotFound) => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::auth::Permission;
    use crate::git::{Git, Repository};

    #[derive(Clone, Copy)]
    enum Answer {
        Decline,
        Claim,
        Deny,
        Fail,
    }

    struct Fake {
        label: &'static str,
        answer: Answer,
        calls: AtomicUsize,
    }

    impl Fake {
        fn new(label: &'static str, answer: Answer) -> Arc<Self> {
            Arc::new(Self {
                label,
                answer,
                calls: AtomicUsize::new(0),
            })
        }

        fn answer<T>(&self, make: impl FnOnce() -> T, identity: &Identity) -> Result<Option<T>, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.answer {
                Answer::Decline => Ok(None),
                Answer::Claim => Ok(Some(make())),
                Answer::Deny => Err(ResolveError::Denied(AccessDenied {
                    identity: identity.clone(),
                    permission: Permission::Read,
                })),
                Answer::Fail => Err(anyhow::anyhow!("disk on fire").into()),
            }
        }
    }

    #[async_trait::async_trait]
    impl RepositoryResolver for Fake {
        fn name(&self) -> &str {
            self.label
        }

        async fn create_receive_pack(
            &self,
            _repository: &str,
            identity: &Identity,
        ) -> Result<Option<ReceivePack>, ResolveError> {
            let label = self.label;
            self.answer(
                || ReceivePack::new(Git::default(), Repository::bare(format!("/{label}.git"))),
                identity,
            )
        }

        async fn create_upload_pack(
            &self,
            _repository: &str,
            identity: &Identity,
        ) -> Result<Option<UploadPack>, ResolveError> {
            let label = self.label;
            self.answer(
                || UploadPack::new(Git::default(), Repository::bare(format!("/{label}.git"))),
                identity,
            )
        }
    }

    fn chain(resolvers: &[Arc<Fake>]) -> ResolverChain {
        let mut chain = ResolverChain::new();
        for r in resolvers {
            chain.register(r.clone());
        }
        chain
    }

    #[tokio::test]
    async fn first_claim_wins() {
        let a = Fake::new("a", Answer::Decline);
        let b = Fake::new("b", Answer::Claim);
        let c = Fake::new("c", Answer::Claim);
        let chain = chain(&[a.clone(), b.clone(), c.clone()]);

        let up = chain.resolve_fetch("x.git", &Identity::Anonymous).await.unwrap();
        assert_eq!(up.repository().git_dir(), std::path::Path::new("/b.git"));
        assert_eq!(c.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhaustion_is_not_found() {
        let chain = chain(&[Fake::new("a", Answer::Decline)]);
        let err = chain.resolve_push("x.git", &Identity::Anonymous).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound));

        let empty = ResolverChain::new();
        assert!(empty.is_empty());
        let err = empty.resolve_fetch("x.git", &Identity::Anonymous).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound));
    }

    #[tokio::test]
    async fn denial_stops_the_walk() {
        let denier = Fake::new("denier", Answer::Deny);
        let later = Fake::new("later", Answer::Claim);
        let chain = chain(&[denier, later.clone()]);

        let err = chain
            .resolve_push("x.git", &Identity::user("bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Denied(_)));
        assert_eq!(later.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_moves_on() {
        let broken = Fake::new("broken", Answer::Fail);
        let good = Fake::new("good", Answer::Claim);
        let chain = chain(&[broken.clone(), good]);

        let rp = chain.resolve_push("x.git", &Identity::Anonymous).await.unwrap();
        assert_eq!(rp.repository().git_dir(), std::path::Path::new("/good.git"));
        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn normalize_strips_one_slash() {
        assert_eq!(normalize_name("/acme/x.git"), "acme/x.git");
        assert_eq!(normalize_name("acme/x.git"), "acme/x.git");
    }
}
