//! Binding between an HTTP-mounted repository and the smart HTTP engine.
//!
//! The engine is created on the first request that reaches a bridge.  If
//! creation fails, that failure is remembered and every later request is
//! answered with `503` without trying again.

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Body,
    extract::Request,
    http::header,
    response::{IntoResponse, Response},
};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, instrument};

use super::csrf::MaskedRequestStore;
use super::engine::SmartHttpEngine;
use super::handler::AppError;
use crate::auth::{AccessDenied, Identity};
use crate::git::{Git, ReceivePack, Repository, UploadPack};
use crate::resolver::ResolveError;

// ---------------------------------------------------------------------------
// Repository contract
// ---------------------------------------------------------------------------

/// A repository served over smart HTTP.
///
/// Implementors supply the capability checks and how the repository is
/// opened; the provided [`upload_pack`](Self::upload_pack) and
/// [`receive_pack`](Self::receive_pack) run the checks before anything is
/// opened or created.
#[async_trait::async_trait]
pub trait HttpGitRepository: Send + Sync {
    fn check_pull_permission(&self, identity: &Identity) -> Result<(), AccessDenied>;

    fn check_push_permission(&self, identity: &Identity) -> Result<(), AccessDenied>;

    /// Open (or lazily create) the repository.
    async fn open_repository(&self) -> Result<Repository>;

    fn create_upload_pack(&self, repository: Repository) -> UploadPack;

    /// `remote` is the client address, recorded in the reflog identity.
    fn create_receive_pack(
        &self,
        repository: Repository,
        identity: &Identity,
        remote: Option<IpAddr>,
    ) -> ReceivePack;

    async fn upload_pack(&self, identity: &Identity) -> Result<UploadPack, ResolveError> {
        self.check_pull_permission(identity)?;
        let repository = self.open_repository().await?;
        Ok(self.create_upload_pack(repository))
    }

    async fn receive_pack(
        &self,
        identity: &Identity,
        remote: Option<IpAddr>,
    ) -> Result<ReceivePack, ResolveError> {
        self.check_pull_permission(identity)?;
        self.check_push_permission(identity)?;
        let repository = self.open_repository().await?;
        Ok(self.create_receive_pack(repository, identity, remote))
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The engine could not be created; replayed for every request.
    #[error("git service unavailable: {0:#}")]
    Unavailable(Arc<anyhow::Error>),
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BridgeError {
    /// Map to an HTTP error.  With `hide_denied`, a denied authenticated
    /// caller sees the same answer as for a missing repository.
    pub fn into_app_error(self, hide_denied: bool) -> AppError {
        match self {
            BridgeError::Unavailable(e) => {
                debug!(error = %e, "replaying engine initialisation failure");
                AppError::Unavailable("Git service is unavailable".into())
            }
            BridgeError::TooLarge { limit } => {
                AppError::PayloadTooLarge(format!("Request body exceeds {limit} bytes"))
            }
            BridgeError::Resolve(ResolveError::NotFound) => {
                AppError::NotFound("Repository not found".into())
            }
            BridgeError::Resolve(ResolveError::Denied(denied)) => {
                info!(identity = %denied.identity, permission = %denied.permission, "HTTP git request denied");
                if denied.identity.is_anonymous() {
                    AppError::Unauthorized("Authentication required".into())
                } else if hide_denied {
                    AppError::NotFound("Repository not found".into())
                } else {
                    AppError::Forbidden(format!("Access denied: {denied}"))
                }
            }
            BridgeError::Resolve(ResolveError::Failed(e)) | BridgeError::Internal(e) => {
                AppError::Internal(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

enum EngineState {
    Ready(SmartHttpEngine),
    Failed(Arc<anyhow::Error>),
}

/// Settings shared by every bridge.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub git: Git,
    pub max_request_bytes: usize,
    pub hide_denied_repositories: bool,
}

pub struct HttpGitBridge {
    repository: Arc<dyn HttpGitRepository>,
    options: BridgeOptions,
    store: MaskedRequestStore,
    engine: OnceCell<EngineState>,
}

impl std::fmt::Debug for HttpGitBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let engine = match self.engine.get() {
            None => "uninitialized",
            Some(EngineState::Ready(_)) => "ready",
            Some(EngineState::Failed(_)) => "failed",
        };
        f.debug_struct("HttpGitBridge")
            .field("options", &self.options)
            .field("engine", &engine)
            .finish()
    }
}

impl HttpGitBridge {
    pub fn new(
        repository: Arc<dyn HttpGitRepository>,
        options: BridgeOptions,
        store: MaskedRequestStore,
    ) -> Self {
        Self {
            repository,
            options,
            store,
            engine: OnceCell::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.initialized()
    }

    async fn engine(&self) -> Result<&SmartHttpEngine, BridgeError> {
        let git = self.options.git.clone();
        let max = self.options.max_request_bytes;
        self.engine_with(move || SmartHttpEngine::init(git, max)).await
    }

    /// Get the engine, running `init` if this is the first request.
    /// Concurrent first requests wait for the single initialisation.
    pub(crate) async fn engine_with<F, Fut>(&self, init: F) -> Result<&SmartHttpEngine, BridgeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SmartHttpEngine>>,
    {
        let state = self
            .engine
            .get_or_init(|| async move {
                match init().await {
                    Ok(engine) => EngineState::Ready(engine),
                    Err(e) => {
                        error!(error = %e, "failed to initialise smart HTTP engine");
                        EngineState::Failed(Arc::new(e))
                    }
                }
            })
            .await;

        match state {
            EngineState::Ready(engine) => Ok(engine),
            EngineState::Failed(e) => Err(BridgeError::Unavailable(Arc::clone(e))),
        }
    }

    /// Serve one request whose path below the mount point is `rest`.
    #[instrument(skip(self, request), fields(method = %request.method()))]
    pub async fn handle(&self, request: Request<Body>, rest: &str) -> Response {
        let mut request = self.store.unwrap_request(request);
        // Response compression is left to the outer layers.
        request.headers_mut().remove(header::ACCEPT_ENCODING);

        let result = match self.engine().await {
            Ok(engine) => engine.service(self.repository.as_ref(), request, rest).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(response) => response,
            Err(e) => e
                .into_app_error(self.options.hide_denied_repositories)
                .into_response(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::StatusCode;

    use super::*;
    use crate::auth::{AccessRule, Permission};

    struct Counting {
        rule: AccessRule,
        opened: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl HttpGitRepository for Counting {
        fn check_pull_permission(&self, identity: &Identity) -> Result<(), AccessDenied> {
            self.rule.check(identity, Permission::Read)
        }

        fn check_push_permission(&self, identity: &Identity) -> Result<(), AccessDenied> {
            self.rule.check(identity, Permission::Write)
        }

        async fn open_repository(&self) -> Result<Repository> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Repository::bare("/nowhere.git"))
        }

        fn create_upload_pack(&self, repository: Repository) -> UploadPack {
            UploadPack::new(Git::default(), repository)
        }

        fn create_receive_pack(
            &self,
            repository: Repository,
            _identity: &Identity,
            _remote: Option<IpAddr>,
        ) -> ReceivePack {
            ReceivePack::new(Git::default(), repository)
        }
    }

    fn counting(read: &[&str], write: &[&str]) -> Arc<Counting> {
        Arc::new(Counting {
            rule: AccessRule::new(read.iter().copied(), write.iter().copied()),
            opened: AtomicUsize::new(0),
        })
    }

    fn bridge(repo: Arc<Counting>) -> HttpGitBridge {
        HttpGitBridge::new(
            repo,
            BridgeOptions {
                git: Git::new("/nonexistent/git"),
                max_request_bytes: 1024,
                hide_denied_repositories: true,
            },
            MaskedRequestStore::new(),
        )
    }

    #[tokio::test]
    async fn denied_checks_happen_before_open() {
        let repo = counting(&["*"], &["alice"]);

        let err = repo.upload_pack(&Identity::Anonymous).await.unwrap_err();
        assert!(matches!(err, ResolveError::Denied(_)));
        let err = repo.receive_pack(&Identity::user("bob"), None).await.unwrap_err();
        assert!(matches!(err, ResolveError::Denied(_)));
        assert_eq!(repo.opened.load(Ordering::SeqCst), 0);

        repo.receive_pack(&Identity::user("alice"), None).await.unwrap();
        assert_eq!(repo.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_initialisation_is_sticky() {
        let bridge = bridge(counting(&["*"], &[]));
        let attempts = AtomicUsize::new(0);

        for _ in 0..3 {
            let err = bridge
                .engine_with(|| async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("no engine here")
                })
                .await
                .unwrap_err();
            assert!(matches!(err, BridgeError::Unavailable(_)));
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(bridge.is_initialized());
    }

    #[tokio::test]
    async fn concurrent_first_requests_initialise_once() {
        let bridge = Arc::new(bridge(counting(&["*"], &[])));
        let attempts = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let bridge = Arc::clone(&bridge);
            let attempts = Arc::clone(&attempts);
            tasks.push(tokio::spawn(async move {
                bridge
                    .engine_with(|| async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok(SmartHttpEngine::new(Git::default(), 1024))
                    })
                    .await
                    .is_ok()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unavailable_engine_answers_503() {
        let bridge = bridge(counting(&["anonymous"], &[]));
        let request = Request::builder()
            .uri("/repo.git/info/refs?service=git-upload-pack")
            .body(Body::empty())
            .unwrap();
        let response = bridge.handle(request, "info/refs").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn denial_mapping() {
        let denied = |identity: Identity| {
            BridgeError::Resolve(ResolveError::Denied(AccessDenied {
                identity,
                permission: Permission::Write,
            }))
        };
        let status = |e: AppError| e.into_response().status();

        assert_eq!(
            status(denied(Identity::Anonymous).into_app_error(true)),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status(denied(Identity::user("bob")).into_app_error(true)),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(denied(Identity::user("bob")).into_app_error(false)),
            StatusCode::FORBIDDEN
        );
    }
}
