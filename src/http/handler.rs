//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `*    /{repo}/{*rest}` - smart HTTP for each mounted workspace repository
//! - `GET  /crumbIssuer`    - crumb for the calling identity
//! - `GET  /healthz`        - health check
//!
//! Layers, outermost first: request tracing, response compression, identity
//! (HTTP Basic), forgery guard.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::Serialize;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::{debug, error, instrument, warn};

use super::csrf::{crumb_for, forgery_guard};
use crate::auth::Identity;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/crumbIssuer", get(handle_crumb_issuer))
        .route("/{repo}/{*rest}", any(handle_git))
        .layer(middleware::from_fn_with_state(state.clone(), forgery_guard))
        .layer(middleware::from_fn_with_state(state.clone(), identify))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Attach the caller's [`Identity`].  No `Authorization` header means
/// anonymous; a header that does not check out is rejected outright.
async fn identify(State(state): State<Arc<AppState>>, mut request: Request, next: Next) -> Response {
    let identity = match request.headers().get(header::AUTHORIZATION) {
        None => Identity::Anonymous,
        Some(value) => {
            let resolved = value
                .to_str()
                .ok()
                .and_then(|v| state.users.resolve_authorization(v));
            match resolved {
                Some(identity) => identity,
                None => {
                    warn!(path = request.uri().path(), "rejected invalid HTTP credentials");
                    return AppError::Unauthorized("Invalid credentials".into()).into_response();
                }
            }
        }
    };
    request.extensions_mut().insert(identity);
    next.run(request).await
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `* /{repo}/{*rest}`
///
/// The path is split by hand: a masked push arrives without the router's
/// extensions.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
async fn handle_git(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let Some((repo, rest)) = split_git_path(request.uri().path()) else {
        return AppError::NotFound("Not found".into()).into_response();
    };
    let Some(bridge) = state.http_bridges.get(&repo) else {
        debug!(%repo, "no HTTP repository mounted here");
        return AppError::NotFound("Repository not found".into()).into_response();
    };
    bridge.handle(request, &rest).await
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CrumbResponse {
    crumb_request_field: String,
    crumb: String,
}

/// `GET /crumbIssuer`
async fn handle_crumb_issuer(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Json<CrumbResponse>, AppError> {
    let identity = request
        .extensions()
        .get::<Identity>()
        .cloned()
        .unwrap_or(Identity::Anonymous);
    Ok(Json(CrumbResponse {
        crumb_request_field: state.config.security.crumb_header.clone(),
        crumb: crumb_for(&state.crumb_secret, &identity)?,
    }))
}

/// `GET /healthz`
async fn handle_health() -> &'static str {
    "ok"
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// `/{repo}/{rest}` -> (`repo`, `rest`).
fn split_git_path(path: &str) -> Option<(String, String)> {
    let (repo, rest) = path.strip_prefix('/')?.split_once('/')?;
    if repo.is_empty() {
        return None;
    }
    let repo = urlencoding::decode(repo).ok()?.into_owned();
    Some((repo, rest.to_string()))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The caller must (re-)authenticate.
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    PayloadTooLarge(String),
    /// The git service could not be started.
    Unavailable(String),
    /// An unexpected internal error.  Details are logged, not returned.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"gitserver\"")],
                msg,
            )
                .into_response(),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg).into_response(),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg).into_response(),
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
