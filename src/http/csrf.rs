//! Forgery protection and the git-push exclusion.
//!
//! State-changing requests must carry a crumb header.  Git clients cannot
//! send one, so pushes (`application/x-git-receive-pack-request`) are
//! masked instead: the original request is parked in a
//! [`MaskedRequestStore`] and the request that continues down the stack
//! looks like a `BOGUS` request with a `bogus` query and an empty body.
//! Nothing between the guard and the git endpoint can read parameters out of
//! the pack body; the git bridge recovers the original by token.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, Method, StatusCode, Uri, Version},
    middleware::Next,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::Identity;
use crate::AppState;

/// Content type that marks a git push body.
pub const RECEIVE_PACK_REQUEST: &str = "application/x-git-receive-pack-request";

/// Content type of a smart HTTP fetch.  Fetches never change state.
const UPLOAD_PACK_REQUEST: &str = "application/x-git-upload-pack-request";

const BOGUS: &str = "bogus";

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Request views
// ---------------------------------------------------------------------------

/// The parts of a request that downstream filters inspect.
pub trait RequestView {
    fn method(&self) -> &str;
    fn query_string(&self) -> Option<&str>;
    fn parameter(&self, name: &str) -> Option<String>;
    fn parameter_values(&self, name: &str) -> Vec<String>;
    fn parameter_names(&self) -> Vec<String>;
    fn parameter_map(&self) -> BTreeMap<String, Vec<String>>;
    fn headers(&self) -> &HeaderMap;
}

impl RequestView for Request<Body> {
    fn method(&self) -> &str {
        Request::method(self).as_str()
    }

    fn query_string(&self) -> Option<&str> {
        self.uri().query()
    }

    fn parameter(&self, name: &str) -> Option<String> {
        query_pairs(self.uri().query())
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    fn parameter_values(&self, name: &str) -> Vec<String> {
        query_pairs(self.uri().query())
            .into_iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v)
            .collect()
    }

    fn parameter_names(&self) -> Vec<String> {
        self.parameter_map().into_keys().collect()
    }

    fn parameter_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (k, v) in query_pairs(self.uri().query()) {
            map.entry(k).or_default().push(v);
        }
        map
    }

    fn headers(&self) -> &HeaderMap {
        Request::headers(self)
    }
}

fn query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    let Some(query) = query else {
        return Vec::new();
    };
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(k), decode_component(v))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Key of a parked original request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaskToken(Uuid);

/// Side table holding original requests while their masked stand-ins travel
/// through the middleware stack.
#[derive(Clone, Default)]
pub struct MaskedRequestStore {
    inner: Arc<Mutex<HashMap<MaskToken, Request<Body>>>>,
}

impl MaskedRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MaskToken, Request<Body>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn park(&self, request: Request<Body>) -> MaskToken {
        let token = MaskToken(Uuid::new_v4());
        self.lock().insert(token, request);
        token
    }

    /// Remove and return the original parked under `token`.
    pub fn take(&self, token: MaskToken) -> Option<Request<Body>> {
        self.lock().remove(&token)
    }

    /// Drop whatever is still parked under `token`.
    pub fn discard(&self, token: MaskToken) {
        if self.lock().remove(&token).is_some() {
            debug!(?token, "discarded unclaimed masked request");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// The original request behind a masked one, or `request` itself when it
    /// was never masked (or its original was already claimed).
    pub fn unwrap_request(&self, request: Request<Body>) -> Request<Body> {
        match request.extensions().get::<MaskToken>().copied() {
            Some(token) => self.take(token).unwrap_or(request),
            None => request,
        }
    }
}

impl std::fmt::Debug for MaskedRequestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskedRequestStore")
            .field("parked", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Exclusion
// ---------------------------------------------------------------------------

/// A push request with its payload hidden.
#[derive(Debug)]
pub struct MaskedRequest {
    token: MaskToken,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
}

impl MaskedRequest {
    pub fn token(&self) -> MaskToken {
        self.token
    }

    /// The stand-in request: method `BOGUS`, query `bogus`, empty body, the
    /// original headers, and no extensions but the token.
    pub fn into_request(self) -> Request<Body> {
        let mut request = Request::new(Body::empty());
        *request.method_mut() = bogus_method();
        *request.uri_mut() = self.uri;
        *request.version_mut() = self.version;
        *request.headers_mut() = self.headers;
        request.extensions_mut().insert(self.token);
        request
    }
}

impl RequestView for MaskedRequest {
    fn method(&self) -> &str {
        "BOGUS"
    }

    fn query_string(&self) -> Option<&str> {
        Some(BOGUS)
    }

    fn parameter(&self, _name: &str) -> Option<String> {
        Some(BOGUS.to_string())
    }

    fn parameter_values(&self, _name: &str) -> Vec<String> {
        vec![BOGUS.to_string()]
    }

    fn parameter_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn parameter_map(&self) -> BTreeMap<String, Vec<String>> {
        BTreeMap::new()
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

fn bogus_method() -> Method {
    Method::from_bytes(b"BOGUS").expect("BOGUS is a valid method token")
}

fn with_bogus_query(uri: &Uri) -> Uri {
    let path = uri.path();
    format!("{path}?{BOGUS}")
        .parse()
        .unwrap_or_else(|_| uri.clone())
}

/// Exempts git pushes from the crumb check by masking them.
#[derive(Debug, Clone)]
pub struct CsrfExclusion {
    store: MaskedRequestStore,
}

impl CsrfExclusion {
    pub fn new(store: MaskedRequestStore) -> Self {
        Self { store }
    }

    /// Mask `request` if it is a git push; otherwise hand it back untouched.
    pub fn process(&self, request: Request<Body>) -> Result<MaskedRequest, Request<Body>> {
        let is_push = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct == RECEIVE_PACK_REQUEST)
            .unwrap_or(false);
        if !is_push {
            return Err(request);
        }

        let uri = with_bogus_query(request.uri());
        let version = request.version();
        let headers = request.headers().clone();
        let token = self.store.park(request);
        debug!(?token, "masked git push request");

        Ok(MaskedRequest {
            token,
            uri,
            version,
            headers,
        })
    }
}

// ---------------------------------------------------------------------------
// Crumbs
// ---------------------------------------------------------------------------

fn crumb_mac(secret: &str, identity: &Identity) -> anyhow::Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("HMAC key error: {e}"))?;
    mac.update(identity.name().as_bytes());
    Ok(mac)
}

/// Crumb for `identity`: hex HMAC-SHA256 of its principal, keyed by `secret`.
pub fn crumb_for(secret: &str, identity: &Identity) -> anyhow::Result<String> {
    let mac = crumb_mac(secret, identity)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a presented crumb in constant time.
pub fn verify_crumb(secret: &str, identity: &Identity, presented: &str) -> anyhow::Result<()> {
    let bytes =
        hex::decode(presented).map_err(|e| anyhow::anyhow!("invalid hex in crumb: {e}"))?;
    crumb_mac(secret, identity)?
        .verify_slice(&bytes)
        .map_err(|_| anyhow::anyhow!("crumb mismatch"))
}

/// Safe methods, and fetch RPCs against a git endpoint.
fn is_safe(request: &Request) -> bool {
    let safe_method = matches!(
        *request.method(),
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    );
    safe_method
        || (request.uri().path().ends_with("/git-upload-pack")
            && request
                .headers()
                .get(header::CONTENT_TYPE)
                .is_some_and(|ct| ct == UPLOAD_PACK_REQUEST))
}

/// Rejects state-changing requests without a valid crumb, except git pushes,
/// which are masked and passed on.  Leftover parked originals are discarded
/// once the response is produced.
pub async fn forgery_guard(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if is_safe(&request) {
        return next.run(request).await;
    }

    let request = match state.csrf.process(request) {
        Ok(masked) => {
            let token = masked.token();
            let response = next.run(masked.into_request()).await;
            state.masked.discard(token);
            return response;
        }
        Err(request) => request,
    };

    let identity = request
        .extensions()
        .get::<Identity>()
        .cloned()
        .unwrap_or(Identity::Anonymous);
    let verdict = match request
        .headers()
        .get(state.config.security.crumb_header.as_str())
        .and_then(|v| v.to_str().ok())
    {
        Some(presented) => verify_crumb(&state.crumb_secret, &identity, presented),
        None => Err(anyhow::anyhow!("no crumb header")),
    };

    if let Err(reason) = verdict {
        warn!(
            method = %request.method(),
            path = request.uri().path(),
            %identity,
            %reason,
            "rejected request without a valid crumb"
        );
        return (StatusCode::FORBIDDEN, "No valid crumb was included in the request\n").into_response();
    }
    next.run(request).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn push_request() -> Request<Body> {
        let mut request = Request::builder()
            .method(Method::POST)
            .uri("/userContent.git/git-receive-pack?json=%7B%7D&a=1")
            .header(header::CONTENT_TYPE, RECEIVE_PACK_REQUEST)
            .header("X-Trace", "abc")
            .body(Body::from("0000PACK..."))
            .unwrap();
        request.extensions_mut().insert(Identity::user("alice"));
        request
    }

    #[test]
    fn masks_push_requests() {
        let store = MaskedRequestStore::new();
        let exclusion = CsrfExclusion::new(store.clone());

        let masked = exclusion.process(push_request()).unwrap();
        assert_eq!(RequestView::method(&masked), "BOGUS");
        assert_eq!(masked.query_string(), Some("bogus"));
        assert_eq!(masked.parameter("json").as_deref(), Some("bogus"));
        assert_eq!(masked.parameter_values("anything"), vec!["bogus".to_string()]);
        assert!(masked.parameter_names().is_empty());
        assert!(masked.parameter_map().is_empty());
        assert_eq!(store.len(), 1);

        let stand_in = masked.into_request();
        assert_eq!(stand_in.method().as_str(), "BOGUS");
        assert_eq!(stand_in.uri().query(), Some("bogus"));
        assert_eq!(stand_in.uri().path(), "/userContent.git/git-receive-pack");
        assert_eq!(RequestView::headers(&stand_in)["x-trace"], "abc");
        assert!(stand_in.extensions().get::<Identity>().is_none());
        assert!(stand_in.extensions().get::<MaskToken>().is_some());
    }

    #[test]
    fn declines_other_requests() {
        let exclusion = CsrfExclusion::new(MaskedRequestStore::new());
        let request = Request::builder()
            .method(Method::POST)
            .uri("/job/x/build?delay=0")
            .header(header::CONTENT_TYPE, "application/x-git-upload-pack-request")
            .body(Body::empty())
            .unwrap();

        let declined = exclusion.process(request).unwrap_err();
        assert_eq!(declined.method(), Method::POST);
        assert_eq!(declined.uri().query(), Some("delay=0"));
    }

    #[test]
    fn unwrap_recovers_original_once() {
        let store = MaskedRequestStore::new();
        let exclusion = CsrfExclusion::new(store.clone());
        let stand_in = exclusion.process(push_request()).unwrap().into_request();
        let token = *stand_in.extensions().get::<MaskToken>().unwrap();

        let original = store.unwrap_request(stand_in);
        assert_eq!(original.method(), Method::POST);
        assert_eq!(original.parameter("json").as_deref(), Some("{}"));
        assert_eq!(original.extensions().get::<Identity>(), Some(&Identity::user("alice")));
        assert!(store.is_empty());
        assert!(store.take(token).is_none());
    }

    #[test]
    fn unwrap_passes_plain_requests_through() {
        let store = MaskedRequestStore::new();
        let request = Request::builder().uri("/x?y=1").body(Body::empty()).unwrap();
        let same = store.unwrap_request(request);
        assert_eq!(same.uri().query(), Some("y=1"));
    }

    #[test]
    fn plain_view_parses_query() {
        let request = Request::builder()
            .uri("/x?a=1&b=two+words&a=3&flag")
            .body(Body::empty())
            .unwrap();
        assert_eq!(request.parameter("a").as_deref(), Some("1"));
        assert_eq!(request.parameter_values("a"), vec!["1", "3"]);
        assert_eq!(request.parameter("b").as_deref(), Some("two words"));
        assert_eq!(request.parameter_names(), vec!["a", "b", "flag"]);
        assert_eq!(RequestView::method(&request), "GET");
    }

    #[test]
    fn crumbs_differ_per_principal() {
        let alice = crumb_for("s", &Identity::user("alice")).unwrap();
        assert_eq!(alice.len(), 64);
        assert_eq!(alice, crumb_for("s", &Identity::user("alice")).unwrap());
        assert_ne!(alice, crumb_for("s", &Identity::Anonymous).unwrap());
        assert_ne!(alice, crumb_for("t", &Identity::user("alice")).unwrap());
    }

    #[test]
    fn verifies_only_the_issued_crumb() {
        let alice = Identity::user("alice");
        let crumb = crumb_for("s", &alice).unwrap();
        assert!(verify_crumb("s", &alice, &crumb).is_ok());
        assert!(verify_crumb("s", &Identity::Anonymous, &crumb).is_err());
        assert!(verify_crumb("t", &alice, &crumb).is_err());
        assert!(verify_crumb("s", &alice, &crumb[..62]).is_err());
        assert!(verify_crumb("s", &alice, "not hex").is_err());
    }

    fn post(uri: &str, content_type: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn only_fetch_rpcs_skip_the_crumb() {
        assert!(is_safe(&Request::builder().uri("/x").body(Body::empty()).unwrap()));
        assert!(is_safe(&post("/repo.git/git-upload-pack", UPLOAD_PACK_REQUEST)));
        assert!(!is_safe(&post("/job/x/build", UPLOAD_PACK_REQUEST)));
        assert!(!is_safe(&post("/repo.git/git-upload-pack", "text/plain")));
        assert!(!is_safe(&post("/repo.git/git-receive-pack", RECEIVE_PACK_REQUEST)));
    }
}
