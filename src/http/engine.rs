//! Smart HTTP protocol over the pack engine.
//!
//! - `GET  info/refs?service=git-upload-pack|git-receive-pack` - ref
//!   advertisement
//! - `POST git-upload-pack` / `POST git-receive-pack` - stateless RPC
//!
//! The dumb protocol (`info/refs` without a service) is refused.

use std::io::{self, Read as _, Write as _};
use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio_stream::StreamExt as _;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info, instrument, warn};

use super::bridge::{BridgeError, HttpGitRepository};
use super::csrf::RequestView;
use crate::auth::Identity;
use crate::git::pktline::encode_pkt_line;
use crate::git::{Git, Service, StatelessRpc};

/// Smart HTTP front end of the git binary.
#[derive(Debug, Clone)]
pub struct SmartHttpEngine {
    git: Git,
    max_request_bytes: usize,
}

impl SmartHttpEngine {
    pub fn new(git: Git, max_request_bytes: usize) -> Self {
        Self {
            git,
            max_request_bytes,
        }
    }

    /// Check that the git binary runs and build the engine.
    pub async fn init(git: Git, max_request_bytes: usize) -> Result<Self> {
        let version = git
            .version()
            .await
            .context("pack engine is not available")?;
        info!(%version, program = %git.program().display(), "smart HTTP engine ready");
        Ok(Self::new(git, max_request_bytes))
    }

    /// Dispatch one request; `rest` is the path below the repository mount.
    #[instrument(skip_all, fields(%rest))]
    pub async fn service(
        &self,
        repository: &dyn HttpGitRepository,
        request: Request<Body>,
        rest: &str,
    ) -> Result<Response, BridgeError> {
        let method = request.method().clone();
        match (method, rest) {
            (Method::GET, "info/refs") => match request.parameter("service") {
                Some(name) => match Service::from_name(&name) {
                    Some(service) => self.advertise(repository, service, request).await,
                    None => Ok(forbidden(format!("Unsupported service: {name}\n"))),
                },
                None => Ok(forbidden("Dumb HTTP protocol is not supported\n".into())),
            },
            (Method::POST, "git-upload-pack") => {
                self.rpc(repository, Service::UploadPack, request).await
            }
            (Method::POST, "git-receive-pack") => {
                self.rpc(repository, Service::ReceivePack, request).await
            }
            (method, _) => {
                debug!(%method, "no smart HTTP endpoint");
                Ok((StatusCode::NOT_FOUND, "Not found\n").into_response())
            }
        }
    }

    async fn advertise(
        &self,
        repository: &dyn HttpGitRepository,
        service: Service,
        request: Request<Body>,
    ) -> Result<Response, BridgeError> {
        let identity = identity_of(&request);
        let protocol = git_protocol(request.headers());

        let refs = match service {
            Service::UploadPack => {
                let mut up = repository.upload_pack(&identity).await?;
                up.set_protocol(protocol.clone());
                up.advertise_refs().await?
            }
            Service::ReceivePack => {
                let mut rp = repository
                    .receive_pack(&identity, remote_addr(&request))
                    .await?;
                rp.set_protocol(protocol.clone());
                rp.advertise_refs().await?
            }
        };

        let mut body = Vec::with_capacity(refs.len() + 64);
        // Protocol v2 capability advertisements carry no service header.
        let v2 = service == Service::UploadPack
            && protocol.as_deref().is_some_and(|p| p.contains("version=2"));
        if !v2 {
            body.extend_from_slice(&encode_pkt_line(
                format!("# service={}\n", service.name()).as_bytes(),
            ));
            body.extend_from_slice(b"0000");
        }
        body.extend_from_slice(&refs);

        let mut response = if accepts_gzip(request.headers()) {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&body).context("failed to gzip advertisement")?;
            let compressed = encoder.finish().context("failed to gzip advertisement")?;
            let mut response = compressed.into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            response
        } else {
            body.into_response()
        };

        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(service.advertisement_content_type()),
        );
        no_cache(headers);
        Ok(response)
    }

    async fn rpc(
        &self,
        repository: &dyn HttpGitRepository,
        service: Service,
        request: Request<Body>,
    ) -> Result<Response, BridgeError> {
        let content_type = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if content_type != service.request_content_type() {
            warn!(%service, content_type, "unexpected request content type");
            return Ok((
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                format!("Expected {}\n", service.request_content_type()),
            )
                .into_response());
        }

        let identity = identity_of(&request);
        let protocol = git_protocol(request.headers());
        let remote = remote_addr(&request);

        // Resolve the handler (and run its checks) before reading the body.
        let rpc = match service {
            Service::UploadPack => {
                let mut up = repository.upload_pack(&identity).await?;
                up.set_protocol(protocol);
                let input = self.request_input(request).await?;
                up.stateless_rpc(input)?
            }
            Service::ReceivePack => {
                let mut rp = repository.receive_pack(&identity, remote).await?;
                rp.set_protocol(protocol);
                let input = self.request_input(request).await?;
                rp.stateless_rpc(input)?
            }
        };
        debug!(%service, %identity, "stateless RPC started");

        let StatelessRpc { output, completion } = rpc;
        tokio::spawn(async move {
            match completion.await {
                Ok(Ok(0)) => debug!(%service, "stateless RPC finished"),
                Ok(Ok(code)) => debug!(%service, code, "stateless RPC finished with error status"),
                Ok(Err(e)) => warn!(%service, error = %e, "stateless RPC failed"),
                Err(e) => warn!(%service, error = %e, "stateless RPC task panicked"),
            }
        });

        let mut response = Body::from_stream(ReaderStream::new(output)).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(service.result_content_type()),
        );
        no_cache(headers);
        Ok(response)
    }

    fn too_large(&self) -> BridgeError {
        warn!(limit = self.max_request_bytes, "request body too large");
        BridgeError::TooLarge {
            limit: self.max_request_bytes,
        }
    }

    /// The request body as engine input, decoded when the client gzipped it.
    async fn request_input(
        &self,
        request: Request<Body>,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, BridgeError> {
        let gzipped = request
            .headers()
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip"));
        let stream = request
            .into_body()
            .into_data_stream()
            .map(|chunk| chunk.map_err(io::Error::other));
        let reader = StreamReader::new(stream);
        if !gzipped {
            return Ok(Box::new(reader));
        }

        // Both the compressed and the inflated body are held to the limit.
        let limit = self.max_request_bytes as u64;
        let mut compressed = Vec::new();
        reader
            .take(limit + 1)
            .read_to_end(&mut compressed)
            .await
            .context("failed to read request body")?;
        if compressed.len() as u64 > limit {
            return Err(self.too_large());
        }
        let mut decoded = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .take(limit + 1)
            .read_to_end(&mut decoded)
            .context("failed to decode gzip request body")?;
        if decoded.len() as u64 > limit {
            return Err(self.too_large());
        }
        Ok(Box::new(io::Cursor::new(decoded)))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn identity_of(request: &Request<Body>) -> Identity {
    request
        .extensions()
        .get::<Identity>()
        .cloned()
        .unwrap_or(Identity::Anonymous)
}

fn remote_addr(request: &Request<Body>) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

fn git_protocol(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Git-Protocol")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|coding| coding.split(';').next().map(str::trim) == Some("gzip"))
}

fn no_cache(headers: &mut HeaderMap) {
    headers.insert(header::EXPIRES, HeaderValue::from_static("Fri, 01 Jan 1980 00:00:00 GMT"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, max-age=0, must-revalidate"),
    );
}

fn forbidden(message: String) -> Response {
    (StatusCode::FORBIDDEN, message).into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
