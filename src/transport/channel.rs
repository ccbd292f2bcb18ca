//! In-memory pipes and the transport that runs over them.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tracing::{debug, instrument};

use super::connection::{FetchConnection, PushConnection};
use super::node::{ExecutionNode, PackTask};
use super::{PackTransport, TransportError};
use crate::git::{Git, Repository};

/// Bytes buffered in a pipe before the writer has to wait.
const PIPE_CAPACITY: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Pipes
// ---------------------------------------------------------------------------

/// Writing end of a one-way pipe.  Dropping it is end-of-stream for the
/// reader.
pub struct PipeWriter(DuplexStream);

/// Reading end of a one-way pipe.
pub struct PipeReader(DuplexStream);

/// Create a one-way pipe.  Both ends may be moved to another thread or
/// runtime.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (write, read) = tokio::io::duplex(PIPE_CAPACITY);
    (PipeWriter(write), PipeReader(read))
}

impl fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PipeWriter")
    }
}

impl fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PipeReader")
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

// ---------------------------------------------------------------------------
// ChannelTransport
// ---------------------------------------------------------------------------

/// Reaches a repository on another node.  Each connection dispatches a
/// fresh pack task to the node and talks to it over two pipes.
pub struct ChannelTransport {
    local: Repository,
    node: Arc<dyn ExecutionNode>,
    remote_path: PathBuf,
    git: Git,
}

impl fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("local", &self.local)
            .field("node", &self.node.name())
            .field("remote_path", &self.remote_path)
            .finish()
    }
}

impl ChannelTransport {
    pub fn new(
        local: Repository,
        node: Arc<dyn ExecutionNode>,
        remote_path: PathBuf,
        git: Git,
    ) -> Self {
        Self {
            local,
            node,
            remote_path,
            git,
        }
    }
}

#[async_trait]
impl PackTransport for ChannelTransport {
    #[instrument(skip(self), fields(node = %self.node.name(), path = %self.remote_path.display()))]
    async fn open_fetch(&self) -> Result<FetchConnection, TransportError> {
        let (to_remote, remote_input) = pipe();
        let (remote_output, from_remote) = pipe();
        self.node
            .dispatch(
                self.remote_path.clone(),
                PackTask::Fetch {
                    input: remote_input,
                    output: remote_output,
                },
            )
            .await?;
        debug!("fetch task started");
        FetchConnection::handshake(
            self.local.clone(),
            self.git.clone(),
            Box::new(from_remote),
            Box::new(to_remote),
        )
        .await
    }

    #[instrument(skip(self), fields(node = %self.node.name(), path = %self.remote_path.display()))]
    async fn open_push(&self) -> Result<PushConnection, TransportError> {
        let (to_remote, remote_input) = pipe();
        let (remote_output, from_remote) = pipe();
        self.node
            .dispatch(
                self.remote_path.clone(),
                PackTask::Push {
                    input: remote_input,
                    output: remote_output,
                },
            )
            .await?;
        debug!("push task started");
        PushConnection::handshake(
            self.local.clone(),
            self.git.clone(),
            Box::new(from_remote),
            Box::new(to_remote),
        )
        .await
    }
}
