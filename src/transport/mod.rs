//! Pack transports towards another repository.
//!
//! A transport opens fetch and push connections from a local repository to
//! a remote one.  Repositories on the local machine are reached by spawning
//! the pack engine; repositories on another [`ExecutionNode`] are served by
//! a task dispatched to that node, with a pair of in-memory pipes carrying
//! the protocol in each direction.

pub mod channel;
pub mod connection;
pub mod node;
pub mod process;

use std::io;

use async_trait::async_trait;

use crate::git::{Git, Repository};

pub use channel::{pipe, ChannelTransport, PipeReader, PipeWriter};
pub use connection::{
    AdvertisedRef, Advertisement, FetchConnection, PushConnection, PushReport, RefStatus,
    RefUpdate, ZERO_OID,
};
pub use node::{ExecutionNode, PackTask, RemotePath, WorkerNode};
pub use process::ProcessTransport;

/// Errors raised while opening or driving a pack connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The remote task could not be started on its node.
    #[error("cannot dispatch pack task to node {node}: {reason}")]
    Dispatch { node: String, reason: String },
    /// The remote side closed the connection before the exchange finished.
    #[error("the remote end hung up unexpectedly")]
    HungUp,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Opens pack connections to one remote repository.
#[async_trait]
pub trait PackTransport: Send + Sync {
    async fn open_fetch(&self) -> Result<FetchConnection, TransportError>;

    async fn open_push(&self) -> Result<PushConnection, TransportError>;

    /// Release transport-wide resources.  Connections own their streams, so
    /// there is usually nothing to do.
    async fn close(&self) {}
}

/// Pick the transport for `remote`: a channel transport when it lives on
/// another node, the local process transport otherwise.
pub fn open(local: Repository, remote: RemotePath, git: Git) -> Box<dyn PackTransport> {
    match remote.node {
        Some(node) => Box::new(ChannelTransport::new(local, node, remote.path, git)),
        None => Box::new(ProcessTransport::new(local, remote.path, git)),
    }
}
