//! Transport to a repository on the local machine, served by a spawned
//! pack engine.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tracing::{debug, instrument};

use super::connection::{BoxedReader, BoxedWriter, FetchConnection, PushConnection};
use super::{PackTransport, TransportError};
use crate::git::{Git, Repository, Service};

#[derive(Debug)]
pub struct ProcessTransport {
    local: Repository,
    remote_path: PathBuf,
    git: Git,
}

impl ProcessTransport {
    pub fn new(local: Repository, remote_path: PathBuf, git: Git) -> Self {
        Self {
            local,
            remote_path,
            git,
        }
    }

    /// Spawn `git <service> <path>` with its stderr relayed to the log.
    fn spawn(&self, service: Service) -> Result<(Child, BoxedReader, BoxedWriter), TransportError> {
        let subcommand = service
            .name()
            .strip_prefix("git-")
            .unwrap_or(service.name());
        let mut cmd = self.git.command();
        cmd.arg(subcommand)
            .arg(&self.remote_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {service}"))?;

        let stdin = child.stdin.take().context("engine stdin was not piped")?;
        let stdout = child.stdout.take().context("engine stdout was not piped")?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(%service, message = %line, "pack engine stderr");
                }
            });
        }
        let reader: BoxedReader = Box::new(stdout);
        let writer: BoxedWriter = Box::new(stdin);
        Ok((child, reader, writer))
    }
}

#[async_trait]
impl PackTransport for ProcessTransport {
    #[instrument(skip(self), fields(path = %self.remote_path.display()))]
    async fn open_fetch(&self) -> Result<FetchConnection, TransportError> {
        let (child, reader, writer) = self.spawn(Service::UploadPack)?;
        let conn =
            FetchConnection::handshake(self.local.clone(), self.git.clone(), reader, writer)
                .await?;
        Ok(conn.with_process(child))
    }

    #[instrument(skip(self), fields(path = %self.remote_path.display()))]
    async fn open_push(&self) -> Result<PushConnection, TransportError> {
        let (child, reader, writer) = self.spawn(Service::ReceivePack)?;
        let conn =
            PushConnection::handshake(self.local.clone(), self.git.clone(), reader, writer)
                .await?;
        Ok(conn.with_process(child))
    }
}
