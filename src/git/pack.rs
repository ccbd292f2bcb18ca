//! Fetch and push handlers.
//!
//! [`UploadPack`] and [`ReceivePack`] bind one [`Repository`] to the pack
//! engine (`git upload-pack` / `git receive-pack`).  They are built per
//! request by a resolver and consumed by the operation that runs them:
//!
//! - `upload` / `receive` run the bidirectional protocol over arbitrary
//!   async streams (SSH channels, pipe pairs);
//! - `advertise_refs` and `stateless_rpc` serve the two halves of the smart
//!   HTTP exchange.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::commands::{display_args, run_checked};
use super::pktline::encode_pkt_line;
use super::{Git, Repository};

/// Largest progress message that fits a side-band packet of either flavour.
const PROGRESS_DATA_MAX: usize = 995;

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// The two pack services a client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    /// Wire name, e.g. `git-upload-pack`.
    pub fn name(self) -> &'static str {
        match self {
            Service::UploadPack => "git-upload-pack",
            Service::ReceivePack => "git-receive-pack",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(Service::UploadPack),
            "git-receive-pack" => Some(Service::ReceivePack),
            _ => None,
        }
    }

    fn subcommand(self) -> &'static str {
        match self {
            Service::UploadPack => "upload-pack",
            Service::ReceivePack => "receive-pack",
        }
    }

    pub fn advertisement_content_type(self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-advertisement",
            Service::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    pub fn request_content_type(self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-request",
            Service::ReceivePack => "application/x-git-receive-pack-request",
        }
    }

    pub fn result_content_type(self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-result",
            Service::ReceivePack => "application/x-git-receive-pack-result",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Runs after a push has been received successfully.
#[async_trait::async_trait]
pub trait PostReceiveHook: Send + Sync {
    async fn on_post_receive(&self, repository: &Repository) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Invocation {
    git: Git,
    repository: Repository,
    service: Service,
    protocol: Option<String>,
    config: Vec<(String, String)>,
    env: Vec<(String, String)>,
}

impl Invocation {
    fn new(git: Git, repository: Repository, service: Service) -> Self {
        Self {
            git,
            repository,
            service,
            protocol: None,
            config: Vec::new(),
            env: Vec::new(),
        }
    }

    fn command(&self, stateless: bool, advertise_refs: bool) -> Command {
        let mut cmd = self.git.command();
        for (key, value) in &self.config {
            cmd.arg("-c").arg(format!("{key}={value}"));
        }
        cmd.arg(self.service.subcommand());
        if stateless {
            cmd.arg("--stateless-rpc");
        }
        if advertise_refs {
            cmd.arg("--advertise-refs");
        }
        cmd.arg(self.repository.git_dir());

        // Forward the client's GIT_PROTOCOL so the engine answers in the
        // protocol version the client negotiated.
        if let Some(ref proto) = self.protocol {
            cmd.env("GIT_PROTOCOL", proto);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }

    /// Run the bidirectional exchange: `input` feeds the engine's stdin,
    /// its stdout and stderr are relayed to `output` and `error`.  Returns
    /// the engine's exit status.
    async fn run<R, W, E>(&self, mut input: R, mut output: W, mut error: E) -> Result<i32>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        let mut cmd = self.command(false, false);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(
            args = %display_args(cmd.as_std().get_args()),
            "spawning pack engine"
        );

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn git {}", self.service.subcommand()))?;
        let mut stdin = child.stdin.take().context("engine stdin was not piped")?;
        let mut stdout = child.stdout.take().context("engine stdout was not piped")?;
        let mut stderr = child.stderr.take().context("engine stderr was not piped")?;

        let feed = async move {
            let copied = tokio::io::copy(&mut input, &mut stdin).await;
            // Dropping stdin signals EOF to the engine.
            let _ = stdin.shutdown().await;
            copied
        };

        let drain = async {
            let (out, err) = tokio::join!(
                tokio::io::copy(&mut stdout, &mut output),
                tokio::io::copy(&mut stderr, &mut error),
            );
            out.context("failed to relay engine stdout")?;
            err.context("failed to relay engine stderr")?;
            output.flush().await?;
            error.flush().await?;
            child.wait().await.context("failed to wait on pack engine")
        };

        tokio::pin!(feed);
        tokio::pin!(drain);

        // The engine may finish before the client closes its input (e.g.
        // upload-pack after sending the pack); its exit ends the exchange.
        let status = tokio::select! {
            status = &mut drain => status?,
            fed = &mut feed => {
                if let Err(e) = fed {
                    debug!(error = %e, "client input ended with error");
                }
                drain.await?
            }
        };

        let code = status.code().unwrap_or(1);
        debug!(service = %self.service, code, "pack engine exited");
        Ok(code)
    }

    async fn advertise(&self) -> Result<Vec<u8>> {
        let output = run_checked(self.command(true, true), self.service.name()).await?;
        Ok(output.stdout)
    }

    fn spawn_stateless<R>(
        &self,
        mut input: R,
        hook: Option<Arc<dyn PostReceiveHook>>,
    ) -> Result<StatelessRpc>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut cmd = self.command(true, false);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn git {}", self.service.subcommand()))?;
        let mut stdin = child.stdin.take().context("engine stdin was not piped")?;
        let stdout = child.stdout.take().context("engine stdout was not piped")?;
        let mut stderr = child.stderr.take().context("engine stderr was not piped")?;

        let feeder = tokio::spawn(async move {
            let copied = tokio::io::copy(&mut input, &mut stdin).await;
            let _ = stdin.shutdown().await;
            copied
        });

        let service = self.service;
        let Some(hook) = hook else {
            let completion = tokio::spawn(async move {
                let mut diagnostics = Vec::new();
                let _ = stderr.read_to_end(&mut diagnostics).await;
                let status = child
                    .wait()
                    .await
                    .context("failed to wait on pack engine")?;
                // A stalled request body must not outlive the engine.
                feeder.abort();
                let code = status.code().unwrap_or(1);
                log_exit(service, code, &diagnostics);
                Ok(code)
            });
            return Ok(StatelessRpc {
                output: Box::new(stdout),
                completion,
            });
        };

        // The report is held back until the hook has run so that a hook
        // failure still reaches the client ahead of the closing flush.
        let repository = self.repository.clone();
        let (mut relay, output) = tokio::io::duplex(64 * 1024);
        let completion = tokio::spawn(async move {
            let mut stdout = stdout;
            let mut report = Vec::new();
            let mut diagnostics = Vec::new();
            let (read, _) = tokio::join!(
                stdout.read_to_end(&mut report),
                stderr.read_to_end(&mut diagnostics),
            );
            read.context("failed to read engine output")?;
            let status = child
                .wait()
                .await
                .context("failed to wait on pack engine")?;
            feeder.abort();

            let code = status.code().unwrap_or(1);
            log_exit(service, code, &diagnostics);
            if code == 0 {
                if let Err(e) = hook.on_post_receive(&repository).await {
                    warn!(error = %e, "post-receive hook failed");
                    let message = format!("Failed to update workspace: {e:#}\n");
                    if !insert_progress_message(&mut report, &message) {
                        debug!("report is not multiplexed; hook failure not relayed");
                    }
                }
            }
            relay
                .write_all(&report)
                .await
                .context("failed to relay engine output")?;
            relay.shutdown().await?;
            Ok(code)
        });

        Ok(StatelessRpc {
            output: Box::new(output),
            completion,
        })
    }
}

fn log_exit(service: Service, code: i32, diagnostics: &[u8]) {
    if code != 0 {
        warn!(
            %service,
            code,
            stderr = %String::from_utf8_lossy(diagnostics).trim(),
            "pack engine exited with non-zero status"
        );
    }
}

/// Put `message` on the progress band just before the closing flush of a
/// side-band report.  Returns `false` if the report is not multiplexed.
fn insert_progress_message(report: &mut Vec<u8>, message: &str) -> bool {
    let multiplexed = matches!(report.get(4), Some(1 | 2)) && report.ends_with(b"0000");
    if !multiplexed {
        return false;
    }
    let mut payload = Vec::with_capacity(message.len().min(PROGRESS_DATA_MAX) + 1);
    payload.push(2);
    payload.extend(message.bytes().take(PROGRESS_DATA_MAX));
    let at = report.len() - 4;
    report.splice(at..at, encode_pkt_line(&payload));
    true
}

/// A running stateless-RPC exchange.
pub struct StatelessRpc {
    /// The engine's response stream.
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    /// Resolves to the engine's exit status once the response is complete.
    pub completion: JoinHandle<Result<i32>>,
}

impl fmt::Debug for StatelessRpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatelessRpc")
            .field("finished", &self.completion.is_finished())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// UploadPack
// ---------------------------------------------------------------------------

/// Fetch handler bound to one repository.
#[derive(Debug)]
pub struct UploadPack {
    invocation: Invocation,
}

impl UploadPack {
    pub fn new(git: Git, repository: Repository) -> Self {
        Self {
            invocation: Invocation::new(git, repository, Service::UploadPack),
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.invocation.repository
    }

    /// `GIT_PROTOCOL` value requested by the client.
    pub fn set_protocol(&mut self, protocol: Option<String>) {
        self.invocation.protocol = protocol;
    }

    /// Serve one fetch over `input`/`output`, relaying diagnostics to
    /// `error`.
    #[instrument(skip_all, fields(git_dir = %self.repository().git_dir().display()))]
    pub async fn upload<R, W, E>(self, input: R, output: W, error: E) -> Result<i32>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        self.invocation.run(input, output, error).await
    }

    pub async fn advertise_refs(&self) -> Result<Vec<u8>> {
        self.invocation.advertise().await
    }

    pub fn stateless_rpc<R>(self, input: R) -> Result<StatelessRpc>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.invocation.spawn_stateless(input, None)
    }
}

// ---------------------------------------------------------------------------
// ReceivePack
// ---------------------------------------------------------------------------

/// Push handler bound to one repository.
pub struct ReceivePack {
    invocation: Invocation,
    hook: Option<Arc<dyn PostReceiveHook>>,
}

impl fmt::Debug for ReceivePack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivePack")
            .field("invocation", &self.invocation)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl ReceivePack {
    pub fn new(git: Git, repository: Repository) -> Self {
        Self {
            invocation: Invocation::new(git, repository, Service::ReceivePack),
            hook: None,
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.invocation.repository
    }

    pub fn set_protocol(&mut self, protocol: Option<String>) {
        self.invocation.protocol = protocol;
    }

    /// Identity recorded in the reflog for refs updated by this push.
    pub fn set_ref_log_ident(&mut self, name: &str, email: &str) {
        self.invocation
            .env
            .push(("GIT_COMMITTER_NAME".into(), name.into()));
        self.invocation
            .env
            .push(("GIT_COMMITTER_EMAIL".into(), email.into()));
    }

    /// Per-invocation engine configuration (`git -c key=value`).
    pub fn set_config(&mut self, key: &str, value: &str) {
        self.invocation.config.push((key.into(), value.into()));
    }

    pub fn set_post_receive_hook(&mut self, hook: Arc<dyn PostReceiveHook>) {
        self.hook = Some(hook);
    }

    /// Receive one push over `input`/`output`.  After a successful receive
    /// the post-receive hook runs; its failure is reported on `error` but
    /// does not change the exit status.
    #[instrument(skip_all, fields(git_dir = %self.repository().git_dir().display()))]
    pub async fn receive<R, W, E>(self, input: R, output: W, mut error: E) -> Result<i32>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        let code = self.invocation.run(input, output, &mut error).await?;
        if code == 0 {
            if let Some(hook) = &self.hook {
                if let Err(e) = hook.on_post_receive(self.repository()).await {
                    warn!(error = %e, "post-receive hook failed");
                    let message = format!("Failed to update workspace: {e:#}\n");
                    let _ = error.write_all(message.as_bytes()).await;
                    let _ = error.flush().await;
                }
            }
        }
        Ok(code)
    }

    pub async fn advertise_refs(&self) -> Result<Vec<u8>> {
        self.invocation.advertise().await
    }

    pub fn stateless_rpc<R>(self, input: R) -> Result<StatelessRpc>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.invocation.spawn_stateless(input, self.hook)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo_with_commit() -> (tempfile::TempDir, Repository) {
        let tmp = tempfile::tempdir().unwrap();
        let git = Git::default();
        git.init(tmp.path(), "master").await.unwrap();
        std::fs::write(tmp.path().join("README"), "hi").unwrap();
        git.add_all(tmp.path()).await.unwrap();
        git.commit(tmp.path(), "Tester", "t@example.com", "init")
            .await
            .unwrap();
        let repo = Repository::open(tmp.path()).unwrap();
        (tmp, repo)
    }

    #[test]
    fn service_names_round_trip() {
        for svc in [Service::UploadPack, Service::ReceivePack] {
            assert_eq!(Service::from_name(svc.name()), Some(svc));
        }
        assert_eq!(Service::from_name("git-archive"), None);
        assert_eq!(
            Service::ReceivePack.request_content_type(),
            "application/x-git-receive-pack-request"
        );
    }

    #[test]
    fn command_carries_config_and_protocol() {
        let mut rp = ReceivePack::new(Git::default(), Repository::bare("/srv/a.git"));
        rp.set_config("receive.denyCurrentBranch", "ignore");
        rp.set_protocol(Some("version=2".into()));

        let cmd = rp.invocation.command(true, true);
        let args = display_args(cmd.as_std().get_args());
        assert_eq!(
            args,
            "-c receive.denyCurrentBranch=ignore receive-pack --stateless-rpc --advertise-refs /srv/a.git"
        );
        let has_protocol = cmd
            .as_std()
            .get_envs()
            .any(|(k, v)| k == "GIT_PROTOCOL" && v.map(|v| v == "version=2").unwrap_or(false));
        assert!(has_protocol);
    }

    #[test]
    fn hook_failure_joins_multiplexed_report() {
        let mut report = [encode_pkt_line(b"\x01000eunpack ok\n0000"), b"0000".to_vec()].concat();
        let original = report.clone();
        assert!(insert_progress_message(&mut report, "Failed to update workspace: boom\n"));
        assert!(report.starts_with(&original[..original.len() - 4]));
        assert!(report.ends_with(b"\x02Failed to update workspace: boom\n0000"));

        // Without side-band there is no channel for free text.
        let mut plain = [encode_pkt_line(b"unpack ok\n"), b"0000".to_vec()].concat();
        let before = plain.clone();
        assert!(!insert_progress_message(&mut plain, "x"));
        assert_eq!(plain, before);
    }

    #[test]
    fn long_hook_messages_fit_one_packet() {
        let mut report = [encode_pkt_line(b"\x01"), b"0000".to_vec()].concat();
        assert!(insert_progress_message(&mut report, &"e".repeat(70_000)));
        let inserted = &report[5..report.len() - 4];
        let len = usize::from_str_radix(std::str::from_utf8(&inserted[..4]).unwrap(), 16).unwrap();
        assert_eq!(len, inserted.len());
        assert_eq!(len, 4 + 1 + PROGRESS_DATA_MAX);
    }

    #[tokio::test]
    async fn advertises_branch() {
        let (_tmp, repo) = repo_with_commit().await;
        let up = UploadPack::new(Git::default(), repo);
        let adv = up.advertise_refs().await.unwrap();
        let text = String::from_utf8_lossy(&adv);
        assert!(text.contains("refs/heads/master"), "got {text}");
    }

    #[tokio::test]
    async fn upload_ends_when_client_flushes() {
        let (_tmp, repo) = repo_with_commit().await;
        let up = UploadPack::new(Git::default(), repo);

        // A flush with no wants tells upload-pack there is nothing to send.
        let input: &[u8] = b"0000";
        let mut output = Vec::new();
        let code = up
            .upload(input, &mut output, tokio::io::sink())
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert!(String::from_utf8_lossy(&output).contains("refs/heads/master"));
    }
}
