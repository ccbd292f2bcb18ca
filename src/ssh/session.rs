//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound SSH connection is served by a dedicated [`SshSession`].  The
//! handler authenticates public keys against the configured users and runs
//! one [`SshCommand`] per exec request, wiring the channel to the command
//! through in-memory pipes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::{debug, info, warn};

use super::command::{
    create_command, CommandContext, CommandIo, CommandLine, EXIT_UNKNOWN_COMMAND, EXIT_USAGE,
};
use crate::auth::{fingerprint_of, Identity};
use crate::AppState;

/// Buffer size of the pipes between a channel and its command.
const PIPE_CAPACITY: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct SshSession {
    state: Arc<AppState>,
    peer_addr: Option<SocketAddr>,
    identity: Option<Identity>,
    /// `GIT_PROTOCOL` value sent by the client via SSH env request.
    git_protocol: Option<String>,
    /// Write ends feeding the stdin of running commands.
    stdin: HashMap<ChannelId, DuplexStream>,
}

impl SshSession {
    /// Create a new session for an incoming connection.
    pub fn new(state: Arc<AppState>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            state,
            peer_addr,
            identity: None,
            git_protocol: None,
            stdin: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Channel helpers
// ---------------------------------------------------------------------------

/// Send exit-status, EOF, and close on a channel in the order required by
/// the SSH protocol (RFC 4254).  Git's SSH transport client expects all three
/// signals; omitting exit-status or EOF causes the client to treat the channel
/// close as a transport failure ("the remote end hung up unexpectedly").
fn finish_channel(session: &mut Session, channel_id: ChannelId, exit_status: u32) {
    session.exit_status_request(channel_id, exit_status);
    session.eof(channel_id);
    session.close(channel_id);
}

fn reject(session: &mut Session, channel_id: ChannelId, message: &str, exit_status: u32) {
    session.extended_data(
        channel_id,
        1,
        CryptoVec::from_slice(format!("{message}\n").as_bytes()),
    );
    finish_channel(session, channel_id, exit_status);
}

/// Copy `reader` to the channel, as stderr when `ext` is set.
async fn pump<R>(handle: Handle, channel_id: ChannelId, mut reader: R, ext: Option<u32>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "error reading command output");
                break;
            }
        };
        let data = CryptoVec::from_slice(&buf[..n]);
        let sent = match ext {
            Some(code) => handle.extended_data(channel_id, code, data).await,
            None => handle.data(channel_id, data).await,
        };
        if sent.is_err() {
            debug!("channel closed while sending command output");
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    /// Authenticate a client by public key fingerprint.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let fp = fingerprint_of(key);
        match self.state.users.resolve_fingerprint(&fp) {
            Some(identity) => {
                info!(
                    peer = ?self.peer_addr,
                    user = %user,
                    fingerprint = %fp,
                    identity = %identity,
                    "SSH key accepted"
                );
                self.identity = Some(identity);
                Ok(Auth::Accept)
            }
            None => {
                warn!(peer = ?self.peer_addr, fingerprint = %fp, "SSH key not associated with any user");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    /// Accept new channel-open requests for sessions.
    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// Capture environment variables sent by the client before the exec
    /// request.  Git clients send `GIT_PROTOCOL=version=2` here.
    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == "GIT_PROTOCOL" {
            debug!(value = %variable_value, "captured GIT_PROTOCOL from client");
            self.git_protocol = Some(variable_value.to_string());
        }
        Ok(())
    }

    /// Forward client data to the running command's stdin.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(stdin) = self.stdin.get_mut(&channel) {
            if let Err(e) = stdin.write_all(data).await {
                debug!(error = %e, "command stopped reading stdin");
                self.stdin.remove(&channel);
            }
        }
        Ok(())
    }

    /// Client EOF closes the command's stdin.
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.stdin.remove(&channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.stdin.remove(&channel);
        Ok(())
    }

    /// Handle `exec` requests on an established channel.
    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw_cmd = String::from_utf8_lossy(data);
        info!(
            peer = ?self.peer_addr,
            identity = ?self.identity,
            command = %raw_cmd,
            "SSH exec request"
        );
        session.channel_success(channel_id);

        let command_line = match CommandLine::parse(&raw_cmd) {
            Ok(cl) => cl,
            Err(e) => {
                warn!(command = %raw_cmd, error = %e, "unparseable SSH command line");
                reject(session, channel_id, &e.to_string(), EXIT_USAGE);
                return Ok(());
            }
        };

        let Some(command) = create_command(&self.state.ssh_commands, &command_line) else {
            warn!(command = %raw_cmd, "unrecognised SSH exec command");
            reject(
                session,
                channel_id,
                &format!("Unknown command: {}", command_line.program()),
                EXIT_UNKNOWN_COMMAND,
            );
            return Ok(());
        };

        let ctx = CommandContext {
            identity: self.identity.clone().unwrap_or(Identity::Anonymous),
            resolvers: Arc::clone(&self.state.resolvers),
            git_protocol: self.git_protocol.clone(),
            hide_denied_repositories: self.state.config.security.hide_denied_repositories,
        };

        let (client_stdin, command_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (command_stdout, stdout_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (command_stderr, stderr_reader) = tokio::io::duplex(PIPE_CAPACITY);
        self.stdin.insert(channel_id, client_stdin);

        let io = CommandIo {
            input: Box::new(command_stdin),
            output: Box::new(command_stdout),
            error: Box::new(command_stderr),
        };

        // The command runs in the background; the handler must return so
        // that channel data keeps flowing.
        let handle = session.handle();
        tokio::spawn(async move {
            let (exit_status, (), ()) = tokio::join!(
                command.run(ctx, io),
                pump(handle.clone(), channel_id, stdout_reader, None),
                pump(handle.clone(), channel_id, stderr_reader, Some(1)),
            );
            debug!(exit_status, "SSH command finished");

            // RFC 4254: exit-status -> EOF -> close.
            let _ = handle.exit_status_request(channel_id, exit_status).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });

        Ok(())
    }
}
