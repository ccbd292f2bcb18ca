//! SSH server bootstrap and the [`russh::server::Server`] implementation.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{self, Server};
use russh::MethodSet;
use russh_keys::key::KeyPair;
use tracing::{info, warn};

use super::session::SshSession;
use crate::AppState;

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// Top-level SSH server that hands off each incoming connection to an
/// [`SshSession`] handler.
pub struct SshServer {
    state: Arc<AppState>,
}

impl SshServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(peer = ?peer_addr, "new SSH client connection");
        SshSession::new(Arc::clone(&self.state), peer_addr)
    }
}

// ---------------------------------------------------------------------------
// Server key loading
// ---------------------------------------------------------------------------

/// Load the configured host key, or generate an ephemeral Ed25519 key when
/// none is configured.  A configured key that cannot be read is an error.
fn load_or_generate_host_key(path: Option<&Path>) -> Result<KeyPair> {
    match path {
        Some(path) => {
            let key = russh_keys::load_secret_key(path, None)
                .with_context(|| format!("failed to load SSH host key from {}", path.display()))?;
            info!(path = %path.display(), "loaded SSH host key");
            Ok(key)
        }
        None => {
            warn!("no SSH host key configured; generating ephemeral Ed25519 key");
            Ok(KeyPair::generate_ed25519())
        }
    }
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Start the SSH listener.  This function runs until the server is shut down
/// or an unrecoverable error occurs.
pub async fn start_ssh_server(state: Arc<AppState>) -> Result<()> {
    let listen_addr: SocketAddr = state.config.server.ssh_listen.parse().with_context(|| {
        format!(
            "invalid SSH listen address: {:?}",
            state.config.server.ssh_listen
        )
    })?;

    // -- Build russh server config ----------------------------------------

    let host_key = load_or_generate_host_key(state.config.ssh.host_key_path.as_deref())?;

    let config = Arc::new(server::Config {
        keys: vec![host_key],
        methods: MethodSet::PUBLICKEY,
        preferred: russh::Preferred::DEFAULT,
        inactivity_timeout: Some(Duration::from_secs(state.config.ssh.inactivity_timeout_secs)),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: state.config.ssh.max_auth_attempts,
        ..Default::default()
    });

    // -- Start serving ----------------------------------------------------

    info!(address = %listen_addr, "starting SSH server");

    let mut ssh_server = SshServer::new(state);
    ssh_server
        .run_on_address(config, listen_addr)
        .await
        .context("SSH server exited with error")?;

    Ok(())
}
