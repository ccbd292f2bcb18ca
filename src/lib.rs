//! Git repositories served over smart HTTP and SSH.
//!
//! Requests are routed to repositories through a chain of resolvers; pushes
//! over HTTP bypass the crumb check through a masking filter; and pack
//! exchanges can be carried to repositories on other execution nodes.

pub mod auth;
pub mod config;
pub mod git;
pub mod http;
pub mod resolver;
pub mod ssh;
pub mod transport;
pub mod workspace;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::auth::UserDirectory;
use crate::config::{Config, RepositoryConfig};
use crate::git::Git;
use crate::http::{BridgeOptions, CsrfExclusion, HttpGitBridge, MaskedRequestStore};
use crate::resolver::{DirectoryResolver, ResolverChain};
use crate::ssh::{CommandFactory, GitCommandFactory};
use crate::workspace::FileBackedRepository;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared by the HTTP and SSH front ends.
pub struct AppState {
    pub config: Arc<Config>,
    pub git: Git,
    pub users: UserDirectory,
    /// Resolves repository names for SSH commands.
    pub resolvers: Arc<ResolverChain>,
    /// Workspace repositories mounted over HTTP, keyed by URL segment.
    pub http_bridges: HashMap<String, Arc<HttpGitBridge>>,
    pub masked: MaskedRequestStore,
    pub csrf: CsrfExclusion,
    pub crumb_secret: String,
    /// Consulted in order for each SSH exec request.
    pub ssh_commands: Vec<Arc<dyn CommandFactory>>,
}

impl AppState {
    /// Build the resolver chain, HTTP mounts and SSH commands described by
    /// `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let git = Git::new(&config.git_binary);
        let masked = MaskedRequestStore::new();
        let options = BridgeOptions {
            git: git.clone(),
            max_request_bytes: config.server.max_request_bytes,
            hide_denied_repositories: config.security.hide_denied_repositories,
        };

        let mut resolvers = ResolverChain::new();
        let mut http_bridges = HashMap::new();
        for entry in &config.repositories {
            match entry {
                RepositoryConfig::Workspace(ws) => {
                    let repository = Arc::new(FileBackedRepository::new(ws, git.clone()));
                    resolvers.register(repository.clone());
                    let bridge = HttpGitBridge::new(repository, options.clone(), masked.clone());
                    http_bridges.insert(ws.name.clone(), Arc::new(bridge));
                    info!(name = %ws.name, path = %ws.path.display(), "mounted workspace repository");
                }
                RepositoryConfig::Directory(dir) => {
                    resolvers.register(Arc::new(DirectoryResolver::new(
                        dir.prefix.clone(),
                        dir.root.clone(),
                        dir.access.clone(),
                        git.clone(),
                    )));
                    info!(prefix = %dir.prefix, root = %dir.root.display(), "registered repository directory");
                }
            }
        }

        let crumb_secret = match std::env::var(&config.security.crumb_secret_env) {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                warn!(
                    env = %config.security.crumb_secret_env,
                    "no crumb secret configured; crumbs will not survive a restart"
                );
                uuid::Uuid::new_v4().to_string()
            }
        };

        Ok(Self {
            users: UserDirectory::new(&config.users),
            config,
            git,
            resolvers: Arc::new(resolvers),
            http_bridges,
            csrf: CsrfExclusion::new(masked.clone()),
            masked,
            crumb_secret,
            ssh_commands: vec![Arc::new(GitCommandFactory)],
        })
    }
}
