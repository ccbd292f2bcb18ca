use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::auth::AccessRule;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    /// Path (or bare name looked up on `PATH`) of the git binary used as the
    /// pack-protocol engine.
    #[serde(default = "default_git_binary")]
    pub git_binary: PathBuf,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

fn default_git_binary() -> PathBuf {
    PathBuf::from("git")
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    /// Socket address for the SSH listener (e.g. `0.0.0.0:2222`).
    #[serde(default = "default_ssh_listen")]
    pub ssh_listen: String,
    /// Upper bound on a buffered (gzip-encoded) request body.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            ssh_listen: default_ssh_listen(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_ssh_listen() -> String {
    "0.0.0.0:2222".to_string()
}

fn default_max_request_bytes() -> usize {
    256 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// OpenSSH-format private host key.  An ephemeral Ed25519 key is
    /// generated when absent.
    #[serde(default)]
    pub host_key_path: Option<PathBuf>,
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: usize,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host_key_path: None,
            inactivity_timeout_secs: default_inactivity_timeout(),
            max_auth_attempts: default_max_auth_attempts(),
        }
    }
}

fn default_inactivity_timeout() -> u64 {
    600
}

fn default_max_auth_attempts() -> usize {
    3
}

// ---------------------------------------------------------------------------
// Security
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Report denied repositories exactly like missing ones on the wire.
    #[serde(default = "bool_true")]
    pub hide_denied_repositories: bool,
    /// Header that must carry the crumb on state-changing HTTP requests.
    #[serde(default = "default_crumb_header")]
    pub crumb_header: String,
    /// Name of the environment variable holding the crumb secret.
    #[serde(default = "default_crumb_secret_env")]
    pub crumb_secret_env: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            hide_denied_repositories: true,
            crumb_header: default_crumb_header(),
            crumb_secret_env: default_crumb_secret_env(),
        }
    }
}

fn bool_true() -> bool {
    true
}

fn default_crumb_header() -> String {
    "Crumb".to_string()
}

fn default_crumb_secret_env() -> String {
    "GITSERVER_CRUMB_SECRET".to_string()
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub name: String,
    /// `SHA256:` fingerprints (as printed by `ssh-keygen -l`) of the user's
    /// public keys.
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    /// Tokens accepted as the password of HTTP Basic authentication.
    #[serde(default)]
    pub http_tokens: Vec<String>,
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

/// One entry of the resolver chain, in registration order.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RepositoryConfig {
    /// A non-bare workspace exposed over HTTP at `/{name}/` and over SSH
    /// under `name`.
    Workspace(WorkspaceConfig),
    /// Every repository below `root`, addressed over SSH as `{prefix}{path}`.
    Directory(DirectoryConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(flatten)]
    pub access: AccessRule,
    /// Branch the workspace is reset to after every push.
    #[serde(default = "default_sync_branch")]
    pub sync_branch: String,
}

fn default_sync_branch() -> String {
    "master".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    pub prefix: String,
    pub root: PathBuf,
    #[serde(flatten)]
    pub access: AccessRule,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.security.crumb_header.trim().is_empty(),
        "crumb_header must not be empty"
    );
    anyhow::ensure!(
        config.server.max_request_bytes > 0,
        "max_request_bytes must be positive"
    );

    let mut names = std::collections::HashSet::new();
    for user in &config.users {
        anyhow::ensure!(!user.name.is_empty(), "user name must not be empty");
        anyhow::ensure!(
            user.name != "anonymous" && user.name != "*",
            "user name {:?} is reserved",
            user.name
        );
        anyhow::ensure!(names.insert(user.name.as_str()), "duplicate user {:?}", user.name);
    }

    for repo in &config.repositories {
        match repo {
            RepositoryConfig::Workspace(ws) => {
                anyhow::ensure!(
                    !ws.name.is_empty() && !ws.name.contains('/'),
                    "workspace name {:?} must be a single path segment",
                    ws.name
                );
                anyhow::ensure!(!ws.sync_branch.is_empty(), "sync_branch must not be empty");
            }
            RepositoryConfig::Directory(dir) => {
                anyhow::ensure!(
                    dir.prefix.ends_with('/') && !dir.prefix.starts_with('/'),
                    "directory prefix {:?} must end with '/' and not start with '/'",
                    dir.prefix
                );
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Identity, Permission};

    const SAMPLE: &str = r#"
server:
  http_listen: 127.0.0.1:9080
users:
  - name: alice
    ssh_keys: ["SHA256:abc"]
    http_tokens: ["s3cret"]
repositories:
  - kind: workspace
    name: userContent.git
    path: /var/lib/gitserver/userContent
    read: ["*"]
    write: ["alice"]
  - kind: directory
    prefix: acme/
    root: /srv/git/acme
    read: ["anonymous", "*"]
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.server.http_listen, "127.0.0.1:9080");
        assert_eq!(config.server.ssh_listen, "0.0.0.0:2222");
        assert_eq!(config.git_binary, PathBuf::from("git"));
        assert!(config.security.hide_denied_repositories);
        assert_eq!(config.security.crumb_header, "Crumb");
        assert_eq!(config.repositories.len(), 2);

        match &config.repositories[0] {
            RepositoryConfig::Workspace(ws) => {
                assert_eq!(ws.name, "userContent.git");
                assert_eq!(ws.sync_branch, "master");
                let alice = Identity::user("alice");
                assert!(ws.access.check(&alice, Permission::Write).is_ok());
            }
            other => panic!("expected workspace, got {other:?}"),
        }
        match &config.repositories[1] {
            RepositoryConfig::Directory(dir) => {
                assert_eq!(dir.prefix, "acme/");
                assert!(dir.access.check(&Identity::Anonymous, Permission::Read).is_ok());
                assert!(dir.access.check(&Identity::Anonymous, Permission::Write).is_err());
            }
            other => panic!("expected directory, got {other:?}"),
        }
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = parse_config("{}").unwrap();
        assert!(config.users.is_empty());
        assert!(config.repositories.is_empty());
        assert_eq!(config.ssh.inactivity_timeout_secs, 600);
    }

    #[test]
    fn rejects_leading_slash_prefix() {
        let yaml = r#"
repositories:
  - kind: directory
    prefix: /acme/
    root: /srv
"#;
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn rejects_reserved_user_names() {
        let yaml = r#"
users:
  - name: anonymous
"#;
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn rejects_duplicate_users() {
        let yaml = r#"
users:
  - name: bob
  - name: bob
"#;
        assert!(parse_config(yaml).is_err());
    }
}
