//! SSH exec commands.
//!
//! An exec request carries one command line.  [`CommandLine::parse`] splits
//! it the way a POSIX shell would (quotes and backslashes, no expansion),
//! each registered [`CommandFactory`] gets a chance to claim it by its first
//! token, and the claimed [`SshCommand`] runs against the channel's streams.

use std::sync::Arc;

use clap::{FromArgMatches as _, Parser};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::auth::Identity;
use crate::git::Service;
use crate::resolver::{ResolveError, ResolverChain};

/// Exit status for a command line no factory claimed.
pub const EXIT_UNKNOWN_COMMAND: u32 = 127;
/// Exit status for a command line its command could not parse.
pub const EXIT_USAGE: u32 = 2;

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandLineError {
    #[error("empty command line")]
    Empty,
    #[error("unterminated {0} quote in command line")]
    UnterminatedQuote(char),
    #[error("command line ends with a backslash")]
    TrailingBackslash,
}

/// Tokens of one exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    tokens: Vec<String>,
}

impl CommandLine {
    pub fn parse(line: &str) -> Result<Self, CommandLineError> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut in_token = false;
        let mut chars = line.chars();

        while let Some(c) = chars.next() {
            match c {
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                '\'' => {
                    in_token = true;
                    loop {
                        match chars.next() {
                            Some('\'') => break,
                            Some(c) => current.push(c),
                            None => return Err(CommandLineError::UnterminatedQuote('\'')),
                        }
                    }
                }
                '"' => {
                    in_token = true;
                    loop {
                        match chars.next() {
                            Some('"') => break,
                            Some('\\') => match chars.next() {
                                Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                                Some(c) => {
                                    current.push('\\');
                                    current.push(c);
                                }
                                None => return Err(CommandLineError::UnterminatedQuote('"')),
                            },
                            Some(c) => current.push(c),
                            None => return Err(CommandLineError::UnterminatedQuote('"')),
                        }
                    }
                }
                '\\' => {
                    in_token = true;
                    match chars.next() {
                        Some(c) => current.push(c),
                        None => return Err(CommandLineError::TrailingBackslash),
                    }
                }
                c => {
                    in_token = true;
                    current.push(c);
                }
            }
        }
        if in_token {
            tokens.push(current);
        }
        if tokens.is_empty() {
            return Err(CommandLineError::Empty);
        }
        Ok(Self { tokens })
    }

    /// The command name.
    pub fn program(&self) -> &str {
        &self.tokens[0]
    }

    /// Everything after the command name.
    pub fn args(&self) -> &[String] {
        &self.tokens[1..]
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Streams of one exec channel.
pub struct CommandIo {
    pub input: Box<dyn AsyncRead + Send + Unpin>,
    pub output: Box<dyn AsyncWrite + Send + Unpin>,
    pub error: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Who is running the command and what it may use.
#[derive(Clone)]
pub struct CommandContext {
    pub identity: Identity,
    pub resolvers: Arc<ResolverChain>,
    /// `GIT_PROTOCOL` sent by the client in an env request.
    pub git_protocol: Option<String>,
    pub hide_denied_repositories: bool,
}

#[async_trait::async_trait]
pub trait SshCommand: Send {
    /// Run to completion and return the exit status.
    async fn run(self: Box<Self>, ctx: CommandContext, io: CommandIo) -> u32;
}

/// Claims command lines by their first token.  `None` leaves the line to
/// the next factory.
pub trait CommandFactory: Send + Sync {
    fn create(&self, command_line: &CommandLine) -> Option<Box<dyn SshCommand>>;
}

/// First claim among `factories`.
pub fn create_command(
    factories: &[Arc<dyn CommandFactory>],
    command_line: &CommandLine,
) -> Option<Box<dyn SshCommand>> {
    factories.iter().find_map(|f| f.create(command_line))
}

// ---------------------------------------------------------------------------
// git-upload-pack / git-receive-pack
// ---------------------------------------------------------------------------

/// Factory for `git-upload-pack REPO` and `git-receive-pack REPO`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitCommandFactory;

impl CommandFactory for GitCommandFactory {
    fn create(&self, command_line: &CommandLine) -> Option<Box<dyn SshCommand>> {
        let service = Service::from_name(command_line.program())?;
        Some(Box::new(GitCommand {
            service,
            args: command_line.args().to_vec(),
        }))
    }
}

#[derive(Debug, Parser)]
#[command(no_binary_name = true, disable_help_flag = true, disable_version_flag = true)]
struct GitCommandArgs {
    /// Repository name.
    #[arg(value_name = "REPO", value_parser = parse_repo_name)]
    repo: String,
}

/// Repository names are taken literally; `@file` argument expansion is
/// refused.
fn parse_repo_name(value: &str) -> Result<String, String> {
    if value.starts_with('@') {
        return Err("repository names starting with '@' are not allowed".into());
    }
    Ok(value.to_string())
}

/// A pack operation requested over SSH.  Arguments are parsed when it runs,
/// so usage errors reach the client's stderr.
#[derive(Debug)]
pub struct GitCommand {
    service: Service,
    args: Vec<String>,
}

impl GitCommand {
    fn parse_args(&self) -> Result<GitCommandArgs, clap::Error> {
        let command = <GitCommandArgs as clap::CommandFactory>::command().name(self.service.name());
        let matches = command.try_get_matches_from(&self.args)?;
        GitCommandArgs::from_arg_matches(&matches)
    }
}

#[async_trait::async_trait]
impl SshCommand for GitCommand {
    async fn run(self: Box<Self>, ctx: CommandContext, mut io: CommandIo) -> u32 {
        let args = match self.parse_args() {
            Ok(args) => args,
            Err(e) => {
                debug!(service = %self.service, error = %e, "bad git command arguments");
                report(&mut io.error, e.to_string().trim_end()).await;
                return EXIT_USAGE;
            }
        };
        let repo = args.repo;
        info!(service = %self.service, %repo, identity = %ctx.identity, "running git command");

        let result = match self.service {
            Service::UploadPack => match ctx.resolvers.resolve_fetch(&repo, &ctx.identity).await {
                Ok(mut up) => {
                    up.set_protocol(ctx.git_protocol.clone());
                    up.upload(&mut io.input, &mut io.output, &mut io.error).await
                }
                Err(e) => return refuse(&mut io.error, &repo, e, &ctx).await,
            },
            Service::ReceivePack => match ctx.resolvers.resolve_push(&repo, &ctx.identity).await {
                Ok(mut rp) => {
                    rp.set_protocol(ctx.git_protocol.clone());
                    rp.receive(&mut io.input, &mut io.output, &mut io.error).await
                }
                Err(e) => return refuse(&mut io.error, &repo, e, &ctx).await,
            },
        };

        match result {
            Ok(code) => u32::try_from(code).unwrap_or(1),
            Err(e) => {
                error!(service = %self.service, %repo, error = %e, "git command failed");
                report(&mut io.error, &format!("Failed to run {}: {e}", self.service)).await;
                1
            }
        }
    }
}

/// Tell the client why nothing ran.
async fn refuse<W>(error: &mut W, repo: &str, err: ResolveError, ctx: &CommandContext) -> u32
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let message = match err {
        ResolveError::NotFound => format!("No such repository exists: {repo}"),
        ResolveError::Denied(denied) => {
            warn!(
                %repo,
                identity = %denied.identity,
                permission = %denied.permission,
                "SSH git command denied"
            );
            if ctx.hide_denied_repositories {
                format!("No such repository exists: {repo}")
            } else {
                format!("Access denied to repository: {repo}")
            }
        }
        ResolveError::Failed(e) => {
            error!(%repo, error = %e, "failed to resolve repository");
            format!("Failed to open repository: {repo}")
        }
    };
    report(error, &message).await;
    1
}

async fn report<W>(error: &mut W, message: &str)
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let line = format!("{message}\n");
    if let Err(e) = error.write_all(line.as_bytes()).await {
        debug!(error = %e, "could not write to stderr stream");
    }
    let _ = error.flush().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::auth::AccessRule;
    use crate::git::Git;
    use crate::resolver::DirectoryResolver;

    #[test]
    fn tokenizes_like_a_shell() {
        let cl = CommandLine::parse("git-upload-pack 'acme/my repo.git'").unwrap();
        assert_eq!(cl.program(), "git-upload-pack");
        assert_eq!(cl.args(), ["acme/my repo.git"]);

        let cl = CommandLine::parse(r#"  git-receive-pack "/a \"b\".git"  extra\ arg "#).unwrap();
        assert_eq!(cl.tokens(), ["git-receive-pack", "/a \"b\".git", "extra arg"]);

        let cl = CommandLine::parse("cmd ''").unwrap();
        assert_eq!(cl.args(), [""]);
    }

    #[test]
    fn tokenizer_errors() {
        assert_eq!(CommandLine::parse("   "), Err(CommandLineError::Empty));
        assert_eq!(
            CommandLine::parse("git-upload-pack 'oops"),
            Err(CommandLineError::UnterminatedQuote('\''))
        );
        assert_eq!(CommandLine::parse("x \\"), Err(CommandLineError::TrailingBackslash));
    }

    #[test]
    fn factory_claims_git_commands_only() {
        let factories: Vec<Arc<dyn CommandFactory>> = vec![Arc::new(GitCommandFactory)];
        let claim = |line: &str| create_command(&factories, &CommandLine::parse(line).unwrap()).is_some();

        assert!(claim("git-upload-pack x.git"));
        assert!(claim("git-receive-pack x.git"));
        assert!(!claim("git-upload-archive x.git"));
        assert!(!claim("ls -l"));
    }

    struct Captured {
        code: u32,
        stdout: Vec<u8>,
        stderr: String,
    }

    async fn run_line(line: &str, ctx: CommandContext, stdin: &'static [u8]) -> Captured {
        let cl = CommandLine::parse(line).unwrap();
        let command = GitCommandFactory.create(&cl).unwrap();

        let (out_w, mut out_r) = tokio::io::duplex(1 << 20);
        let (err_w, mut err_r) = tokio::io::duplex(1 << 16);
        let io = CommandIo {
            input: Box::new(stdin),
            output: Box::new(out_w),
            error: Box::new(err_w),
        };
        let code = command.run(ctx, io).await;

        let mut stdout = Vec::new();
        out_r.read_to_end(&mut stdout).await.unwrap();
        let mut stderr = String::new();
        err_r.read_to_string(&mut stderr).await.unwrap();
        Captured { code, stdout, stderr }
    }

    async fn context(identity: Identity, hide: bool) -> (tempfile::TempDir, CommandContext) {
        let tmp = tempfile::tempdir().unwrap();
        Git::default()
            .init_bare(&tmp.path().join("tools.git"), "master")
            .await
            .unwrap();
        let mut chain = ResolverChain::new();
        chain.register(Arc::new(DirectoryResolver::new(
            "acme/",
            tmp.path(),
            AccessRule::new(["*"], ["alice"]),
            Git::default(),
        )));
        let ctx = CommandContext {
            identity,
            resolvers: Arc::new(chain),
            git_protocol: None,
            hide_denied_repositories: hide,
        };
        (tmp, ctx)
    }

    #[tokio::test]
    async fn at_file_argument_is_rejected() {
        let (_tmp, ctx) = context(Identity::user("alice"), true).await;
        let out = run_line("git-upload-pack @/etc/passwd", ctx, b"").await;
        assert_eq!(out.code, EXIT_USAGE);
        assert!(out.stderr.contains("'@'"), "stderr: {}", out.stderr);
        assert!(out.stdout.is_empty());
    }

    #[tokio::test]
    async fn missing_repo_argument_is_a_usage_error() {
        let (_tmp, ctx) = context(Identity::user("alice"), true).await;
        let out = run_line("git-receive-pack", ctx, b"").await;
        assert_eq!(out.code, EXIT_USAGE);
        assert!(out.stderr.contains("REPO"), "stderr: {}", out.stderr);
    }

    #[tokio::test]
    async fn unknown_repository() {
        let (_tmp, ctx) = context(Identity::user("alice"), true).await;
        let out = run_line("git-upload-pack 'acme/nope.git'", ctx, b"").await;
        assert_eq!(out.code, 1);
        assert_eq!(out.stderr, "No such repository exists: acme/nope.git\n");
    }

    #[tokio::test]
    async fn denial_is_hidden_or_reported() {
        let (_tmp, ctx) = context(Identity::user("bob"), true).await;
        let out = run_line("git-receive-pack acme/tools.git", ctx, b"").await;
        assert_eq!(out.code, 1);
        assert_eq!(out.stderr, "No such repository exists: acme/tools.git\n");

        let (_tmp, ctx) = context(Identity::user("bob"), false).await;
        let out = run_line("git-receive-pack acme/tools.git", ctx, b"").await;
        assert_eq!(out.code, 1);
        assert_eq!(out.stderr, "Access denied to repository: acme/tools.git\n");
    }

    #[tokio::test]
    async fn push_advertises_refs() {
        let (_tmp, ctx) = context(Identity::user("alice"), true).await;
        // An immediate flush ends the push without commands.
        let out = run_line("git-receive-pack '/acme/tools.git'", ctx, b"0000").await;
        assert_eq!(out.code, 0, "stderr: {}", out.stderr);
        assert!(String::from_utf8_lossy(&out.stdout).contains("report-status"));
    }
}
