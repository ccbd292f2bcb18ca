//! SSH front end.
//!
//! Accepts SSH connections from git clients, authenticates them by public
//! key, and runs `git-upload-pack` / `git-receive-pack` exec requests
//! against the repository resolver chain.

pub mod command;
pub mod server;
pub mod session;

pub use command::{CommandFactory, CommandLine, GitCommandFactory, SshCommand};
pub use server::start_ssh_server;
