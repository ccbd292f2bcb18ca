//! Identity and capability checks.
//!
//! Every operation that needs to know who is calling receives an
//! [`Identity`] argument; nothing here reads ambient security state.  The
//! capability check is the [`AccessRule`] attached to each repository entry
//! of the configuration.

pub mod users;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use users::{fingerprint_of, UserDirectory};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// The authenticated caller of one HTTP request or SSH session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Anonymous,
    User(String),
}

impl Identity {
    pub fn user(name: impl Into<String>) -> Self {
        Identity::User(name.into())
    }

    /// Name used in logs, reflog entries and crumbs.
    pub fn name(&self) -> &str {
        match self {
            Identity::Anonymous => "anonymous",
            Identity::User(name) => name,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Permission
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Read => f.write_str("read"),
            Permission::Write => f.write_str("write"),
        }
    }
}

/// A capability check failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{identity} is missing the {permission} permission")]
pub struct AccessDenied {
    pub identity: Identity,
    pub permission: Permission,
}

// ---------------------------------------------------------------------------
// Access rule
// ---------------------------------------------------------------------------

/// Principals allowed to read and write one repository entry.
///
/// Entries are user names, `*` for any authenticated user, and `anonymous`
/// for unauthenticated callers.  Write does not imply read; a push needs
/// both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AccessRule {
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
}

impl AccessRule {
    pub fn new<R, W>(read: R, write: W) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
        W: IntoIterator,
        W::Item: Into<String>,
    {
        Self {
            read: read.into_iter().map(Into::into).collect(),
            write: write.into_iter().map(Into::into).collect(),
        }
    }

    /// Allow or deny `identity` the given permission.
    pub fn check(&self, identity: &Identity, permission: Permission) -> Result<(), AccessDenied> {
        let principals = match permission {
            Permission::Read => &self.read,
            Permission::Write => &self.write,
        };
        if principals.iter().any(|p| matches(p, identity)) {
            Ok(())
        } else {
            Err(AccessDenied {
                identity: identity.clone(),
                permission,
            })
        }
    }
}

fn matches(principal: &str, identity: &Identity) -> bool {
    match (principal, identity) {
        ("anonymous", Identity::Anonymous) => true,
        ("*", Identity::User(_)) => true,
        (name, Identity::User(user)) => name == user,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
