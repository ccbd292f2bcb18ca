//! Resolution of SSH keys and HTTP credentials to configured users.

use std::collections::HashMap;

use base64::Engine as _;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

use super::Identity;
use crate::config::UserConfig;

/// Compute the SHA-256 fingerprint of an SSH public key, returned as a
/// base64-encoded string prefixed with `SHA256:` (matching the format used by
/// `ssh-keygen -l`).
pub fn fingerprint_of(key: &PublicKey) -> String {
    let blob_b64 = key.public_key_base64();
    let blob = base64::engine::general_purpose::STANDARD
        .decode(blob_b64.as_bytes())
        .unwrap_or_default();
    fingerprint_of_blob(&blob)
}

fn fingerprint_of_blob(blob: &[u8]) -> String {
    let hash = Sha256::digest(blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}

/// Lookup tables built once from the `users` section of the configuration.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    by_fingerprint: HashMap<String, String>,
    tokens: HashMap<String, Vec<String>>,
}

impl UserDirectory {
    pub fn new(users: &[UserConfig]) -> Self {
        let mut by_fingerprint = HashMap::new();
        let mut tokens = HashMap::new();
        for user in users {
            for fp in &user.ssh_keys {
                by_fingerprint.insert(fp.trim().to_string(), user.name.clone());
            }
            tokens.insert(user.name.clone(), user.http_tokens.clone());
        }
        Self {
            by_fingerprint,
            tokens,
        }
    }

    /// Number of configured users.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Map an SSH key fingerprint to its owner.
    pub fn resolve_fingerprint(&self, fingerprint: &str) -> Option<Identity> {
        self.by_fingerprint
            .get(fingerprint)
            .map(|name| Identity::User(name.clone()))
    }

    /// Validate an `Authorization` header value.
    ///
    /// Returns `None` for malformed headers, unknown users and wrong tokens;
    /// callers answer those with a Basic challenge.
    pub fn resolve_authorization(&self, header: &str) -> Option<Identity> {
        let encoded = header.strip_prefix("Basic ")?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, token) = decoded.split_once(':')?;

        let known = self.tokens.get(user)?;
        if known.iter().any(|t| t.as_bytes().ct_eq(token.as_bytes()).into()) {
            Some(Identity::User(user.to_string()))
        } else {
            debug!(user, "HTTP token mismatch");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> UserDirectory {
        UserDirectory::new(&[UserConfig {
            name: "alice".into(),
            ssh_keys: vec!["SHA256:abc".into()],
            http_tokens: vec!["s3cret".into()],
        }])
    }

    fn basic(user: &str, token: &str) -> String {
        let raw = format!("{user}:{token}");
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }

    #[test]
    fn resolves_known_fingerprint() {
        let dir = directory();
        assert_eq!(
            dir.resolve_fingerprint("SHA256:abc"),
            Some(Identity::user("alice"))
        );
        assert_eq!(dir.resolve_fingerprint("SHA256:zzz"), None);
    }

    #[test]
    fn resolves_basic_credentials() {
        let dir = directory();
        assert_eq!(
            dir.resolve_authorization(&basic("alice", "s3cret")),
            Some(Identity::user("alice"))
        );
        assert_eq!(dir.resolve_authorization(&basic("alice", "wrong")), None);
        assert_eq!(dir.resolve_authorization(&basic("mallory", "s3cret")), None);
        assert_eq!(dir.resolve_authorization("Bearer s3cret"), None);
        assert_eq!(dir.resolve_authorization("Basic !!!"), None);
    }

    #[test]
    fn tokens_must_match_exactly() {
        let dir = directory();
        assert_eq!(dir.resolve_authorization(&basic("alice", "s3cre")), None);
        assert_eq!(dir.resolve_authorization(&basic("alice", "s3cret!")), None);
        assert_eq!(dir.resolve_authorization(&basic("alice", "")), None);
        assert_eq!(
            dir.resolve_authorization(&basic("alice", "s3cret:extra")),
            None
        );
    }

    #[test]
    fn fingerprint_has_openssh_shape() {
        let fp = fingerprint_of_blob(b"not really a key");
        assert!(fp.starts_with("SHA256:"));
        // 32-byte digest, unpadded base64.
        assert_eq!(fp.len(), "SHA256:".len() + 43);
    }
}
