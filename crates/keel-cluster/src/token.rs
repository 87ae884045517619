//! Join tokens.
//!
//! A token is 32 random bytes rendered as hex. Only its SHA-256 digest is
//! stored, so a leaked table does not leak usable tokens.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Random bytes per token.
pub const TOKEN_BYTES: usize = 32;

/// A freshly issued join token.
///
/// The plaintext is only available here; `Debug` redacts it.
#[derive(Clone, PartialEq, Eq)]
pub struct JoinToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl JoinToken {
    pub(crate) fn new(token: String, expires_at: DateTime<Utc>) -> Self {
        Self { token, expires_at }
    }

    /// The plaintext token to hand to the joining node.
    pub fn secret(&self) -> &str {
        &self.token
    }

    /// When the token stops being accepted.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Digest under which the token is stored.
    pub fn hash(&self) -> String {
        hash_token(&self.token)
    }
}

impl fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Generate a new plaintext token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 hex digest of a token.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Short prefix of a digest, safe to log.
pub fn hash_prefix(hash: &str) -> &str {
    &hash[..hash.len().min(8)]
}
