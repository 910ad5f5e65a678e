//! Share-link tokens.
//!
//! A token is `base64url(SHA-256(decimal(user) || salt))` cut to
//! [`TOKEN_LEN`] characters. The salt is secret, so a token reveals nothing
//! about the user id it stands for; only the holder of the salt-backed index
//! can resolve it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::{SALT_LEN, TOKEN_LEN};
use crate::error::TokenError;
use crate::types::UserId;

/// Process-wide secret mixed into every token.
///
/// Rotating it invalidates every link issued so far.
#[derive(Clone, PartialEq, Eq)]
pub struct Salt(Vec<u8>);

impl Salt {
    /// Generate a fresh random salt from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; SALT_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, TokenError> {
        if bytes.is_empty() {
            return Err(TokenError::EmptySalt);
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Salt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Salt(<{} bytes redacted>)", self.0.len())
    }
}

/// An opaque, salted token standing in for a [`UserId`] in shareable links.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkToken(String);

impl LinkToken {
    /// Derive the token for `user` under `salt`.
    pub fn derive(user: UserId, salt: &Salt) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(user.to_string().as_bytes());
        hasher.update(salt.as_bytes());
        let digest = hasher.finalize();

        let mut encoded = URL_SAFE_NO_PAD.encode(digest);
        encoded.truncate(TOKEN_LEN);
        Self(encoded)
    }

    /// Validate untrusted input (e.g. a `/start` payload) as a token.
    pub fn parse(s: &str) -> Result<Self, TokenError> {
        let s = s.trim();
        if s.len() != TOKEN_LEN {
            return Err(TokenError::InvalidLength {
                expected: TOKEN_LEN,
                got: s.len(),
            });
        }
        if let Some(bad) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(TokenError::InvalidCharacter(bad));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LinkToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
