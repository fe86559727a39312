//! Session identity
//!
//! One token per authoritative session. It is the address followers use to
//! find the presenter and the `ownerId` stamped into every state it produces.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigurationError;

/// Prefix shared by every generated identity
pub const SESSION_PREFIX: &str = "obs-";

/// Random characters after the prefix (36^10 ≈ 3.6e15 combinations)
const SESSION_RANDOM_LEN: usize = 10;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Opaque session token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh identity for a new authoritative session
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..SESSION_RANDOM_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self(format!("{}{}", SESSION_PREFIX, suffix))
    }

    /// Placeholder owner for states that no session produced
    pub(crate) fn unassigned() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = ConfigurationError;

    /// Accept an identity obtained out-of-band (link parameter or manual entry)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigurationError::MissingSessionId);
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigurationError::InvalidSessionId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}
