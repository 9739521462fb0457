//! Content fingerprints for submitted snippets
//!
//! A fingerprint is the SHA-256 digest of the snippet's exact bytes. It is
//! the cache key, the ledger's `code_hash`, and the single-flight key.
//!
//! # Guarantees
//!
//! - **Deterministic**: same bytes always produce the same fingerprint
//! - **Fixed width**: 32 bytes / 64 hex chars regardless of input length

use std::fmt;

use sha2::{Digest, Sha256};

/// Prefix of every result cache key
pub const CACHE_KEY_PREFIX: &str = "code:";

/// SHA-256 digest of a code snippet
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

/// Fingerprint the exact bytes of a snippet
pub fn fingerprint(code: &[u8]) -> Fingerprint {
    let digest = Sha256::digest(code);
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    Fingerprint(bytes)
}

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering, 64 chars
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-char hex string back into a fingerprint
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Fingerprint(bytes))
    }

    /// Key under which this snippet's result is cached: `code:<hex>`
    pub fn cache_key(&self) -> String {
        format!("{}{}", CACHE_KEY_PREFIX, self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl serde::Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid fingerprint '{}'", s)))
    }
}
