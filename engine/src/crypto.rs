//! # Hashing Utilities
//!
//! Every hash in the engine is SHA-256. Merkle leaves, internal nodes,
//! snapshot roots and checkpoint roots all come out of the helpers below, so
//! a verifier on another node (or another language) only has to agree with
//! us on one function and one byte layout.
//!
//! Hashes travel through JSON (snapshots, checkpoints, proofs) as lowercase
//! hex. The [`hex_hash`] module plugs into `#[serde(with = ...)]` so that
//! every struct holding a [`Hash`] agrees on that encoding.

use sha2::{Digest, Sha256};

/// A 32-byte SHA-256 digest.
pub type Hash = [u8; 32];

/// Root of an empty tree, and the "no root yet" sentinel in snapshots.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Compute the SHA-256 hash of the input data as a fixed-size array.
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash multiple byte slices together without concatenating them first.
///
/// `sha256_multi(&[a, b])` equals `sha256(a || b)`.
pub fn sha256_multi(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Internal Merkle node: `SHA256(left || right)`.
pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    sha256_multi(&[left.as_slice(), right.as_slice()])
}

/// Lowercase hex rendering of a hash.
pub fn to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

/// Parse a 64-character hex string into a hash.
///
/// Returns `None` for anything that is not exactly 32 bytes of valid hex.
pub fn from_hex(s: &str) -> Option<Hash> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

/// Serde adapter that encodes a [`Hash`] as a hex string.
pub mod hex_hash {
    use super::Hash;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Hash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::from_hex(&s)
            .ok_or_else(|| de::Error::custom(format!("invalid 32-byte hex hash: {s:?}")))
    }
}
