//! `CanonicalBundle`: the sealed form of an input or result bundle.
//!
//! A bundle is the canonical JSON bytes of a record plus the domain-separated
//! hash of those bytes. Two bundles built from logically identical records
//! carry identical bytes and identical hashes.

use crate::canon::{canonical_json_bytes, CanonError};
use crate::hash::{canonical_hash, ContentHash, HashDomain};

/// Canonical bytes + content hash of one record.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CanonicalBundle {
    /// Canonical JSON bytes.
    #[serde(with = "bytes_as_utf8")]
    pub bytes: Vec<u8>,
    /// `canonical_hash(domain, bytes)`.
    pub hash: ContentHash,
}

/// Error rebuilding or checking a bundle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BundleError {
    #[error(transparent)]
    Canon(#[from] CanonError),
    /// Stored bytes are not valid JSON.
    #[error("bundle bytes are not JSON: {detail}")]
    NotJson { detail: String },
    /// Stored bytes are valid JSON but not in canonical form.
    #[error("bundle bytes are not in canonical form")]
    NotCanonical,
    /// Stored hash does not match the recomputed one.
    #[error("bundle hash mismatch: stored {stored}, recomputed {recomputed}")]
    HashMismatch { stored: String, recomputed: String },
}

impl CanonicalBundle {
    /// Canonicalize `value` and hash it under `domain`.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Canon`] if canonicalization fails.
    pub fn from_value(domain: HashDomain, value: &serde_json::Value) -> Result<Self, BundleError> {
        let bytes = canonical_json_bytes(value)?;
        let hash = canonical_hash(domain, &bytes);
        Ok(Self { bytes, hash })
    }

    /// Parse the canonical bytes back into a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::NotJson`] if the bytes do not parse.
    pub fn value(&self) -> Result<serde_json::Value, BundleError> {
        serde_json::from_slice(&self.bytes).map_err(|e| BundleError::NotJson {
            detail: e.to_string(),
        })
    }

    /// Check that the bytes are canonical and that the hash matches them.
    ///
    /// # Errors
    ///
    /// Returns the first [`BundleError`] encountered.
    pub fn verify(&self, domain: HashDomain) -> Result<(), BundleError> {
        let value = self.value()?;
        if canonical_json_bytes(&value)? != self.bytes {
            return Err(BundleError::NotCanonical);
        }
        let recomputed = canonical_hash(domain, &self.bytes);
        if recomputed != self.hash {
            return Err(BundleError::HashMismatch {
                stored: self.hash.as_str().to_string(),
                recomputed: recomputed.as_str().to_string(),
            });
        }
        Ok(())
    }
}

/// Canonical bytes are always UTF-8 JSON; store them as a string so a
/// serialized snapshot stays readable.
mod bytes_as_utf8 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let text = std::str::from_utf8(bytes).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(String::deserialize(deserializer)?.into_bytes())
    }
}
