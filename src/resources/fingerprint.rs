//! Content fingerprints.
//!
//! A fingerprint is the SHA-256 of the canonical JSON encoding of a value.
//! Maps in our types are `BTreeMap`s, so the encoding is stable.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::controller::error::Result;

/// Hex-encoded SHA-256 of the JSON encoding of `value`.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// First eight characters of a fingerprint, for use in object names.
pub fn short(fingerprint: &str) -> &str {
    fingerprint.get(..8).unwrap_or(fingerprint)
}
