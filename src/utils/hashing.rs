//! Deterministic fingerprint over an ordered list of strings.

use sha2::{Digest, Sha256};

/// Computes a hex-encoded SHA-256 digest of the given ordered strings. Each
/// string is fed length-prefixed, so that no choice of contents can make two
/// different lists encode to the same byte stream.
pub fn hash_strings<S: AsRef<str>>(strs: &[S]) -> String {
    let mut hasher = Sha256::new();
    for s in strs {
        let bytes = s.as_ref().as_bytes();
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    hex::encode(hasher.finalize())
}
