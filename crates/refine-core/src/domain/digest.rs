//! Canonical JSON and SHA-256 digests for snapshots and run artifacts.

use sha2::{Digest, Sha256};

use crate::domain::error::{RefineError, Result};

/// Recursively sort object keys so that equal values hash equally.
fn sort_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), sort_keys(v));
                }
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(arr) => serde_json::Value::Array(arr.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Compact JSON with sorted keys.
pub fn canonical_json<T: serde::Serialize>(value: &T) -> Result<String> {
    let raw = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&sort_keys(&raw))?)
}

/// SHA-256 hex digest of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 hex digest of a value's canonical JSON.
pub fn digest_of<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}

/// Compare a stored digest with the digest of `bytes`.
pub fn verify_digest(expected: &str, bytes: &[u8]) -> Result<()> {
    let actual = sha256_hex(bytes);
    if expected.trim() != actual {
        return Err(RefineError::DigestMismatch {
            expected: expected.trim().to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_change_digest() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 1}});
        let b = json!({"a": {"x": 1, "y": 2}, "b": 1});
        assert_eq!(digest_of(&a).unwrap(), digest_of(&b).unwrap());
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_verify_digest_mismatch() {
        let err = verify_digest("deadbeef", b"abc").unwrap_err();
        assert!(matches!(err, RefineError::DigestMismatch { .. }));
    }
}
