// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Content digests used by the audit trail and the relay integrity check.
//!
//! Every digest is the lowercase hex SHA-256 of the value's canonical JSON
//! encoding. `serde_json::Value` objects are backed by a sorted map, so two
//! payloads with the same meaning produce the same digest regardless of the
//! key order an external system echoes them back in.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 of raw bytes, hex encoded.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of the canonical JSON encoding of `value`.
///
/// Values are first lowered into `serde_json::Value` so map keys are sorted
/// before hashing.
pub fn digest_of<T: Serialize + ?Sized>(value: &T) -> String {
    let canonical = serde_json::to_value(value)
        .and_then(|v| serde_json::to_vec(&v))
        .unwrap_or_default();
    sha256_hex(&canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_digest_ignores_key_order() {
        let a = json!({"summary": "ok", "score": 0.9});
        let b: serde_json::Value =
            serde_json::from_str(r#"{"score": 0.9, "summary": "ok"}"#).unwrap();
        assert_eq!(digest_of(&a), digest_of(&b));
    }

    #[test]
    fn test_digest_detects_changed_value() {
        let a = json!({"summary": "ok"});
        let b = json!({"summary": "ok!"});
        assert_ne!(digest_of(&a), digest_of(&b));
        assert_eq!(digest_of(&a).len(), 64);
    }
}
