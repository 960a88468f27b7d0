//! Canonical JSON serialization and content-addressed digests.
//!
//! `serde_json::Value`'s default `Map` is backed by a `BTreeMap` (the `preserve_order`
//! feature is not enabled anywhere in this workspace), so `serde_json::to_vec` already
//! emits object keys in sorted order with the compact `(',', ':')` separators the
//! canonicalization contract requires. No extra re-sorting pass is needed.

use md5::{Digest, Md5};
use serde_json::Value;
use uuid::Uuid;

/// Serializes a JSON value canonically: sorted object keys, no whitespace.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).expect("Value serialization is infallible")
}

/// Content-addressed UUID over the canonical serialization of `value`. Used to key
/// lookups and normalized tables whose primary key is a UUID derived from a digest
/// (certification lists, AFC config text, location, compressed JSON, ...).
pub fn uuid_for_json(value: &Value) -> Uuid {
    uuid_for_bytes(&canonical_bytes(value))
}

pub fn uuid_for_bytes(bytes: &[u8]) -> Uuid {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    let digest: [u8; 16] = hasher.finalize().into();
    Uuid::from_bytes(digest)
}

pub fn uuid_for_text(text: &str) -> Uuid {
    uuid_for_bytes(text.as_bytes())
}

/// Computes the request/config fingerprint (`req_cfg_digest`): a 128-bit digest over
/// the config text followed by the canonicalized request with `requestId` removed.
/// Stable under key-order and whitespace permutations, and insensitive to
/// `requestId` or any other per-transaction field.
pub fn fingerprint(request: &Value, config_text: &str) -> String {
    let mut sanitized = request.clone();
    if let Value::Object(ref mut map) = sanitized {
        map.remove("requestId");
    }
    let canonical_request = canonical_bytes(&sanitized);

    let mut hasher = Md5::new();
    hasher.update(config_text.as_bytes());
    hasher.update(&canonical_request);
    let digest: [u8; 16] = hasher.finalize().into();
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_stable_under_key_permutation() {
        let r1 = json!({"requestId": "abc", "a": 1, "b": 2});
        let r2 = json!({"b": 2, "a": 1, "requestId": "xyz"});
        assert_eq!(fingerprint(&r1, "cfg"), fingerprint(&r2, "cfg"));
    }

    #[test]
    fn fingerprint_insensitive_to_request_id() {
        let r1 = json!({"requestId": "abc", "a": 1});
        let r2 = json!({"requestId": "different", "a": 1});
        assert_eq!(fingerprint(&r1, "cfg"), fingerprint(&r2, "cfg"));
    }

    #[test]
    fn fingerprint_sensitive_to_config() {
        let r = json!({"a": 1});
        assert_ne!(fingerprint(&r, "cfg1"), fingerprint(&r, "cfg2"));
    }

    #[test]
    fn uuid_for_json_is_deterministic() {
        let v = json!({"z": 1, "a": 2});
        assert_eq!(uuid_for_json(&v), uuid_for_json(&v));
        let permuted = json!({"a": 2, "z": 1});
        assert_eq!(uuid_for_json(&v), uuid_for_json(&permuted));
    }
}
