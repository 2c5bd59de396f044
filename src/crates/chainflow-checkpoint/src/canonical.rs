//! Canonical JSON and spec hashing
//!
//! Two records are "the same" for confirmation and audit purposes when their
//! canonical JSON forms match: object keys sorted lexicographically at every
//! depth, array order preserved, and the volatile fields `created_at` and
//! `ts` stripped everywhere. [`spec_hash_keccak256`] is the keccak256 of that
//! canonical form, hex-lowercase — stable across processes for equal inputs.

use serde_json::{Map, Value as Json};
use tiny_keccak::{Hasher, Keccak};

/// Fields stripped before canonicalization.
const VOLATILE_FIELDS: &[&str] = &["created_at", "ts"];

/// Rewrite a JSON document into canonical form: sorted keys, volatile fields
/// removed, array order preserved.
pub fn canonical_json(value: &Json) -> Json {
    match value {
        Json::Object(map) => {
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|k| !VOLATILE_FIELDS.contains(&k.as_str()))
                .collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonical_json(&map[key]));
            }
            Json::Object(out)
        }
        Json::Array(items) => Json::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

/// The canonical serialized form of a document.
pub fn canonical_json_string(value: &Json) -> String {
    canonical_json(value).to_string()
}

/// keccak256 over raw bytes, hex-lowercase.
pub fn keccak256_hex(bytes: &[u8]) -> String {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(bytes);
    hasher.finalize(&mut output);
    hex::encode(output)
}

/// keccak256 of the canonical JSON form, hex-lowercase.
pub fn spec_hash_keccak256(value: &Json) -> String {
    keccak256_hex(canonical_json_string(value).as_bytes())
}
