//! Content fingerprints for segments.
//!
//! A fingerprint is the SHA-256 hex digest of the canonical JSON encoding of
//! `{"model_params": ..., "prompt": ...}`: compact, with the keys of every
//! object sorted. Sorting is done here rather than left to `serde_json`'s map
//! type, whose order changes when the `preserve_order` feature is enabled.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::types::Fingerprint;

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Fingerprint a segment's prompt and model parameters.
pub fn segment_fingerprint(prompt: &str, model_params: &Value) -> Fingerprint {
    let mut inputs = Map::new();
    inputs.insert("model_params".into(), canonicalize(model_params));
    inputs.insert("prompt".into(), Value::String(prompt.to_string()));
    sha256_hex(Value::Object(inputs).to_string().as_bytes())
}

/// Rebuild `value` with every object's keys inserted in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Idempotency key of a generation task: `"{segment_id}:{fingerprint}"`.
pub fn generation_key(segment_id: crate::types::DbId, fingerprint: &str) -> String {
    format!("{segment_id}:{fingerprint}")
}
