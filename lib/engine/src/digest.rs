//! Stable hashing of resolved node inputs.
//!
//! The digest canonicalizes the input map (object keys sorted recursively,
//! compact JSON) before hashing, so the same resolved inputs produce the
//! same hash in every process. Truncation to 16 hex characters is safe
//! because result-cache keys are additionally scoped by workflow and node.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Length of the hex-encoded digest.
pub const INPUT_HASH_LEN: usize = 16;

/// Computes the stable digest of a resolved input map.
#[must_use]
pub fn input_hash(inputs: &Map<String, Value>) -> String {
    let mut canonical = String::new();
    write_canonical(&Value::Object(inputs.clone()), &mut canonical);

    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(INPUT_HASH_LEN);
    for byte in digest.iter().take(INPUT_HASH_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

fn write_canonical(value: &Value, buf: &mut String) {
    match value {
        Value::Array(items) => {
            buf.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_canonical(item, buf);
            }
            buf.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            buf.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                // Display for Value emits compact JSON with escaping.
                buf.push_str(&Value::String(key.clone()).to_string());
                buf.push(':');
                if let Some(item) = map.get(key) {
                    write_canonical(item, buf);
                }
            }
            buf.push('}');
        }
        other => buf.push_str(&other.to_string()),
    }
}
