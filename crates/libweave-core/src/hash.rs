use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use ciborium::Value;
use serde_json::Value as Json;

use crate::error::SyncError;

/// Schema version mixed into every content hash
pub const SCHEMA_VERSION: u8 = 1;

/// 256-bit content address (BLAKE2b-256)
pub type ContentHash = [u8; 32];

/// Compute the content address of a JSON value using canonical CBOR + BLAKE2b-256
pub fn content_hash(content: &Json) -> Result<ContentHash, SyncError> {
    let preimage = build_canonical_cbor(content)?;
    Ok(blake2b_256(&preimage))
}

/// Content address as lowercase hex
pub fn content_hash_hex(content: &Json) -> Result<String, SyncError> {
    content_hash(content).map(hex::encode)
}

/// BLAKE2b-256 over raw bytes
pub fn blake2b_256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Build the canonical CBOR preimage for hashing
/// Format: [schema_version, content]
pub fn build_canonical_cbor(content: &Json) -> Result<Vec<u8>, SyncError> {
    let array = Value::Array(vec![
        Value::Integer(SCHEMA_VERSION.into()),
        json_to_canonical_cbor(content),
    ]);

    let mut buf = Vec::new();
    ciborium::into_writer(&array, &mut buf)
        .map_err(|e| SyncError::Internal(format!("CBOR encoding failed: {}", e)))?;
    Ok(buf)
}

/// Convert JSON to a CBOR value with map keys sorted lexicographically
pub fn json_to_canonical_cbor(value: &Json) -> Value {
    match value {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => {
            if let Some(u) = n.as_u64() {
                Value::Integer(u.into())
            } else if let Some(i) = n.as_i64() {
                Value::Integer(i.into())
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        Json::String(s) => Value::Text(s.clone()),
        Json::Array(items) => Value::Array(items.iter().map(json_to_canonical_cbor).collect()),
        Json::Object(map) => {
            let mut entries: Vec<(&String, &Json)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (Value::Text(k.clone()), json_to_canonical_cbor(v)))
                    .collect(),
            )
        }
    }
}
