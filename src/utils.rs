//! Shared byte and stream utilities used by the event log codec and the
//! protocol framing, including exact-length reads and canonical JSON
//! encoding for digest stability.

use std::{
    io,
    io::Read,
};

use serde_json::Value;

/// Read exactly `len` bytes from the reader.
pub fn read_bytes(file: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Canonical JSON encoding: object keys sorted recursively so that
/// structurally equal values serialize to identical bytes. Arrays keep their
/// order; scalars use `serde_json`'s standard formatting.
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    let canonical = canonicalize(value);
    serde_json::to_vec(&canonical).unwrap_or_default()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = serde_json::Map::new();
            for (k, v) in entries {
                sorted.insert(k.clone(), canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
