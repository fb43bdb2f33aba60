//! Identity primitives for plan objects: stable 64-bit ids handed out by a
//! process-global allocator, and opaque content digests used by the event log
//! and the control protocol. Ids are never reused, so handles held by external
//! code stay valid identifiers even after the object is finalized.

use std::{
    fmt::Display,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};

/// Stable identifier of a task or event generator.
///
/// Allocated once per object from a process-global counter; relation graphs,
/// log records, and transaction proxies all refer to objects through this id
/// rather than through pointers.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ObjectId(u64);

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

impl ObjectId {
    /// Allocate a fresh id. Ids are unique for the lifetime of the process,
    /// which lets transactions create objects whose ids survive commit
    /// without remapping.
    pub fn next() -> Self {
        ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw 64-bit value, as written to log records and wire frames.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Rebuild an id from its raw value (log replay, wire decoding).
    pub const fn from_u64(value: u64) -> Self {
        ObjectId(value)
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque SHA-1 content digest.
///
/// Used for model identities, argument sets, emission contexts, and exception
/// matchers in the event log. The log only ever compares digests; it never
/// inverts them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest([u8; 20]);

impl Digest {
    /// Byte length of a digest value.
    pub const SIZE: usize = 20;

    /// Digest of raw bytes.
    pub fn of_bytes(data: &[u8]) -> Self {
        let h = Sha1::digest(data);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(h.as_ref());
        Digest(bytes)
    }

    /// Digest of a JSON value over its canonical (key-sorted) encoding, so
    /// that two structurally equal values always digest identically.
    pub fn of_value(value: &serde_json::Value) -> Self {
        Self::of_bytes(&crate::utils::canonical_json_bytes(value))
    }

    /// The all-zero digest, used where no payload exists (e.g. an emission
    /// without context).
    pub const fn zero() -> Self {
        Digest([0u8; 20])
    }

    /// Raw digest bytes.
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Rebuild a digest from raw bytes read off a log frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != Self::SIZE {
            return Err(format!(
                "Invalid digest length: got {}, expected {}",
                bytes.len(),
                Self::SIZE
            ));
        }
        let mut h = [0u8; 20];
        h.copy_from_slice(bytes);
        Ok(Digest(h))
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", hex::encode(self.0))
    }
}

/// Parse a 40-character hex string into a `Digest`.
impl FromStr for Digest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err("Invalid digest length".to_string());
        }
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{Digest, ObjectId};

    /// Allocated ids must be distinct and monotonically increasing.
    #[test]
    fn test_object_id_allocation() {
        let a = ObjectId::next();
        let b = ObjectId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    /// Hashing "Hello, world!" should match the known SHA-1 value.
    #[test]
    fn test_digest_of_bytes() {
        let digest = Digest::of_bytes("Hello, world!".as_bytes());
        assert_eq!(
            digest.to_string(),
            "943a702d06f34599aee1f8da8ef9f7296031d699"
        );
    }

    /// Digests must not depend on JSON object key ordering.
    #[test]
    fn test_digest_of_value_is_canonical() {
        let a: serde_json::Value = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap();
        assert_eq!(Digest::of_value(&a), Digest::of_value(&b));
    }

    /// Hex round-trip through Display and FromStr.
    #[test]
    fn test_digest_from_str() {
        let digest = Digest::of_bytes(b"abc");
        let parsed = Digest::from_str(&digest.to_string()).unwrap();
        assert_eq!(digest, parsed);
    }

    /// from_bytes must reject wrong lengths.
    #[test]
    fn test_digest_from_bytes_rejects_bad_length() {
        assert!(Digest::from_bytes(&[0u8; 19]).is_err());
        assert!(Digest::from_bytes(&[0u8; 21]).is_err());
    }
}
