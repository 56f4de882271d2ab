//! Content hashing and cache footprints.
//!
//! The fast cache stores a `(updated_at, hash)` footprint per id, separate
//! from the full node blob, so the write path's read-repair and the
//! change-stream reconciler can decide staleness without deserializing the
//! whole node. The hash is 32-bit FNV-1a over the record's fields with keys
//! sorted lexicographically; key order never affects the result.

use crate::node::Timestamp;
use serde_json::Value;
use std::collections::BTreeMap;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over `name=json;` for every non-internal field, in key
/// order. `BTreeMap` iteration already guarantees lexicographic order, so
/// two semantically identical records hash identically regardless of how
/// their keys were supplied.
pub fn content_hash(record: &BTreeMap<String, Value>) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    let mut feed = |bytes: &[u8]| {
        for byte in bytes {
            hash ^= u32::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };
    for (name, value) in record {
        if name.starts_with('_') || name.starts_with('$') {
            continue;
        }
        feed(name.as_bytes());
        feed(b"=");
        // serde_json emits a canonical compact form for scalars and arrays.
        feed(value.to_string().as_bytes());
        feed(b";");
    }
    hash
}

/// The `(updated_at, hash)` pair cached per id to cheaply detect staleness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footprint {
    pub updated_at: Timestamp,
    pub hash: u32,
}

impl Footprint {
    pub fn new(updated_at: Timestamp, hash: u32) -> Self {
        Self { updated_at, hash }
    }

    /// Footprint of a flat record.
    pub fn of(record: &BTreeMap<String, Value>) -> Self {
        let updated_at = record
            .get("updated_at")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Self::new(updated_at, content_hash(record))
    }

    /// The shared staleness rule: a candidate is applied to the cache only
    /// if it is not older than the stored footprint AND its content hash
    /// differs. Equal hashes mean the cache already holds this content and
    /// re-serialization would be redundant.
    pub fn should_apply(&self, candidate: &Footprint) -> bool {
        candidate.updated_at >= self.updated_at && candidate.hash != self.hash
    }
}

impl Default for Footprint {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

// ============================================================================
// TESTS
// ============================================================================
