//! Typed attribute-value encoding and change-stream records.
//!
//! The canonical store speaks a tagged-union value encoding (string,
//! number, bool, null, list, map). Change records carry old/new images in
//! that encoding; a small recursive marshaller converts them back to plain
//! field maps before the reconciler touches them.

use crate::traits::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Tagged-union value as stored by the canonical store. Numbers travel as
/// strings so the encoding is lossless for 64-bit integers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    S(String),
    N(String),
    Bool(bool),
    Null,
    L(Vec<AttrValue>),
    M(BTreeMap<String, AttrValue>),
}

impl AttrValue {
    /// Encode a plain JSON value into the tagged encoding.
    pub fn encode(value: &Value) -> Self {
        match value {
            Value::String(s) => Self::S(s.clone()),
            Value::Number(n) => Self::N(n.to_string()),
            Value::Bool(b) => Self::Bool(*b),
            Value::Null => Self::Null,
            Value::Array(items) => Self::L(items.iter().map(Self::encode).collect()),
            Value::Object(map) => Self::M(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::encode(v)))
                    .collect(),
            ),
        }
    }

    /// Decode back to a plain JSON value.
    pub fn decode(&self) -> Value {
        match self {
            Self::S(s) => Value::from(s.as_str()),
            Self::N(n) => {
                if let Ok(i) = n.parse::<i64>() {
                    Value::from(i)
                } else if let Ok(u) = n.parse::<u64>() {
                    Value::from(u)
                } else {
                    n.parse::<f64>().map(Value::from).unwrap_or(Value::Null)
                }
            }
            Self::Bool(b) => Value::from(*b),
            Self::Null => Value::Null,
            Self::L(items) => Value::Array(items.iter().map(Self::decode).collect()),
            Self::M(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.decode()))
                    .collect(),
            ),
        }
    }
}

/// Encode a plain record into a typed image.
pub fn encode_record(record: &Record) -> BTreeMap<String, AttrValue> {
    record
        .iter()
        .map(|(name, value)| (name.clone(), AttrValue::encode(value)))
        .collect()
}

/// Decode a typed image into a plain record.
pub fn decode_image(image: &BTreeMap<String, AttrValue>) -> Record {
    image
        .iter()
        .map(|(name, value)| (name.clone(), value.decode()))
        .collect()
}

/// Change-stream event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Modify,
    Remove,
}

/// One ordered change record from the canonical store's change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Monotonically increasing position in the change log.
    pub sequence: u64,
    pub kind: ChangeKind,
    /// Source table identifier; the reconciler ignores tables it does not
    /// own.
    pub source: String,
    /// Typed key image (key attribute name -> value).
    pub key: BTreeMap<String, AttrValue>,
    /// Typed image before the change (MODIFY/REMOVE).
    pub old_image: Option<BTreeMap<String, AttrValue>>,
    /// Typed image after the change (INSERT/MODIFY).
    pub new_image: Option<BTreeMap<String, AttrValue>>,
}

// ============================================================================
// TESTS
// ============================================================================
