//! Node data model and lifecycle states.
//!
//! A node is a single persisted entity managed by the lifecycle engine.
//! Reserved bookkeeping lives in typed struct fields; caller data lives in
//! a sorted field map of JSON-safe scalars and arrays-of-scalars.

use crate::error::ValidationError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Epoch-millisecond timestamp. 0 = unset.
pub type Timestamp = i64;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// Node identifier: sequence-allocated integer or caller-supplied string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeId {
    Int(i64),
    Str(String),
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for NodeId {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl NodeId {
    /// JSON representation used in flat records and index documents.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(n) => Value::from(*n),
            Self::Str(s) => Value::from(s.as_str()),
        }
    }

    /// Parse an id back out of a flat record value.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::String(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }
}

/// Lifecycle state derived from the `(created_at, updated_at, deleted_at)`
/// triple. Exactly one state matches any persisted node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Id reserved, no content yet: `created_at = 0`, both other stamps set.
    Prepared,
    /// Fresh node: `deleted_at = 0`, `updated_at == created_at`.
    Created,
    /// Mutated node: `deleted_at = 0`, `updated_at > created_at`.
    Updated,
    /// Soft-deleted: `created_at` and `deleted_at` both set.
    Deleted,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prepared => "Prepared",
            Self::Created => "Created",
            Self::Updated => "Updated",
            Self::Deleted => "Deleted",
        };
        f.write_str(s)
    }
}

/// A persisted entity instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Set once on create, 0 while Prepared.
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Non-zero marks Prepared or Deleted.
    pub deleted_at: Timestamp,
    /// Schema version (`V`), set at creation, immutable.
    pub version: u32,
    /// Revision counter (`R`), incremented on every successful mutating
    /// write. Advisory only: never checked as a compare-and-swap.
    pub revision: u64,
    pub parent: Option<NodeId>,
    pub group: Option<NodeId>,
    /// Source node id; set only by the clone operation, immutable.
    pub cloned: Option<NodeId>,
    /// Caller fields, sorted by name.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

/// Reserved attribute names in the flat record representation.
pub const RESERVED_FIELDS: &[&str] = &[
    "id",
    "created_at",
    "updated_at",
    "deleted_at",
    "V",
    "R",
    "parent",
    "group",
    "cloned",
];

impl Node {
    /// A blank node for an id: all stamps unset, no fields.
    pub fn blank(id: NodeId, version: u32) -> Self {
        Self {
            id,
            created_at: 0,
            updated_at: 0,
            deleted_at: 0,
            version,
            revision: 0,
            parent: None,
            group: None,
            cloned: None,
            fields: BTreeMap::new(),
        }
    }

    /// Derive the lifecycle state from the timestamp triple.
    pub fn state(&self) -> LifecycleState {
        if self.deleted_at != 0 {
            if self.created_at == 0 {
                LifecycleState::Prepared
            } else {
                LifecycleState::Deleted
            }
        } else if self.updated_at > self.created_at {
            LifecycleState::Updated
        } else {
            LifecycleState::Created
        }
    }

    /// True when `deleted_at` is set (Prepared or Deleted). Mutating
    /// transitions other than prepare/create must start from a node where
    /// this is false; prepare/create require it to be true (or absence).
    pub fn is_deleted(&self) -> bool {
        self.deleted_at != 0
    }

    /// Flatten to the record representation persisted by the canonical
    /// store and hashed for the cache footprint. Unset relationship ids are
    /// omitted; reserved names come first only by the map's natural order.
    pub fn flatten(&self) -> BTreeMap<String, Value> {
        let mut record = self.fields.clone();
        record.insert("id".to_string(), self.id.to_value());
        record.insert("created_at".to_string(), Value::from(self.created_at));
        record.insert("updated_at".to_string(), Value::from(self.updated_at));
        record.insert("deleted_at".to_string(), Value::from(self.deleted_at));
        record.insert("V".to_string(), Value::from(self.version));
        record.insert("R".to_string(), Value::from(self.revision));
        if let Some(parent) = &self.parent {
            record.insert("parent".to_string(), parent.to_value());
        }
        if let Some(group) = &self.group {
            record.insert("group".to_string(), group.to_value());
        }
        if let Some(cloned) = &self.cloned {
            record.insert("cloned".to_string(), cloned.to_value());
        }
        record
    }

    /// Rebuild a node from its flat record representation.
    pub fn from_flat(record: &BTreeMap<String, Value>) -> Option<Self> {
        let id = NodeId::from_value(record.get("id")?)?;
        let stamp = |name: &str| -> Timestamp {
            record.get(name).and_then(Value::as_i64).unwrap_or(0)
        };
        let mut node = Self::blank(id, 0);
        node.created_at = stamp("created_at");
        node.updated_at = stamp("updated_at");
        node.deleted_at = stamp("deleted_at");
        node.version = record.get("V").and_then(Value::as_u64).unwrap_or(0) as u32;
        node.revision = record.get("R").and_then(Value::as_u64).unwrap_or(0);
        node.parent = record.get("parent").and_then(NodeId::from_value);
        node.group = record.get("group").and_then(NodeId::from_value);
        node.cloned = record.get("cloned").and_then(NodeId::from_value);
        node.fields = record
            .iter()
            .filter(|(name, _)| !RESERVED_FIELDS.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Some(node)
    }

    /// Project the node down to a subset of caller fields. Reserved
    /// attributes always survive projection.
    pub fn project(&self, projection: &[&str]) -> Self {
        let mut projected = self.clone();
        projected
            .fields
            .retain(|name, _| projection.contains(&name.as_str()));
        projected
    }
}

/// Caller-facing partial node: the only shape callers hand to mutating
/// operations. Field values must be JSON-safe scalars or arrays of scalars.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDraft {
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    pub parent: Option<NodeId>,
    pub group: Option<NodeId>,
}

impl NodeDraft {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn with_parent(mut self, parent: NodeId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_group(mut self, group: NodeId) -> Self {
        self.group = Some(group);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.parent.is_none() && self.group.is_none()
    }
}

/// Reject top-level nested objects and arrays containing non-scalars.
/// Scalars and arrays-of-scalars are the only legal field values.
pub fn validate_field_value(name: &str, value: &Value) -> Result<(), ValidationError> {
    match value {
        Value::Object(_) => Err(ValidationError::InvalidDataType {
            field: name.to_string(),
        }),
        Value::Array(items) => {
            if items
                .iter()
                .any(|item| matches!(item, Value::Object(_) | Value::Array(_)))
            {
                Err(ValidationError::InvalidDataType {
                    field: name.to_string(),
                })
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prepared(now: Timestamp) -> Node {
        let mut node = Node::blank(NodeId::Int(1), 1);
        node.updated_at = now;
        node.deleted_at = now;
        node
    }

    fn created(now: Timestamp) -> Node {
        let mut node = Node::blank(NodeId::Int(1), 1);
        node.created_at = now;
        node.updated_at = now;
        node
    }

    #[test]
    fn test_state_table() {
        let now = 1_700_000_000_000;

        assert_eq!(prepared(now).state(), LifecycleState::Prepared);
        assert_eq!(created(now).state(), LifecycleState::Created);

        let mut updated = created(now);
        updated.updated_at = now + 5;
        assert_eq!(updated.state(), LifecycleState::Updated);

        let mut deleted = updated.clone();
        deleted.deleted_at = now + 10;
        deleted.updated_at = now + 10;
        assert_eq!(deleted.state(), LifecycleState::Deleted);
    }

    #[test]
    fn test_is_deleted_covers_prepared_and_deleted() {
        let now = 1_700_000_000_000;
        assert!(prepared(now).is_deleted());
        assert!(!created(now).is_deleted());

        let mut deleted = created(now);
        deleted.deleted_at = now + 1;
        assert!(deleted.is_deleted());
    }

    #[test]
    fn test_flatten_roundtrip() {
        let now = 1_700_000_000_000;
        let mut node = created(now);
        node.revision = 3;
        node.parent = Some(NodeId::Int(9));
        node.cloned = Some(NodeId::Str("src".to_string()));
        node.fields.insert("name".to_string(), json!("a"));
        node.fields.insert("tags".to_string(), json!(["x", "y"]));

        let flat = node.flatten();
        assert_eq!(flat.get("R"), Some(&json!(3)));
        assert_eq!(flat.get("name"), Some(&json!("a")));

        let back = Node::from_flat(&flat).expect("flat record should parse");
        assert_eq!(back, node);
    }

    #[test]
    fn test_flatten_omits_unset_relationships() {
        let node = created(1);
        let flat = node.flatten();
        assert!(!flat.contains_key("parent"));
        assert!(!flat.contains_key("group"));
        assert!(!flat.contains_key("cloned"));
    }

    #[test]
    fn test_project_keeps_reserved_attributes() {
        let mut node = created(7);
        node.fields.insert("name".to_string(), json!("a"));
        node.fields.insert("email".to_string(), json!("a@b.c"));

        let projected = node.project(&["name"]);
        assert_eq!(projected.id, node.id);
        assert_eq!(projected.created_at, 7);
        assert!(projected.fields.contains_key("name"));
        assert!(!projected.fields.contains_key("email"));
    }

    #[test]
    fn test_validate_field_value() {
        assert!(validate_field_value("n", &json!(1)).is_ok());
        assert!(validate_field_value("n", &json!("s")).is_ok());
        assert!(validate_field_value("n", &json!([1, 2, 3])).is_ok());
        assert!(validate_field_value("n", &json!(null)).is_ok());

        assert!(validate_field_value("n", &json!({"a": 1})).is_err());
        assert!(validate_field_value("n", &json!([{"a": 1}])).is_err());
        assert!(validate_field_value("n", &json!([[1]])).is_err());
    }

    #[test]
    fn test_node_id_display_and_value() {
        assert_eq!(NodeId::Int(42).to_string(), "42");
        assert_eq!(NodeId::from("abc").to_string(), "abc");
        assert_eq!(NodeId::from_value(&json!(42)), Some(NodeId::Int(42)));
        assert_eq!(
            NodeId::from_value(&json!("abc")),
            Some(NodeId::Str("abc".to_string()))
        );
        assert_eq!(NodeId::from_value(&json!(true)), None);
    }
}
