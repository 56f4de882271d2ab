//! Adapter traits consumed by the lifecycle engine.
//!
//! Each backing service is specified at its interface boundary only; the
//! engine never sees a concrete backend. All adapters are object-safe so
//! the dependency bundle can hold `Arc<dyn _>` handles.

use crate::attr::ChangeRecord;
use crate::search::{SearchQuery, SearchResults};
use armature_core::{IdKind, NodeId, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

/// Flat record representation: the node flattened to plain JSON-safe
/// values, as persisted by the canonical store and indexed by the search
/// tier.
pub type Record = BTreeMap<String, Value>;

/// Increments applied server-side by a conditional update.
#[derive(Debug, Clone, Default)]
pub struct IncrementSpec {
    /// Numeric field deltas summed onto the stored values.
    pub deltas: BTreeMap<String, i64>,
    /// Atomically bump the revision counter (`R`) as part of the write.
    pub bump_revision: bool,
}

impl IncrementSpec {
    /// A revision bump with no field deltas.
    pub fn revision_only() -> Self {
        Self {
            deltas: BTreeMap::new(),
            bump_revision: true,
        }
    }

    pub fn with_delta(mut self, field: &str, delta: i64) -> Self {
        self.deltas.insert(field.to_string(), delta);
        self
    }
}

/// Durable key-value storage of nodes. The durability authority: cache and
/// index failures are tolerated, canonical store failures are not.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch a record, or `None` when the table has no row for the key.
    async fn get(&self, table: &str, key: &NodeId) -> Result<Option<Record>, StoreError>;

    /// Write a full record, replacing any existing row.
    async fn put(&self, table: &str, key: &NodeId, record: Record) -> Result<(), StoreError>;

    /// Apply a partial record plus optional server-side increments to an
    /// existing row, returning the updated record.
    ///
    /// Fails with `StoreError::NotFound` when the row is absent and with
    /// `StoreError::StaleAttribute` when an increment references an
    /// attribute the stored item does not carry.
    async fn conditional_update(
        &self,
        table: &str,
        key: &NodeId,
        partial: Record,
        increments: Option<IncrementSpec>,
    ) -> Result<Record, StoreError>;

    /// Physically remove a row, returning the prior record if one existed.
    async fn delete(&self, table: &str, key: &NodeId) -> Result<Option<Record>, StoreError>;

    /// Provision a table. `StoreError::AlreadyExists` when it is present.
    async fn create_table(
        &self,
        table: &str,
        key_name: &str,
        key_kind: IdKind,
    ) -> Result<(), StoreError>;

    /// Tear a table down. `StoreError::AlreadyAbsent` when it is missing.
    async fn delete_table(&self, table: &str) -> Result<(), StoreError>;

    /// Ordered change records with sequence numbers greater than `cursor`.
    async fn change_stream(&self, cursor: u64) -> Result<Vec<ChangeRecord>, StoreError>;
}

/// Secondary key-value store holding whole nodes plus the two footprint
/// keys per node.
#[async_trait]
pub trait FastCache: Send + Sync {
    async fn get(&self, prefix: &str, id: &NodeId) -> Result<Option<Value>, StoreError>;

    /// Write several values under several prefixes for one id in one call
    /// (node blob plus the two footprint keys). `prefixes` and `values`
    /// must be the same length.
    async fn put(
        &self,
        prefixes: &[String],
        id: &NodeId,
        values: Vec<Value>,
    ) -> Result<(), StoreError>;

    async fn delete(&self, prefix: &str, id: &NodeId) -> Result<(), StoreError>;
}

/// Index provisioning options resolved from the schema.
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Default to descending-time result order.
    pub time_series: bool,
}

/// Search index over a configurable subset (or all) of node fields; also
/// the authoritative read path when a schema's fast cache is disabled.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Provision an index. `StoreError::AlreadyExists` when present.
    async fn create_index(&self, index: &str, options: IndexOptions) -> Result<(), StoreError>;

    /// Drop an index. `StoreError::AlreadyAbsent` when missing.
    async fn delete_index(&self, index: &str) -> Result<(), StoreError>;

    async fn index_document(
        &self,
        index: &str,
        id: &NodeId,
        fields: Record,
    ) -> Result<(), StoreError>;

    async fn update_document(
        &self,
        index: &str,
        id: &NodeId,
        fields: Record,
    ) -> Result<(), StoreError>;

    async fn delete_document(&self, index: &str, id: &NodeId) -> Result<(), StoreError>;

    async fn search(&self, index: &str, query: &SearchQuery) -> Result<SearchResults, StoreError>;
}

/// Id sequence generator, used only for numeric, non-caller-supplied ids.
#[async_trait]
pub trait IdSequence: Send + Sync {
    async fn next_id(&self, sequence: &str) -> Result<i64, StoreError>;

    /// `StoreError::AlreadyExists` when the sequence is present.
    async fn create_sequence(&self, sequence: &str, start: i64) -> Result<(), StoreError>;

    /// `StoreError::AlreadyAbsent` when the sequence is missing.
    async fn delete_sequence(&self, sequence: &str) -> Result<(), StoreError>;
}
