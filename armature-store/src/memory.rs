//! In-memory reference implementations of every adapter.
//!
//! These back the test suite and small single-process deployments. They
//! use `tokio::sync::RwLock` for safe async access and keep an ordered
//! change log so `change_stream` behaves like a real store's change feed.

use crate::attr::{encode_record, AttrValue, ChangeKind, ChangeRecord};
use crate::search::{FieldFilter, SearchQuery, SearchResults, SortOrder};
use crate::traits::{
    FastCache, IdSequence, IncrementSpec, IndexOptions, Record, RecordStore, SearchIndex,
};
use armature_core::{IdKind, NodeId, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tokio::sync::RwLock;

// ============================================================================
// CANONICAL RECORD STORE
// ============================================================================

/// In-memory canonical record store with a change log.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    tables: HashMap<String, TableState>,
    log: Vec<ChangeRecord>,
    sequence: u64,
}

#[derive(Debug)]
struct TableState {
    key_name: String,
    #[allow(dead_code)]
    // Retained so provisioning mirrors a real store's table descriptor.
    key_kind: IdKind,
    rows: BTreeMap<NodeId, Record>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of change records emitted so far.
    pub async fn change_log_len(&self) -> usize {
        self.inner.read().await.log.len()
    }
}

fn key_image(key_name: &str, key: &NodeId) -> BTreeMap<String, AttrValue> {
    let mut image = BTreeMap::new();
    image.insert(key_name.to_string(), AttrValue::encode(&key.to_value()));
    image
}

impl StoreInner {
    fn log_change(
        &mut self,
        kind: ChangeKind,
        table: &str,
        key_name: &str,
        key: &NodeId,
        old: Option<&Record>,
        new: Option<&Record>,
    ) {
        self.sequence += 1;
        self.log.push(ChangeRecord {
            sequence: self.sequence,
            kind,
            source: table.to_string(),
            key: key_image(key_name, key),
            old_image: old.map(encode_record),
            new_image: new.map(encode_record),
        });
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, table: &str, key: &NodeId) -> Result<Option<Record>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .tables
            .get(table)
            .and_then(|t| t.rows.get(key))
            .cloned())
    }

    async fn put(&self, table: &str, key: &NodeId, record: Record) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let key_name = inner
            .tables
            .get(table)
            .map(|t| t.key_name.clone())
            .ok_or_else(|| StoreError::Backend {
                reason: format!("table {table} does not exist"),
            })?;

        let old = inner
            .tables
            .get_mut(table)
            .expect("table presence checked above")
            .rows
            .insert(key.clone(), record.clone());

        let kind = if old.is_some() {
            ChangeKind::Modify
        } else {
            ChangeKind::Insert
        };
        inner.log_change(kind, table, &key_name, key, old.as_ref(), Some(&record));
        Ok(())
    }

    async fn conditional_update(
        &self,
        table: &str,
        key: &NodeId,
        partial: Record,
        increments: Option<IncrementSpec>,
    ) -> Result<Record, StoreError> {
        let mut inner = self.inner.write().await;
        let key_name = inner
            .tables
            .get(table)
            .map(|t| t.key_name.clone())
            .ok_or_else(|| StoreError::Backend {
                reason: format!("table {table} does not exist"),
            })?;

        let row = inner
            .tables
            .get_mut(table)
            .expect("table presence checked above")
            .rows
            .get_mut(key)
            .ok_or_else(|| StoreError::not_found(table, key))?;
        let old = row.clone();

        // Increments are validated before any mutation so a failed update
        // leaves the row untouched.
        if let Some(spec) = &increments {
            for attribute in spec.deltas.keys() {
                let current = row.get(attribute).and_then(Value::as_i64);
                if current.is_none() {
                    return Err(StoreError::StaleAttribute {
                        table: table.to_string(),
                        attribute: attribute.clone(),
                    });
                }
            }
        }

        for (name, value) in partial {
            row.insert(name, value);
        }
        if let Some(spec) = increments {
            for (attribute, delta) in spec.deltas {
                let current = row
                    .get(&attribute)
                    .and_then(Value::as_i64)
                    .expect("validated above");
                row.insert(attribute, Value::from(current + delta));
            }
            if spec.bump_revision {
                let revision = row.get("R").and_then(Value::as_u64).unwrap_or(0);
                row.insert("R".to_string(), Value::from(revision + 1));
            }
        }

        let updated = row.clone();
        inner.log_change(
            ChangeKind::Modify,
            table,
            &key_name,
            key,
            Some(&old),
            Some(&updated),
        );
        Ok(updated)
    }

    async fn delete(&self, table: &str, key: &NodeId) -> Result<Option<Record>, StoreError> {
        let mut inner = self.inner.write().await;
        let key_name = match inner.tables.get(table) {
            Some(t) => t.key_name.clone(),
            None => return Ok(None),
        };

        let old = inner
            .tables
            .get_mut(table)
            .expect("table presence checked above")
            .rows
            .remove(key);
        if let Some(prior) = &old {
            inner.log_change(ChangeKind::Remove, table, &key_name, key, Some(prior), None);
        }
        Ok(old)
    }

    async fn create_table(
        &self,
        table: &str,
        key_name: &str,
        key_kind: IdKind,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.tables.contains_key(table) {
            return Err(StoreError::AlreadyExists {
                resource: format!("table {table}"),
            });
        }
        inner.tables.insert(
            table.to_string(),
            TableState {
                key_name: key_name.to_string(),
                key_kind,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_table(&self, table: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.tables.remove(table).is_none() {
            return Err(StoreError::AlreadyAbsent {
                resource: format!("table {table}"),
            });
        }
        Ok(())
    }

    async fn change_stream(&self, cursor: u64) -> Result<Vec<ChangeRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .log
            .iter()
            .filter(|record| record.sequence > cursor)
            .cloned()
            .collect())
    }
}

// ============================================================================
// FAST CACHE
// ============================================================================

/// In-memory fast cache keyed `{prefix}:{id}`.
#[derive(Debug, Default)]
pub struct MemoryFastCache {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryFastCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(prefix: &str, id: &NodeId) -> String {
        format!("{prefix}:{id}")
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl FastCache for MemoryFastCache {
    async fn get(&self, prefix: &str, id: &NodeId) -> Result<Option<Value>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries.get(&Self::key(prefix, id)).cloned())
    }

    async fn put(
        &self,
        prefixes: &[String],
        id: &NodeId,
        values: Vec<Value>,
    ) -> Result<(), StoreError> {
        if prefixes.len() != values.len() {
            return Err(StoreError::Backend {
                reason: format!(
                    "put expects matching prefixes and values, got {} and {}",
                    prefixes.len(),
                    values.len()
                ),
            });
        }
        let mut entries = self.entries.write().await;
        for (prefix, value) in prefixes.iter().zip(values) {
            entries.insert(Self::key(prefix, id), value);
        }
        Ok(())
    }

    async fn delete(&self, prefix: &str, id: &NodeId) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.remove(&Self::key(prefix, id));
        Ok(())
    }
}

// ============================================================================
// SEARCH INDEX
// ============================================================================

/// In-memory search index with filter, free-text, ordering, and paging
/// support.
#[derive(Debug, Default)]
pub struct MemorySearchIndex {
    indexes: RwLock<HashMap<String, IndexState>>,
}

#[derive(Debug)]
struct IndexState {
    options: IndexOptions,
    docs: BTreeMap<NodeId, Record>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn doc_count(&self, index: &str) -> usize {
        self.indexes
            .read()
            .await
            .get(index)
            .map(|state| state.docs.len())
            .unwrap_or(0)
    }
}

fn matches(doc: &Record, query: &SearchQuery) -> bool {
    for filter in &query.filters {
        let ok = match filter {
            FieldFilter::Eq(field, value) => doc.get(field) == Some(value),
            FieldFilter::Ne(field, value) => doc.get(field) != Some(value),
            FieldFilter::Exists(field) => {
                matches!(doc.get(field), Some(v) if !v.is_null())
            }
            FieldFilter::NotExists(field) => {
                !matches!(doc.get(field), Some(v) if !v.is_null())
            }
        };
        if !ok {
            return false;
        }
    }
    if let Some(text) = &query.text {
        let needle = text.to_lowercase();
        return doc.values().any(|value| {
            matches!(value, Value::String(s) if s.to_lowercase().contains(&needle))
        });
    }
    true
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn create_index(&self, index: &str, options: IndexOptions) -> Result<(), StoreError> {
        let mut indexes = self.indexes.write().await;
        if indexes.contains_key(index) {
            return Err(StoreError::AlreadyExists {
                resource: format!("index {index}"),
            });
        }
        indexes.insert(
            index.to_string(),
            IndexState {
                options,
                docs: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<(), StoreError> {
        let mut indexes = self.indexes.write().await;
        if indexes.remove(index).is_none() {
            return Err(StoreError::AlreadyAbsent {
                resource: format!("index {index}"),
            });
        }
        Ok(())
    }

    async fn index_document(
        &self,
        index: &str,
        id: &NodeId,
        fields: Record,
    ) -> Result<(), StoreError> {
        let mut indexes = self.indexes.write().await;
        let state = indexes.get_mut(index).ok_or_else(|| StoreError::Backend {
            reason: format!("index {index} does not exist"),
        })?;
        state.docs.insert(id.clone(), fields);
        Ok(())
    }

    async fn update_document(
        &self,
        index: &str,
        id: &NodeId,
        fields: Record,
    ) -> Result<(), StoreError> {
        let mut indexes = self.indexes.write().await;
        let state = indexes.get_mut(index).ok_or_else(|| StoreError::Backend {
            reason: format!("index {index} does not exist"),
        })?;
        match state.docs.get_mut(id) {
            Some(doc) => {
                for (name, value) in fields {
                    doc.insert(name, value);
                }
            }
            None => {
                state.docs.insert(id.clone(), fields);
            }
        }
        Ok(())
    }

    async fn delete_document(&self, index: &str, id: &NodeId) -> Result<(), StoreError> {
        let mut indexes = self.indexes.write().await;
        if let Some(state) = indexes.get_mut(index) {
            state.docs.remove(id);
        }
        Ok(())
    }

    async fn search(&self, index: &str, query: &SearchQuery) -> Result<SearchResults, StoreError> {
        let started = Instant::now();
        let indexes = self.indexes.read().await;
        let state = indexes.get(index).ok_or_else(|| StoreError::Backend {
            reason: format!("index {index} does not exist"),
        })?;

        let mut hits: Vec<Record> = state
            .docs
            .values()
            .filter(|doc| matches(doc, query))
            .cloned()
            .collect();

        let sort = query.sort.clone().or_else(|| {
            state
                .options
                .time_series
                .then(|| ("updated_at".to_string(), SortOrder::Desc))
        });
        if let Some((field, order)) = sort {
            hits.sort_by(|a, b| {
                let ordering = compare_values(a.get(&field), b.get(&field));
                match order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                }
            });
        }

        let total = hits.len();
        let page = query.page.max(1);
        let limit = if query.limit == 0 { 20 } else { query.limit };
        let list: Vec<Record> = hits
            .into_iter()
            .skip((page - 1) * limit)
            .take(limit)
            .collect();

        Ok(SearchResults {
            list,
            total,
            page,
            limit,
            took: started.elapsed().as_millis() as u64,
            aggregations: query.aggregations.clone(),
        })
    }
}

// ============================================================================
// ID SEQUENCE
// ============================================================================

/// In-memory id sequence. `next_id` lazily starts an unknown sequence at 0
/// so it behaves like a counter row in a real store.
#[derive(Debug, Default)]
pub struct MemoryIdSequence {
    sequences: RwLock<HashMap<String, i64>>,
}

impl MemoryIdSequence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdSequence for MemoryIdSequence {
    async fn next_id(&self, sequence: &str) -> Result<i64, StoreError> {
        let mut sequences = self.sequences.write().await;
        let counter = sequences.entry(sequence.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn create_sequence(&self, sequence: &str, start: i64) -> Result<(), StoreError> {
        let mut sequences = self.sequences.write().await;
        if sequences.contains_key(sequence) {
            return Err(StoreError::AlreadyExists {
                resource: format!("sequence {sequence}"),
            });
        }
        sequences.insert(sequence.to_string(), start);
        Ok(())
    }

    async fn delete_sequence(&self, sequence: &str) -> Result<(), StoreError> {
        let mut sequences = self.sequences.write().await;
        if sequences.remove(sequence).is_none() {
            return Err(StoreError::AlreadyAbsent {
                resource: format!("sequence {sequence}"),
            });
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
