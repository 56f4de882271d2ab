//! Change-stream reconciler.
//!
//! Writes reach the cache and index tiers best-effort on the write path;
//! anything missed (fan-out failures, writes from other processes) is
//! converged here. The reconciler consumes the canonical store's ordered
//! change log and applies each record to the warm tiers, gated by the same
//! footprint rule the read path uses, so replaying a batch is harmless.

use crate::engine::{record_value, stored_footprint, EngineDeps};
use armature_core::{ArmatureResult, Footprint, Node, NodeId, Schema, StoreError};
use armature_store::{
    decode_image, AttrValue, ChangeKind, ChangeRecord, FastCache, ProcessCache, RecordStore,
    SearchIndex,
};
use serde_json::Value;
use std::sync::Arc;

/// Applies one schema's change records to its cache and index tiers.
pub struct Reconciler {
    schema: Schema,
    store: Arc<dyn RecordStore>,
    cache: Arc<dyn FastCache>,
    index: Arc<dyn SearchIndex>,
    local: Arc<ProcessCache>,
    cursor: u64,
}

impl Reconciler {
    pub fn new(schema: Schema, deps: &EngineDeps) -> Self {
        Self {
            schema,
            store: deps.store.clone(),
            cache: deps.cache.clone(),
            index: deps.index.clone(),
            local: deps.local.clone(),
            cursor: 0,
        }
    }

    /// Position in the change log; records at or before it are consumed.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Fetch everything past the cursor, apply it, advance the cursor.
    /// Returns how many records actually touched a tier.
    pub async fn drain(&mut self) -> ArmatureResult<usize> {
        let records = self.store.change_stream(self.cursor).await?;
        let applied = self.apply_batch(&records).await;
        if let Some(last) = records.last() {
            self.cursor = last.sequence;
        }
        Ok(applied)
    }

    /// Apply a batch sequentially. Records from tables this schema does not
    /// own are skipped; a failing record is logged and skipped so one bad
    /// image never wedges the stream.
    pub async fn apply_batch(&self, records: &[ChangeRecord]) -> usize {
        let mut applied = 0;
        for record in records {
            if record.source != self.schema.table {
                continue;
            }
            match self.apply(record).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        sequence = record.sequence,
                        table = %record.source,
                        "change record failed, skipping"
                    );
                }
            }
        }
        applied
    }

    async fn apply(&self, record: &ChangeRecord) -> ArmatureResult<bool> {
        let id = self.record_id(record)?;
        match record.kind {
            ChangeKind::Remove => {
                self.purge(&id).await;
                Ok(true)
            }
            ChangeKind::Insert | ChangeKind::Modify => {
                let Some(image) = &record.new_image else {
                    return Ok(false);
                };
                let flat = decode_image(image);
                let Some(node) = Node::from_flat(&flat) else {
                    return Err(StoreError::Codec {
                        reason: format!("change image for {id} is not a valid node"),
                    }
                    .into());
                };

                // Same staleness gate as read-repair: never regress the
                // cache, never rewrite identical content.
                let candidate = Footprint::of(&flat);
                let stored = stored_footprint(&self.schema, self.cache.as_ref(), &id).await;
                if !stored.should_apply(&candidate) {
                    return Ok(false);
                }

                if self.schema.cache_enabled() {
                    if let Some(keys) = self.schema.cache_keys() {
                        let values = vec![
                            record_value(&flat),
                            Value::from(candidate.updated_at),
                            Value::from(candidate.hash),
                        ];
                        self.cache.put(&keys, &id, values).await?;
                    }
                    // The process-local copy is stale now; drop it rather
                    // than refresh it, the next read re-warms it.
                    self.local.purge(&self.schema.table, &id);
                }

                let doc = match self.schema.index_projection() {
                    Some(projection) => node.project(&projection).flatten(),
                    None => flat,
                };
                self.index
                    .update_document(&self.schema.index, &id, doc)
                    .await?;
                Ok(true)
            }
        }
    }

    async fn purge(&self, id: &NodeId) {
        if let Some(keys) = self.schema.cache_keys() {
            for prefix in &keys {
                if let Err(e) = self.cache.delete(prefix, id).await {
                    tracing::warn!(error = %e, prefix = %prefix, id = %id, "cache purge failed");
                }
            }
        }
        if let Err(e) = self.index.delete_document(&self.schema.index, id).await {
            tracing::warn!(error = %e, index = %self.schema.index, id = %id, "index purge failed");
        }
        self.local.purge(&self.schema.table, id);
    }

    fn record_id(&self, record: &ChangeRecord) -> ArmatureResult<NodeId> {
        record
            .key
            .get("id")
            .map(AttrValue::decode)
            .as_ref()
            .and_then(NodeId::from_value)
            .ok_or_else(|| {
                StoreError::Codec {
                    reason: format!(
                        "change record {} carries no usable key",
                        record.sequence
                    ),
                }
                .into()
            })
    }
}

// ============================================================================
// TESTS
// ============================================================================
