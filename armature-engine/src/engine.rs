//! Node lifecycle engine.
//!
//! # Design
//!
//! One `NodeEngine` is constructed per schema with an explicit dependency
//! bundle; nothing is resolved through globals. Writes land in the
//! canonical store first, then fan out best-effort to the fast cache, the
//! search index, and the process-local cache. Reads walk the tiers from
//! cheapest to authoritative and repair the cache on the way back up.
//! Last writer wins: the revision counter is advisory and never checked
//! as a compare-and-swap.

use crate::context::{OpMode, OperationContext};
use armature_core::{
    now_millis, validate_field_value, ArmatureResult, EngineError, FieldCipher, Footprint, IdKind,
    Node, NodeDraft, NodeId, Schema, StoreError, Timestamp, ValidationError,
};
use armature_notify::NotifyBus;
use armature_store::{
    FastCache, FieldFilter, IdSequence, IncrementSpec, IndexOptions, ProcessCache, Record,
    RecordStore, SearchIndex, SearchQuery, SearchResults,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Time source, swappable for deterministic tests.
pub type Clock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

/// Everything an engine (or reconciler) needs, injected at construction.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn RecordStore>,
    pub cache: Arc<dyn FastCache>,
    pub index: Arc<dyn SearchIndex>,
    pub sequence: Arc<dyn IdSequence>,
    pub bus: Arc<NotifyBus>,
    pub local: Arc<ProcessCache>,
    /// Field-level cipher; `None` leaves encrypted-flagged fields as-is.
    pub cipher: Option<FieldCipher>,
}

/// Result of a mutating operation.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub node: Node,
    /// Draft fields the schema recognized.
    pub recognized: usize,
    /// Recognized fields whose stored value actually changed. 0 means the
    /// operation was suppressed as a no-op: nothing written, nothing
    /// published.
    pub changed: usize,
}

/// Lifecycle engine for one schema.
pub struct NodeEngine {
    schema: Schema,
    deps: EngineDeps,
    clock: Clock,
}

/// Flat record as a JSON object, the shape cached blobs and event payloads
/// use.
pub(crate) fn record_value(record: &Record) -> Value {
    Value::Object(
        record
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
    )
}

fn node_from_value(value: &Value) -> Option<Node> {
    let map = value.as_object()?;
    let record: Record = map
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    Node::from_flat(&record)
}

fn apply_partial(node: &mut Node, partial: &Record) {
    for (name, value) in partial {
        match name.as_str() {
            "updated_at" => node.updated_at = value.as_i64().unwrap_or(node.updated_at),
            "deleted_at" => node.deleted_at = value.as_i64().unwrap_or(node.deleted_at),
            "parent" => node.parent = NodeId::from_value(value),
            "group" => node.group = NodeId::from_value(value),
            _ => {
                node.fields.insert(name.clone(), value.clone());
            }
        }
    }
}

/// Footprint currently held by the fast cache for an id, `(0, 0)` when the
/// cache has none (or the tier is unreachable, which must not block reads).
pub(crate) async fn stored_footprint(
    schema: &Schema,
    cache: &dyn FastCache,
    id: &NodeId,
) -> Footprint {
    let Some([_, updated_key, hash_key]) = schema.cache_keys() else {
        return Footprint::default();
    };
    let updated_at = cache
        .get(&updated_key, id)
        .await
        .ok()
        .flatten()
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let hash = cache
        .get(&hash_key, id)
        .await
        .ok()
        .flatten()
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;
    Footprint::new(updated_at, hash)
}

impl NodeEngine {
    pub fn new(schema: Schema, deps: EngineDeps) -> Self {
        Self {
            schema,
            deps,
            clock: Arc::new(now_millis),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn now(&self) -> Timestamp {
        (self.clock)()
    }

    // ========================================================================
    // PROVISIONING
    // ========================================================================

    /// Provision the table, index, and (for sequence ids) the id sequence.
    /// Already-provisioned resources are logged and skipped.
    pub async fn initialize(&self) -> ArmatureResult<()> {
        let swallow = |result: Result<(), StoreError>, what: &str| match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_idempotent_noise() => {
                tracing::warn!(error = %e, table = %self.schema.table, "{what} already provisioned");
                Ok(())
            }
            Err(e) => Err(e),
        };

        swallow(
            self.deps
                .store
                .create_table(&self.schema.table, "id", self.schema.id_kind)
                .await,
            "table",
        )?;
        swallow(
            self.deps
                .index
                .create_index(
                    &self.schema.index,
                    IndexOptions {
                        time_series: self.schema.time_series,
                    },
                )
                .await,
            "index",
        )?;
        if self.schema.id_kind == IdKind::Sequence {
            swallow(
                self.deps
                    .sequence
                    .create_sequence(&self.schema.sequence, 0)
                    .await,
                "sequence",
            )?;
        }
        Ok(())
    }

    /// Tear down everything `initialize` provisioned. Already-absent
    /// resources are logged and skipped.
    pub async fn terminate(&self) -> ArmatureResult<()> {
        let swallow = |result: Result<(), StoreError>, what: &str| match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_idempotent_noise() => {
                tracing::warn!(error = %e, table = %self.schema.table, "{what} already removed");
                Ok(())
            }
            Err(e) => Err(e),
        };

        swallow(self.deps.store.delete_table(&self.schema.table).await, "table")?;
        swallow(self.deps.index.delete_index(&self.schema.index).await, "index")?;
        if self.schema.id_kind == IdKind::Sequence {
            swallow(
                self.deps.sequence.delete_sequence(&self.schema.sequence).await,
                "sequence",
            )?;
        }
        self.deps.local.clear();
        Ok(())
    }

    // ========================================================================
    // LIFECYCLE OPERATIONS
    // ========================================================================

    /// Reserve an id without creating content. The node lands Prepared:
    /// `created_at` stays 0, `updated_at` and `deleted_at` carry the
    /// operation stamp. The slot must be absent or deleted unless the
    /// schema forces creation.
    pub async fn prepare(&self, id: Option<NodeId>, draft: &NodeDraft) -> ArmatureResult<Outcome> {
        let id = self.allocate_id(id).await?;
        let mut ctx = OperationContext::new(OpMode::Prepare, id.clone(), self.now());
        self.require_writable_slot(&ctx).await?;

        let mut node = Node::blank(id, self.schema.version);
        node.updated_at = ctx.now;
        node.deleted_at = ctx.now;
        node.fields = self.shape_fresh(draft, &mut ctx)?;
        node.parent = draft.parent.clone();
        node.group = draft.group.clone();

        self.deps
            .store
            .put(&self.schema.table, &node.id, node.flatten())
            .await?;
        self.fan_out(&node).await;
        self.notify_record("prepare", &node, &ctx).await;
        Ok(Outcome {
            node,
            recognized: ctx.recognized,
            changed: ctx.changed,
        })
    }

    /// Create a node, or resurrect a deleted/prepared one under the same
    /// id. Stamps `created_at = updated_at = now`, clears `deleted_at`,
    /// and bumps the revision past any prior occupant's.
    pub async fn create(&self, id: Option<NodeId>, draft: &NodeDraft) -> ArmatureResult<Outcome> {
        let id = self.allocate_id(id).await?;
        let mut ctx = OperationContext::new(OpMode::Create, id.clone(), self.now());
        let prior = self.require_writable_slot(&ctx).await?;

        let mut node = Node::blank(id, self.schema.version);
        node.created_at = ctx.now;
        node.updated_at = ctx.now;
        node.revision = prior.as_ref().map(|p| p.revision + 1).unwrap_or(1);
        node.fields = self.shape_fresh(draft, &mut ctx)?;
        node.parent = draft.parent.clone();
        node.group = draft.group.clone();

        self.deps
            .store
            .put(&self.schema.table, &node.id, node.flatten())
            .await?;
        self.fan_out(&node).await;
        self.notify_record("create", &node, &ctx).await;
        Ok(Outcome {
            node,
            recognized: ctx.recognized,
            changed: ctx.changed,
        })
    }

    /// Apply a partial draft to a live node. Unrecognized fields are
    /// skipped; recognized fields whose value is already stored are
    /// suppressed. A draft that changes nothing writes nothing and
    /// publishes nothing.
    pub async fn update(&self, id: &NodeId, draft: &NodeDraft) -> ArmatureResult<Outcome> {
        let mut ctx = OperationContext::new(OpMode::Update, id.clone(), self.now());
        let prior = self.read(id).await?;
        self.require_live(&prior, &ctx)?;

        let mut partial = self.shape_update(draft, &prior, &mut ctx)?;
        if !ctx.dirty() {
            tracing::debug!(table = %self.schema.table, id = %ctx.id, "update changed nothing, suppressed");
            return Ok(Outcome {
                node: prior,
                recognized: ctx.recognized,
                changed: 0,
            });
        }

        partial.insert("updated_at".to_string(), Value::from(ctx.now));
        let node = self
            .commit_partial(&prior, partial, IncrementSpec::revision_only(), &ctx)
            .await?;
        self.fan_out(&node).await;
        self.notify_record("update", &node, &ctx).await;
        Ok(Outcome {
            node,
            recognized: ctx.recognized,
            changed: ctx.changed,
        })
    }

    /// Add deltas to numeric fields server-side. A delta naming an
    /// attribute the stored row does not carry fails with
    /// `StoreError::StaleAttribute`; all-zero or all-unrecognized deltas
    /// are a suppressed no-op.
    pub async fn increment(
        &self,
        id: &NodeId,
        deltas: &BTreeMap<String, i64>,
    ) -> ArmatureResult<Outcome> {
        let mut ctx = OperationContext::new(OpMode::Increment, id.clone(), self.now());
        let prior = self.read(id).await?;
        self.require_live(&prior, &ctx)?;

        let mut spec = IncrementSpec::revision_only();
        for (name, delta) in deltas {
            if !self.schema.recognizes(name) {
                continue;
            }
            ctx.recognized += 1;
            if *delta == 0 {
                continue;
            }
            spec = spec.with_delta(name, *delta);
            ctx.changed += 1;
        }
        if !ctx.dirty() {
            return Ok(Outcome {
                node: prior,
                recognized: ctx.recognized,
                changed: 0,
            });
        }

        let mut partial = Record::new();
        partial.insert("updated_at".to_string(), Value::from(ctx.now));
        let node = self.commit_partial(&prior, partial, spec, &ctx).await?;
        self.fan_out(&node).await;
        self.notify_record("update", &node, &ctx).await;
        Ok(Outcome {
            node,
            recognized: ctx.recognized,
            changed: ctx.changed,
        })
    }

    /// Soft-delete: stamp `deleted_at`, keep the row. Idempotent; deleting
    /// an already-deleted node returns it unchanged without a write or an
    /// event.
    pub async fn delete(&self, id: &NodeId) -> ArmatureResult<Outcome> {
        let ctx = OperationContext::new(OpMode::Delete, id.clone(), self.now());
        let prior = self.read(id).await?;
        if prior.is_deleted() {
            return Ok(Outcome {
                node: prior,
                recognized: 0,
                changed: 0,
            });
        }

        let mut partial = Record::new();
        partial.insert("updated_at".to_string(), Value::from(ctx.now));
        partial.insert("deleted_at".to_string(), Value::from(ctx.now));
        let node = self
            .commit_partial(&prior, partial, IncrementSpec::revision_only(), &ctx)
            .await?;
        self.fan_out(&node).await;
        self.notify_record("delete", &node, &ctx).await;
        Ok(Outcome {
            node,
            recognized: 0,
            changed: 1,
        })
    }

    /// Hard-delete: remove the row and purge every cache and index tier.
    /// Returns the node as it was, fails with `NotFound` when there was
    /// none.
    pub async fn destroy(&self, id: &NodeId) -> ArmatureResult<Outcome> {
        let ctx = OperationContext::new(OpMode::Destroy, id.clone(), self.now());
        let record = self
            .deps
            .store
            .delete(&self.schema.table, id)
            .await?
            .ok_or_else(|| StoreError::not_found(self.schema.table.as_str(), id))?;
        let node = Node::from_flat(&record).ok_or_else(|| StoreError::Codec {
            reason: format!("stored row for {id} is not a valid node"),
        })?;

        self.purge_tiers(id).await;
        self.notify_record("destroy", &node, &ctx).await;
        Ok(Outcome {
            node,
            recognized: 0,
            changed: 1,
        })
    }

    /// Copy a live node's caller fields into a new node. The copy records
    /// its origin in `cloned`, points `parent` at the source unless an
    /// override is given, keeps the source's group, and announces itself
    /// as a create.
    pub async fn clone_node(
        &self,
        source: &NodeId,
        target: Option<NodeId>,
        parent: Option<NodeId>,
    ) -> ArmatureResult<Outcome> {
        if !self.schema.clonable {
            return Err(EngineError::CloneDisabled {
                table: self.schema.table.clone(),
            }
            .into());
        }
        let origin = self.read(source).await?;
        if origin.is_deleted() {
            return Err(EngineError::InvalidState {
                table: self.schema.table.clone(),
                id: source.to_string(),
                state: origin.state().to_string(),
                operation: OpMode::Clone.as_str().to_string(),
            }
            .into());
        }

        let id = self.allocate_id(target).await?;
        let mut ctx = OperationContext::new(OpMode::Clone, id.clone(), self.now());
        self.require_writable_slot(&ctx).await?;

        let mut node = Node::blank(id, self.schema.version);
        node.created_at = ctx.now;
        node.updated_at = ctx.now;
        node.revision = 1;
        node.fields = origin.fields.clone();
        node.parent = parent.or_else(|| Some(source.clone()));
        node.group = origin.group;
        node.cloned = Some(source.clone());
        ctx.recognized = node.fields.len();
        ctx.changed = node.fields.len();

        self.deps
            .store
            .put(&self.schema.table, &node.id, node.flatten())
            .await?;
        self.fan_out(&node).await;
        self.notify_record("create", &node, &ctx).await;
        Ok(Outcome {
            node,
            recognized: ctx.recognized,
            changed: ctx.changed,
        })
    }

    // ========================================================================
    // READ PATH
    // ========================================================================

    /// Read one node, walking the tiers: process-local cache, then the
    /// fast cache (or the search index for cache-disabled schemas), then
    /// the canonical store. Time-series schemas go straight to the store.
    /// A canonical fallback repairs the cache tiers on the way out.
    /// Encrypted fields stay sealed; see `read_decrypted`.
    pub async fn read(&self, id: &NodeId) -> ArmatureResult<Node> {
        if self.schema.time_series {
            return self.read_canonical(id).await;
        }
        if let Some(node) = self.deps.local.get(&self.schema.table, id) {
            return Ok(node);
        }

        if let Some(prefix) = &self.schema.cache_prefix {
            match self.deps.cache.get(prefix, id).await {
                Ok(Some(blob)) => {
                    if let Some(node) = node_from_value(&blob) {
                        self.deps.local.put(&self.schema.table, &node);
                        return Ok(node);
                    }
                    tracing::warn!(table = %self.schema.table, id = %id, "cached blob is not a valid node, falling through");
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, table = %self.schema.table, id = %id, "fast cache read failed, falling through");
                }
            }
        } else {
            // Cache tier disabled: the search index serves point reads.
            let query = SearchQuery::new()
                .filter(FieldFilter::Eq("id".to_string(), id.to_value()))
                .limit(1);
            match self.deps.index.search(&self.schema.index, &query).await {
                Ok(results) => {
                    if let Some(node) = results.list.first().and_then(Node::from_flat) {
                        self.deps.local.put(&self.schema.table, &node);
                        return Ok(node);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, index = %self.schema.index, id = %id, "index read failed, falling through");
                }
            }
        }

        let node = self.read_canonical(id).await?;
        self.backfill(&node).await;
        Ok(node)
    }

    /// Read with a caller-field projection. Reserved attributes always
    /// survive.
    pub async fn read_projected(&self, id: &NodeId, projection: &[&str]) -> ArmatureResult<Node> {
        Ok(self.read(id).await?.project(projection))
    }

    /// Read and decrypt the schema's encrypted fields in the returned copy.
    /// Storage and cache tiers never see plaintext.
    pub async fn read_decrypted(
        &self,
        id: &NodeId,
        projection: Option<&[&str]>,
    ) -> ArmatureResult<Node> {
        let node = self.read(id).await?;
        let mut node = match projection {
            Some(projection) => node.project(projection),
            None => node,
        };
        if let Some(cipher) = &self.deps.cipher {
            for name in self.schema.encrypted_fields() {
                let sealed = match node.fields.get(name) {
                    Some(Value::String(s)) => s.clone(),
                    _ => continue,
                };
                let plain = cipher.open(&sealed)?;
                node.fields.insert(name.to_string(), plain);
            }
        }
        Ok(node)
    }

    /// Query the search index.
    pub async fn search(&self, query: &SearchQuery) -> ArmatureResult<SearchResults> {
        Ok(self.deps.index.search(&self.schema.index, query).await?)
    }

    async fn read_canonical(&self, id: &NodeId) -> ArmatureResult<Node> {
        let Some(record) = self.deps.store.get(&self.schema.table, id).await? else {
            return Err(StoreError::not_found(self.schema.table.as_str(), id).into());
        };
        Node::from_flat(&record).ok_or_else(|| {
            StoreError::Codec {
                reason: format!("stored row for {id} is not a valid node"),
            }
            .into()
        })
    }

    /// Read-repair after a canonical fallback: refresh the fast cache only
    /// when the canonical content is not older and actually differs, rewrite
    /// the index document, and re-prime the process-local tier.
    async fn backfill(&self, node: &Node) {
        let flat = node.flatten();
        if self.schema.cache_enabled() {
            let candidate = Footprint::of(&flat);
            let stored = stored_footprint(&self.schema, self.deps.cache.as_ref(), &node.id).await;
            if stored.should_apply(&candidate) {
                self.write_cache(&flat, &node.id).await;
            }
        }
        self.write_index(node, &flat).await;
        self.deps.local.put(&self.schema.table, node);
    }

    // ========================================================================
    // WRITE PLUMBING
    // ========================================================================

    async fn allocate_id(&self, id: Option<NodeId>) -> ArmatureResult<NodeId> {
        match self.schema.id_kind {
            IdKind::Caller => id.ok_or_else(|| {
                EngineError::IdRequired {
                    table: self.schema.table.clone(),
                }
                .into()
            }),
            IdKind::Sequence => match id {
                // 0 is the conventional "allocate one for me" id.
                Some(NodeId::Int(0)) | None => Ok(NodeId::Int(
                    self.deps.sequence.next_id(&self.schema.sequence).await?,
                )),
                Some(id) => Ok(id),
            },
        }
    }

    fn require_live(&self, node: &Node, ctx: &OperationContext) -> ArmatureResult<()> {
        if node.is_deleted() {
            return Err(EngineError::InvalidState {
                table: self.schema.table.clone(),
                id: ctx.id.to_string(),
                state: node.state().to_string(),
                operation: ctx.mode.as_str().to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Prepare/create/clone precondition: the target slot must be absent or
    /// hold a deleted/prepared node, unless the schema forces creation.
    /// Returns the prior occupant when there is one.
    async fn require_writable_slot(
        &self,
        ctx: &OperationContext,
    ) -> ArmatureResult<Option<Node>> {
        let Some(record) = self.deps.store.get(&self.schema.table, &ctx.id).await? else {
            return Ok(None);
        };
        let node = Node::from_flat(&record).ok_or_else(|| StoreError::Codec {
            reason: format!("stored row for {} is not a valid node", ctx.id),
        })?;
        if !node.is_deleted() && !self.schema.force_create {
            return Err(EngineError::InvalidState {
                table: self.schema.table.clone(),
                id: ctx.id.to_string(),
                state: node.state().to_string(),
                operation: ctx.mode.as_str().to_string(),
            }
            .into());
        }
        Ok(Some(node))
    }

    /// Value as persisted: sealed ciphertext for encrypted fields when a
    /// cipher is configured, the plain value otherwise.
    fn store_value(&self, name: &str, value: &Value) -> Value {
        let encrypted = self.schema.field(name).map(|f| f.encrypted).unwrap_or(false);
        match (&self.deps.cipher, encrypted) {
            (Some(cipher), true) => Value::from(cipher.seal(value)),
            _ => value.clone(),
        }
    }

    /// Stored value mapped back to its comparable plaintext.
    fn plain_value(&self, name: &str, stored: &Value) -> Value {
        let encrypted = self.schema.field(name).map(|f| f.encrypted).unwrap_or(false);
        if encrypted {
            if let (Some(cipher), Value::String(sealed)) = (&self.deps.cipher, stored) {
                if let Ok(plain) = cipher.open(sealed) {
                    return plain;
                }
            }
        }
        stored.clone()
    }

    /// Shape a draft into fresh node content: recognized fields validated
    /// and sealed, declared defaults filled in.
    fn shape_fresh(
        &self,
        draft: &NodeDraft,
        ctx: &mut OperationContext,
    ) -> ArmatureResult<BTreeMap<String, Value>> {
        let mut fields = BTreeMap::new();
        for (name, value) in &draft.fields {
            if !self.schema.recognizes(name) {
                continue;
            }
            ctx.recognized += 1;
            validate_field_value(name, value)?;
            fields.insert(name.clone(), self.store_value(name, value));
            ctx.changed += 1;
        }
        for (name, default) in self.schema.defaults() {
            if !fields.contains_key(name) {
                fields.insert(name.to_string(), self.store_value(name, default));
            }
        }
        Ok(fields)
    }

    /// Shape a draft into a partial update against a prior node: skip
    /// unrecognized and unchanged fields, reject immutable mutations.
    fn shape_update(
        &self,
        draft: &NodeDraft,
        prior: &Node,
        ctx: &mut OperationContext,
    ) -> ArmatureResult<Record> {
        let mut partial = Record::new();
        for (name, value) in &draft.fields {
            if !self.schema.recognizes(name) {
                continue;
            }
            ctx.recognized += 1;
            validate_field_value(name, value)?;

            let prior_plain = prior
                .fields
                .get(name)
                .map(|stored| self.plain_value(name, stored));
            if prior_plain.as_ref() == Some(value) {
                continue;
            }
            if let Some(def) = self.schema.field(name) {
                if def.immutable && prior.fields.contains_key(name) {
                    return Err(ValidationError::ImmutableField { field: name.clone() }.into());
                }
            }
            partial.insert(name.clone(), self.store_value(name, value));
            ctx.changed += 1;
        }

        if let Some(parent) = &draft.parent {
            if prior.parent.as_ref() != Some(parent) {
                if self.schema.parent_immutable {
                    return Err(ValidationError::ImmutableField {
                        field: "parent".to_string(),
                    }
                    .into());
                }
                partial.insert("parent".to_string(), parent.to_value());
                ctx.changed += 1;
            }
        }
        if let Some(group) = &draft.group {
            if prior.group.as_ref() != Some(group) {
                partial.insert("group".to_string(), group.to_value());
                ctx.changed += 1;
            }
        }
        Ok(partial)
    }

    /// Commit a partial write through the store's conditional update. When
    /// the conditional path fails because the cached prior ran ahead of the
    /// canonical row (and no field deltas are at stake), retry as a full
    /// save of the merged node.
    async fn commit_partial(
        &self,
        prior: &Node,
        partial: Record,
        increments: IncrementSpec,
        ctx: &OperationContext,
    ) -> ArmatureResult<Node> {
        let attempt = self
            .deps
            .store
            .conditional_update(
                &self.schema.table,
                &ctx.id,
                partial.clone(),
                Some(increments.clone()),
            )
            .await;
        match attempt {
            Ok(record) => Node::from_flat(&record).ok_or_else(|| {
                StoreError::Codec {
                    reason: format!("stored row for {} is not a valid node", ctx.id),
                }
                .into()
            }),
            Err(e)
                if increments.deltas.is_empty()
                    && matches!(
                        e,
                        StoreError::NotFound { .. } | StoreError::StaleAttribute { .. }
                    ) =>
            {
                tracing::warn!(
                    error = %e,
                    table = %self.schema.table,
                    id = %ctx.id,
                    "conditional update failed, retrying as a full save"
                );
                let mut node = prior.clone();
                apply_partial(&mut node, &partial);
                if increments.bump_revision {
                    node.revision += 1;
                }
                self.deps
                    .store
                    .put(&self.schema.table, &ctx.id, node.flatten())
                    .await?;
                Ok(node)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort propagation after a canonical write: fast cache (blob
    /// plus footprint keys), search index, process-local cache. Failures
    /// are logged, never raised; the reconciler converges them later.
    async fn fan_out(&self, node: &Node) {
        let flat = node.flatten();
        if self.schema.cache_enabled() {
            self.write_cache(&flat, &node.id).await;
        }
        if !self.schema.time_series {
            self.deps.local.put(&self.schema.table, node);
        }
        self.write_index(node, &flat).await;
    }

    async fn write_index(&self, node: &Node, flat: &Record) {
        let doc = match self.schema.index_projection() {
            Some(projection) => node.project(&projection).flatten(),
            None => flat.clone(),
        };
        if let Err(e) = self
            .deps
            .index
            .index_document(&self.schema.index, &node.id, doc)
            .await
        {
            tracing::warn!(error = %e, index = %self.schema.index, id = %node.id, "index write failed");
        }
    }

    async fn write_cache(&self, flat: &Record, id: &NodeId) {
        let Some(keys) = self.schema.cache_keys() else {
            return;
        };
        let footprint = Footprint::of(flat);
        let values = vec![
            record_value(flat),
            Value::from(footprint.updated_at),
            Value::from(footprint.hash),
        ];
        if let Err(e) = self.deps.cache.put(&keys, id, values).await {
            tracing::warn!(error = %e, table = %self.schema.table, id = %id, "cache write failed");
        }
    }

    async fn purge_tiers(&self, id: &NodeId) {
        if let Some(keys) = self.schema.cache_keys() {
            for prefix in &keys {
                if let Err(e) = self.deps.cache.delete(prefix, id).await {
                    tracing::warn!(error = %e, prefix = %prefix, id = %id, "cache purge failed");
                }
            }
        }
        if let Err(e) = self
            .deps
            .index
            .delete_document(&self.schema.index, id)
            .await
        {
            tracing::warn!(error = %e, index = %self.schema.index, id = %id, "index purge failed");
        }
        self.deps.local.purge(&self.schema.table, id);
    }

    async fn notify_record(&self, mode: &str, node: &Node, ctx: &OperationContext) {
        let payload = record_value(&node.flatten());
        if let Err(e) = self
            .deps
            .bus
            .notify(&format!("record:{mode}"), payload, ctx.notifier())
            .await
        {
            tracing::warn!(error = %e, table = %self.schema.table, id = %node.id, "notification failed");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use armature_core::{ArmatureError, FieldDef, LifecycleState};
    use armature_notify::{NotifyEvent, Subscriber};
    use armature_store::{
        MemoryFastCache, MemoryIdSequence, MemoryRecordStore, MemorySearchIndex,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<NotifyEvent>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn topics(&self) -> Vec<String> {
            self.seen.lock().unwrap().iter().map(|e| e.id.clone()).collect()
        }
    }

    #[async_trait::async_trait]
    impl Subscriber for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn handle(&self, event: &NotifyEvent) -> ArmatureResult<()> {
            self.seen.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn ticking_clock() -> Clock {
        let tick = Arc::new(AtomicI64::new(1_700_000_000_000));
        Arc::new(move || tick.fetch_add(1_000, Ordering::SeqCst))
    }

    struct Rig {
        engine: NodeEngine,
        store: Arc<MemoryRecordStore>,
        cache: Arc<MemoryFastCache>,
        index: Arc<MemorySearchIndex>,
        local: Arc<ProcessCache>,
        recorder: Arc<Recorder>,
    }

    async fn rig(schema: Schema) -> Rig {
        let store = Arc::new(MemoryRecordStore::new());
        let cache = Arc::new(MemoryFastCache::new());
        let index = Arc::new(MemorySearchIndex::new());
        let local = Arc::new(ProcessCache::default());
        let bus = Arc::new(NotifyBus::new(&schema.table));
        let recorder = Recorder::new();
        bus.subscribe("record:*", recorder.clone()).unwrap();
        // The wildcard covers the three core modes only.
        bus.subscribe("record:prepare", recorder.clone()).unwrap();
        bus.subscribe("record:destroy", recorder.clone()).unwrap();
        bus.finish_registration();

        let deps = EngineDeps {
            store: store.clone(),
            cache: cache.clone(),
            index: index.clone(),
            sequence: Arc::new(MemoryIdSequence::new()),
            bus,
            local: local.clone(),
            cipher: Some(FieldCipher::new(b"engine-test-secret")),
        };
        let engine = NodeEngine::new(schema, deps).with_clock(ticking_clock());
        engine.initialize().await.unwrap();
        Rig {
            engine,
            store,
            cache,
            index,
            local,
            recorder,
        }
    }

    fn user_schema() -> Schema {
        Schema::new("user")
    }

    #[tokio::test]
    async fn test_prepare_reserves_id() {
        let rig = rig(user_schema()).await;
        let out = rig
            .engine
            .prepare(None, &NodeDraft::new().with_field("name", "a"))
            .await
            .unwrap();

        assert_eq!(out.node.id, NodeId::Int(1));
        assert_eq!(out.node.state(), LifecycleState::Prepared);
        assert_eq!(out.node.created_at, 0);
        assert_ne!(out.node.updated_at, 0);
        assert_eq!(out.node.updated_at, out.node.deleted_at);
        assert_eq!(rig.recorder.topics(), vec!["user:record:prepare"]);
    }

    #[tokio::test]
    async fn test_prepare_zero_id_allocates() {
        let rig = rig(user_schema()).await;
        let out = rig
            .engine
            .prepare(Some(NodeId::Int(0)), &NodeDraft::new())
            .await
            .unwrap();
        assert_eq!(out.node.id, NodeId::Int(1));
    }

    #[tokio::test]
    async fn test_create_fresh_node() {
        let rig = rig(user_schema().with_version(3)).await;
        let out = rig
            .engine
            .create(None, &NodeDraft::new().with_field("name", "a"))
            .await
            .unwrap();

        assert_eq!(out.node.state(), LifecycleState::Created);
        assert_eq!(out.node.created_at, out.node.updated_at);
        assert_eq!(out.node.deleted_at, 0);
        assert_eq!(out.node.version, 3);
        assert_eq!(out.node.revision, 1);
        assert_eq!(out.recognized, 1);
        assert_eq!(out.changed, 1);
    }

    #[tokio::test]
    async fn test_create_over_live_node_rejected() {
        let rig = rig(user_schema()).await;
        let out = rig.engine.create(None, &NodeDraft::new()).await.unwrap();

        let retry = rig.engine.create(Some(out.node.id.clone()), &NodeDraft::new()).await;
        assert!(matches!(
            retry,
            Err(ArmatureError::Engine(EngineError::InvalidState { .. }))
        ));

        // Prepare over the same live slot is rejected too.
        let prepare = rig.engine.prepare(Some(out.node.id), &NodeDraft::new()).await;
        assert!(matches!(
            prepare,
            Err(ArmatureError::Engine(EngineError::InvalidState { .. }))
        ));
    }

    #[tokio::test]
    async fn test_force_create_overwrites_live_node() {
        let rig = rig(user_schema().with_force_create()).await;
        let first = rig.engine.create(None, &NodeDraft::new()).await.unwrap();
        let second = rig
            .engine
            .create(Some(first.node.id), &NodeDraft::new().with_field("name", "b"))
            .await
            .unwrap();
        assert_eq!(second.node.revision, 2);
        assert_eq!(second.node.fields.get("name"), Some(&json!("b")));
    }

    #[tokio::test]
    async fn test_create_resurrects_deleted_node() {
        let rig = rig(user_schema()).await;
        let out = rig.engine.create(None, &NodeDraft::new()).await.unwrap();
        let id = out.node.id.clone();
        let deleted = rig.engine.delete(&id).await.unwrap();

        let revived = rig
            .engine
            .create(Some(id), &NodeDraft::new().with_field("name", "again"))
            .await
            .unwrap();
        assert_eq!(revived.node.state(), LifecycleState::Created);
        assert_eq!(revived.node.deleted_at, 0);
        assert_eq!(revived.node.revision, deleted.node.revision + 1);
    }

    #[tokio::test]
    async fn test_caller_id_schema_requires_id() {
        let rig = rig(user_schema().with_id_kind(IdKind::Caller)).await;
        let missing = rig.engine.create(None, &NodeDraft::new()).await;
        assert!(matches!(
            missing,
            Err(ArmatureError::Engine(EngineError::IdRequired { .. }))
        ));

        let out = rig
            .engine
            .create(Some(NodeId::from("alpha")), &NodeDraft::new())
            .await
            .unwrap();
        assert_eq!(out.node.id, NodeId::from("alpha"));
    }

    #[tokio::test]
    async fn test_update_mutates_and_bumps_revision() {
        let rig = rig(user_schema()).await;
        let out = rig
            .engine
            .create(None, &NodeDraft::new().with_field("name", "a"))
            .await
            .unwrap();

        let updated = rig
            .engine
            .update(&out.node.id, &NodeDraft::new().with_field("name", "b"))
            .await
            .unwrap();
        assert_eq!(updated.node.state(), LifecycleState::Updated);
        assert!(updated.node.updated_at > updated.node.created_at);
        assert_eq!(updated.node.revision, 2);
        assert_eq!(updated.node.fields.get("name"), Some(&json!("b")));
        assert_eq!(
            rig.recorder.topics(),
            vec!["user:record:create", "user:record:update"]
        );
    }

    #[tokio::test]
    async fn test_update_noop_suppressed() {
        let rig = rig(user_schema()).await;
        let out = rig
            .engine
            .create(None, &NodeDraft::new().with_field("name", "a"))
            .await
            .unwrap();

        let noop = rig
            .engine
            .update(&out.node.id, &NodeDraft::new().with_field("name", "a"))
            .await
            .unwrap();
        assert_eq!(noop.recognized, 1);
        assert_eq!(noop.changed, 0);
        assert_eq!(noop.node.revision, 1);
        // Only the create was published.
        assert_eq!(rig.recorder.topics(), vec!["user:record:create"]);
    }

    #[tokio::test]
    async fn test_update_skips_unrecognized_fields() {
        let schema = user_schema().with_fields(vec![FieldDef::new("name")]);
        let rig = rig(schema).await;
        let out = rig
            .engine
            .create(None, &NodeDraft::new().with_field("name", "a"))
            .await
            .unwrap();

        let noop = rig
            .engine
            .update(&out.node.id, &NodeDraft::new().with_field("unlisted", "x"))
            .await
            .unwrap();
        assert_eq!(noop.recognized, 0);
        assert_eq!(noop.changed, 0);
        assert!(!noop.node.fields.contains_key("unlisted"));
    }

    #[tokio::test]
    async fn test_update_deleted_node_rejected() {
        let rig = rig(user_schema()).await;
        let out = rig.engine.create(None, &NodeDraft::new()).await.unwrap();
        rig.engine.delete(&out.node.id).await.unwrap();

        let result = rig
            .engine
            .update(&out.node.id, &NodeDraft::new().with_field("name", "b"))
            .await;
        assert!(matches!(
            result,
            Err(ArmatureError::Engine(EngineError::InvalidState { .. }))
        ));
    }

    #[tokio::test]
    async fn test_immutable_field_rejected_on_change() {
        let schema =
            user_schema().with_fields(vec![FieldDef::new("name"), FieldDef::new("handle").immutable()]);
        let rig = rig(schema).await;
        let out = rig
            .engine
            .create(None, &NodeDraft::new().with_field("handle", "h1"))
            .await
            .unwrap();

        let change = rig
            .engine
            .update(&out.node.id, &NodeDraft::new().with_field("handle", "h2"))
            .await;
        assert!(matches!(
            change,
            Err(ArmatureError::Validation(ValidationError::ImmutableField { .. }))
        ));

        // Re-sending the same value is a harmless no-op.
        let same = rig
            .engine
            .update(&out.node.id, &NodeDraft::new().with_field("handle", "h1"))
            .await
            .unwrap();
        assert_eq!(same.changed, 0);
    }

    #[tokio::test]
    async fn test_parent_is_immutable_by_default() {
        let rig = rig(user_schema()).await;
        let out = rig
            .engine
            .create(None, &NodeDraft::new().with_parent(NodeId::Int(10)))
            .await
            .unwrap();

        let result = rig
            .engine
            .update(&out.node.id, &NodeDraft::new().with_parent(NodeId::Int(11)))
            .await;
        assert!(matches!(
            result,
            Err(ArmatureError::Validation(ValidationError::ImmutableField { .. }))
        ));
    }

    #[tokio::test]
    async fn test_nested_object_field_rejected() {
        let rig = rig(user_schema()).await;
        let result = rig
            .engine
            .create(None, &NodeDraft::new().with_field("blob", json!({"a": 1})))
            .await;
        assert!(matches!(
            result,
            Err(ArmatureError::Validation(ValidationError::InvalidDataType { .. }))
        ));
    }

    #[tokio::test]
    async fn test_defaults_applied_on_create() {
        let schema = user_schema().with_fields(vec![
            FieldDef::new("name"),
            FieldDef::new("bio").with_default(json!("")),
        ]);
        let rig = rig(schema).await;
        let out = rig
            .engine
            .create(None, &NodeDraft::new().with_field("name", "a"))
            .await
            .unwrap();
        assert_eq!(out.node.fields.get("bio"), Some(&json!("")));
    }

    #[tokio::test]
    async fn test_increment_applies_deltas() {
        let rig = rig(user_schema()).await;
        let out = rig
            .engine
            .create(None, &NodeDraft::new().with_field("count", 10))
            .await
            .unwrap();

        let deltas: BTreeMap<String, i64> = [("count".to_string(), 4)].into_iter().collect();
        let bumped = rig.engine.increment(&out.node.id, &deltas).await.unwrap();
        assert_eq!(bumped.node.fields.get("count"), Some(&json!(14)));
        assert_eq!(bumped.node.revision, 2);
        assert_eq!(
            rig.recorder.topics(),
            vec!["user:record:create", "user:record:update"]
        );
    }

    #[tokio::test]
    async fn test_increment_missing_attribute_is_stale() {
        let rig = rig(user_schema()).await;
        let out = rig.engine.create(None, &NodeDraft::new()).await.unwrap();

        let deltas: BTreeMap<String, i64> = [("count".to_string(), 1)].into_iter().collect();
        let result = rig.engine.increment(&out.node.id, &deltas).await;
        assert!(matches!(
            result,
            Err(ArmatureError::Store(StoreError::StaleAttribute { .. }))
        ));
    }

    #[tokio::test]
    async fn test_increment_zero_deltas_suppressed() {
        let rig = rig(user_schema()).await;
        let out = rig
            .engine
            .create(None, &NodeDraft::new().with_field("count", 1))
            .await
            .unwrap();

        let deltas: BTreeMap<String, i64> = [("count".to_string(), 0)].into_iter().collect();
        let noop = rig.engine.increment(&out.node.id, &deltas).await.unwrap();
        assert_eq!(noop.changed, 0);
        assert_eq!(noop.node.revision, 1);
        assert_eq!(rig.recorder.topics(), vec!["user:record:create"]);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let rig = rig(user_schema()).await;
        let out = rig.engine.create(None, &NodeDraft::new()).await.unwrap();
        let id = out.node.id.clone();

        let first = rig.engine.delete(&id).await.unwrap();
        assert_eq!(first.node.state(), LifecycleState::Deleted);
        assert_eq!(first.changed, 1);

        let second = rig.engine.delete(&id).await.unwrap();
        assert_eq!(second.changed, 0);
        assert_eq!(second.node.deleted_at, first.node.deleted_at);
        // One create, one delete; the repeat published nothing.
        assert_eq!(
            rig.recorder.topics(),
            vec!["user:record:create", "user:record:delete"]
        );
    }

    #[tokio::test]
    async fn test_destroy_purges_every_tier() {
        let rig = rig(user_schema()).await;
        let out = rig
            .engine
            .create(None, &NodeDraft::new().with_field("name", "a"))
            .await
            .unwrap();
        let id = out.node.id.clone();

        let destroyed = rig.engine.destroy(&id).await.unwrap();
        assert_eq!(destroyed.node.fields.get("name"), Some(&json!("a")));

        assert_eq!(rig.store.get("user", &id).await.unwrap(), None);
        assert_eq!(rig.cache.get("user", &id).await.unwrap(), None);
        assert_eq!(rig.cache.get("user/HASH", &id).await.unwrap(), None);
        assert_eq!(rig.index.doc_count("user").await, 0);
        assert!(rig.engine.read(&id).await.unwrap_err().is_not_found());
        assert_eq!(
            rig.recorder.topics(),
            vec!["user:record:create", "user:record:destroy"]
        );

        let again = rig.engine.destroy(&id).await;
        assert!(matches!(again, Err(e) if e.is_not_found()));
    }

    #[tokio::test]
    async fn test_clone_copies_fields_and_records_origin() {
        let rig = rig(user_schema()).await;
        let source = rig
            .engine
            .create(
                None,
                &NodeDraft::new()
                    .with_field("name", "a")
                    .with_parent(NodeId::Int(42)),
            )
            .await
            .unwrap();

        let copy = rig
            .engine
            .clone_node(&source.node.id, None, None)
            .await
            .unwrap();
        assert_ne!(copy.node.id, source.node.id);
        assert_eq!(copy.node.cloned, Some(source.node.id.clone()));
        // Without an override the copy parents to its source, not to the
        // source's own parent.
        assert_eq!(copy.node.parent, Some(source.node.id.clone()));
        assert_eq!(copy.node.fields, source.node.fields);
        assert_eq!(copy.node.state(), LifecycleState::Created);
        assert_eq!(
            rig.recorder.topics(),
            vec!["user:record:create", "user:record:create"]
        );
    }

    #[tokio::test]
    async fn test_clone_parent_override() {
        let rig = rig(user_schema()).await;
        let source = rig
            .engine
            .create(None, &NodeDraft::new().with_parent(NodeId::Int(42)))
            .await
            .unwrap();

        let copy = rig
            .engine
            .clone_node(&source.node.id, None, Some(NodeId::Int(7)))
            .await
            .unwrap();
        assert_eq!(copy.node.parent, Some(NodeId::Int(7)));
    }

    #[tokio::test]
    async fn test_clone_disabled_schema_rejected() {
        let rig = rig(user_schema().not_clonable()).await;
        let out = rig.engine.create(None, &NodeDraft::new()).await.unwrap();
        let result = rig.engine.clone_node(&out.node.id, None, None).await;
        assert!(matches!(
            result,
            Err(ArmatureError::Engine(EngineError::CloneDisabled { .. }))
        ));
    }

    #[tokio::test]
    async fn test_clone_deleted_source_rejected() {
        let rig = rig(user_schema()).await;
        let out = rig.engine.create(None, &NodeDraft::new()).await.unwrap();
        rig.engine.delete(&out.node.id).await.unwrap();
        let result = rig.engine.clone_node(&out.node.id, None, None).await;
        assert!(matches!(
            result,
            Err(ArmatureError::Engine(EngineError::InvalidState { .. }))
        ));
    }

    #[tokio::test]
    async fn test_encrypted_field_sealed_at_rest() {
        let schema = user_schema().with_fields(vec![
            FieldDef::new("name"),
            FieldDef::new("email").encrypted(),
        ]);
        let rig = rig(schema).await;
        let out = rig
            .engine
            .create(None, &NodeDraft::new().with_field("email", "a@b.c"))
            .await
            .unwrap();
        let id = out.node.id.clone();

        // Ciphertext everywhere: canonical row, plain read.
        let row = rig.store.get("user", &id).await.unwrap().unwrap();
        assert_ne!(row.get("email"), Some(&json!("a@b.c")));
        assert!(matches!(row.get("email"), Some(Value::String(_))));

        let plain_read = rig.engine.read(&id).await.unwrap();
        assert_ne!(plain_read.fields.get("email"), Some(&json!("a@b.c")));

        let decrypted = rig.engine.read_decrypted(&id, None).await.unwrap();
        assert_eq!(decrypted.fields.get("email"), Some(&json!("a@b.c")));
    }

    #[tokio::test]
    async fn test_encrypted_noop_update_suppressed() {
        let schema = user_schema().with_fields(vec![FieldDef::new("email").encrypted()]);
        let rig = rig(schema).await;
        let out = rig
            .engine
            .create(None, &NodeDraft::new().with_field("email", "a@b.c"))
            .await
            .unwrap();

        // Same plaintext compares equal even though ciphertexts differ.
        let noop = rig
            .engine
            .update(&out.node.id, &NodeDraft::new().with_field("email", "a@b.c"))
            .await
            .unwrap();
        assert_eq!(noop.changed, 0);
    }

    #[tokio::test]
    async fn test_read_projection_keeps_reserved() {
        let rig = rig(user_schema()).await;
        let out = rig
            .engine
            .create(
                None,
                &NodeDraft::new().with_field("name", "a").with_field("bio", "b"),
            )
            .await
            .unwrap();

        let projected = rig
            .engine
            .read_projected(&out.node.id, &["name"])
            .await
            .unwrap();
        assert!(projected.fields.contains_key("name"));
        assert!(!projected.fields.contains_key("bio"));
        assert_eq!(projected.revision, 1);
    }

    #[tokio::test]
    async fn test_canonical_fallback_repairs_cache() {
        let rig = rig(user_schema()).await;
        let out = rig
            .engine
            .create(None, &NodeDraft::new().with_field("name", "a"))
            .await
            .unwrap();
        let id = out.node.id.clone();

        // Wipe the warm tiers; the canonical row is all that is left.
        rig.local.clear();
        for prefix in ["user", "user/UPDATED", "user/HASH"] {
            rig.cache.delete(prefix, &id).await.unwrap();
        }
        rig.index.delete_document("user", &id).await.unwrap();
        assert_eq!(rig.index.doc_count("user").await, 0);

        let node = rig.engine.read(&id).await.unwrap();
        assert_eq!(node.fields.get("name"), Some(&json!("a")));

        // Read-repair restored the blob and both footprint keys.
        assert!(rig.cache.get("user", &id).await.unwrap().is_some());
        assert!(rig.cache.get("user/UPDATED", &id).await.unwrap().is_some());
        assert!(rig.cache.get("user/HASH", &id).await.unwrap().is_some());
        // The index document came back too.
        assert_eq!(rig.index.doc_count("user").await, 1);
        // And the process-local tier now serves the follow-up read.
        assert!(rig.local.get("user", &id).is_some());
    }

    #[tokio::test]
    async fn test_cache_disabled_schema_reads_via_index() {
        let rig = rig(user_schema().without_cache()).await;
        let out = rig
            .engine
            .create(None, &NodeDraft::new().with_field("name", "a"))
            .await
            .unwrap();
        let id = out.node.id.clone();

        // Remove the canonical row and the local copy; the index copy
        // must still answer.
        rig.store.delete("user", &id).await.unwrap();
        rig.local.clear();
        let node = rig.engine.read(&id).await.unwrap();
        assert_eq!(node.fields.get("name"), Some(&json!("a")));
        // Nothing was written to the fast cache for this schema.
        assert!(rig.cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_cache_disabled_schema_still_uses_local_tier() {
        let rig = rig(user_schema().without_cache()).await;
        let out = rig
            .engine
            .create(None, &NodeDraft::new().with_field("name", "a"))
            .await
            .unwrap();
        let id = out.node.id.clone();

        // The write primed the process-local tier even without a fast cache.
        assert!(rig.local.get("user", &id).is_some());

        // With every remote tier gone, the local copy still answers.
        rig.store.delete("user", &id).await.unwrap();
        rig.index.delete_document("user", &id).await.unwrap();
        let node = rig.engine.read(&id).await.unwrap();
        assert_eq!(node.fields.get("name"), Some(&json!("a")));

        // Once the local copy is gone the read falls through and fails.
        rig.local.clear();
        assert!(rig.engine.read(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_time_series_schema_bypasses_cache_tiers() {
        let rig = rig(user_schema().time_series()).await;
        let out = rig
            .engine
            .create(None, &NodeDraft::new().with_field("value", 1))
            .await
            .unwrap();
        let id = out.node.id.clone();

        assert!(rig.cache.is_empty().await);
        assert!(rig.local.is_empty());

        let node = rig.engine.read(&id).await.unwrap();
        assert_eq!(node.fields.get("value"), Some(&json!(1)));
        // Reads never warm the cache tiers either.
        assert!(rig.cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_search_delegates_to_index() {
        let rig = rig(user_schema()).await;
        for name in ["alice", "bob"] {
            rig.engine
                .create(None, &NodeDraft::new().with_field("name", name))
                .await
                .unwrap();
        }

        let results = rig
            .engine
            .search(&SearchQuery::new().filter(FieldFilter::Eq("name".to_string(), json!("bob"))))
            .await
            .unwrap();
        assert_eq!(results.total, 1);
    }

    #[tokio::test]
    async fn test_index_projection_limits_document() {
        let schema = user_schema().with_fields(vec![
            FieldDef::new("name"),
            FieldDef::new("secret").not_indexed(),
        ]);
        let rig = rig(schema).await;
        rig.engine
            .create(
                None,
                &NodeDraft::new().with_field("name", "a").with_field("secret", "s"),
            )
            .await
            .unwrap();

        let results = rig.engine.search(&SearchQuery::new()).await.unwrap();
        assert_eq!(results.list[0].get("name"), Some(&json!("a")));
        assert!(!results.list[0].contains_key("secret"));
    }

    #[tokio::test]
    async fn test_initialize_and_terminate_are_idempotent() {
        let rig = rig(user_schema()).await;
        // rig() already initialized once.
        rig.engine.initialize().await.unwrap();
        rig.engine.terminate().await.unwrap();
        rig.engine.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_lifecycle_scenario() {
        let rig = rig(user_schema()).await;

        let prepared = rig
            .engine
            .prepare(Some(NodeId::Int(0)), &NodeDraft::new())
            .await
            .unwrap();
        let id = prepared.node.id.clone();
        assert_eq!(prepared.node.state(), LifecycleState::Prepared);

        let created = rig
            .engine
            .create(Some(id.clone()), &NodeDraft::new().with_field("name", "a"))
            .await
            .unwrap();
        assert_eq!(created.node.state(), LifecycleState::Created);

        let updated = rig
            .engine
            .update(&id, &NodeDraft::new().with_field("name", "b"))
            .await
            .unwrap();
        assert_eq!(updated.node.state(), LifecycleState::Updated);
        assert!(updated.node.updated_at > updated.node.created_at);

        let deleted = rig.engine.delete(&id).await.unwrap();
        assert_eq!(deleted.node.state(), LifecycleState::Deleted);

        // Cold read straight from the canonical store.
        rig.local.clear();
        for prefix in ["user", "user/UPDATED", "user/HASH"] {
            rig.cache.delete(prefix, &id).await.unwrap();
        }
        let cold = rig.engine.read(&id).await.unwrap();
        assert_eq!(cold.state(), LifecycleState::Deleted);
        assert_eq!(cold.fields.get("name"), Some(&json!("b")));
        assert_eq!(cold.revision, deleted.node.revision);

        assert_eq!(
            rig.recorder.topics(),
            vec![
                "user:record:prepare",
                "user:record:create",
                "user:record:update",
                "user:record:delete",
            ]
        );
    }
}
