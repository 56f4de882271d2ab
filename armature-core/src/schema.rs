//! Schema descriptors.
//!
//! A schema is the per-entity-type configuration that parameterizes one
//! engine instance: table/index/sequence names, the optional fast-cache key
//! prefix, the id kind, an optional typed field list with per-field flags,
//! and behavioral switches (clone-ability, time-series, forced create).
//!
//! Field shaping is resolved once here, at construction, instead of being
//! re-derived from naming conventions on every call.

use serde_json::Value;

/// How ids for this schema are allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    /// Numeric ids drawn from an external id sequence.
    Sequence,
    /// Non-numeric ids accepted directly from the caller.
    Caller,
}

/// A single typed field definition.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    /// Stored as ciphertext; only `read_decrypted` returns plaintext.
    pub encrypted: bool,
    /// Included in the search-index projection.
    pub indexed: bool,
    /// Rejected when a mutating call tries to change it after creation.
    pub immutable: bool,
    /// Applied by prepare/create when the caller did not supply the field.
    pub default: Option<Value>,
}

impl FieldDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            encrypted: false,
            indexed: true,
            immutable: false,
            default: None,
        }
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    pub fn not_indexed(mut self) -> Self {
        self.indexed = false;
        self
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Per-entity-type configuration for one engine instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    /// Canonical store table name; also the notify namespace.
    pub table: String,
    /// Search index name.
    pub index: String,
    /// Id sequence name (used only with `IdKind::Sequence`).
    pub sequence: String,
    /// Fast-cache key prefix. `None` disables the cache tier; reads then go
    /// through the search index (or the canonical store for time-series).
    pub cache_prefix: Option<String>,
    pub id_kind: IdKind,
    /// Declared field list. `None` means schema-less: every caller field
    /// except underscore-prefixed internal names participates.
    pub fields: Option<Vec<FieldDef>>,
    pub clonable: bool,
    /// Every write is a new point; no cache tier on the read path at all.
    pub time_series: bool,
    /// `parent` may not change after creation.
    pub parent_immutable: bool,
    /// Allow create/prepare over a live (non-deleted) node.
    pub force_create: bool,
    /// Schema version stamped into `V` at creation.
    pub version: u32,
}

impl Schema {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            index: table.to_string(),
            sequence: format!("{table}_id"),
            cache_prefix: Some(table.to_string()),
            id_kind: IdKind::Sequence,
            fields: None,
            clonable: true,
            time_series: false,
            parent_immutable: true,
            force_create: false,
            version: 1,
        }
    }

    pub fn with_index(mut self, index: &str) -> Self {
        self.index = index.to_string();
        self
    }

    pub fn with_sequence(mut self, sequence: &str) -> Self {
        self.sequence = sequence.to_string();
        self
    }

    pub fn with_cache_prefix(mut self, prefix: &str) -> Self {
        self.cache_prefix = Some(prefix.to_string());
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache_prefix = None;
        self
    }

    pub fn with_id_kind(mut self, kind: IdKind) -> Self {
        self.id_kind = kind;
        self
    }

    pub fn with_fields(mut self, fields: Vec<FieldDef>) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn not_clonable(mut self) -> Self {
        self.clonable = false;
        self
    }

    pub fn time_series(mut self) -> Self {
        self.time_series = true;
        self
    }

    pub fn with_force_create(mut self) -> Self {
        self.force_create = true;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Look up a declared field definition by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields
            .as_ref()
            .and_then(|fields| fields.iter().find(|f| f.name == name))
    }

    /// Whether a caller-supplied field participates in this schema.
    /// Reserved bookkeeping names never do.
    pub fn recognizes(&self, name: &str) -> bool {
        if crate::node::RESERVED_FIELDS.contains(&name) {
            return false;
        }
        match &self.fields {
            Some(_) => self.field(name).is_some(),
            None => !name.starts_with('_') && !name.starts_with('$'),
        }
    }

    /// Field names projected into the search index. `None` means the full
    /// flat record is indexed.
    pub fn index_projection(&self) -> Option<Vec<&str>> {
        let fields = self.fields.as_ref()?;
        if fields.iter().all(|f| f.indexed) {
            return None;
        }
        Some(
            fields
                .iter()
                .filter(|f| f.indexed)
                .map(|f| f.name.as_str())
                .collect(),
        )
    }

    /// Names of fields flagged encrypted.
    pub fn encrypted_fields(&self) -> Vec<&str> {
        self.fields
            .as_ref()
            .map(|fields| {
                fields
                    .iter()
                    .filter(|f| f.encrypted)
                    .map(|f| f.name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Declared defaults as (name, value) pairs.
    pub fn defaults(&self) -> Vec<(&str, &Value)> {
        self.fields
            .as_ref()
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|f| f.default.as_ref().map(|d| (f.name.as_str(), d)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_prefix.is_some() && !self.time_series
    }

    /// Fast-cache key prefixes: node blob, footprint timestamp, footprint
    /// hash, in the order `FastCache::put` expects them.
    pub fn cache_keys(&self) -> Option<[String; 3]> {
        let prefix = self.cache_prefix.as_ref()?;
        Some([
            prefix.clone(),
            format!("{prefix}/UPDATED"),
            format!("{prefix}/HASH"),
        ])
    }
}

// ============================================================================
// TESTS
// ============================================================================
