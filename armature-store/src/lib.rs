//! ARMATURE Store - Adapter Traits and In-Memory Backends
//!
//! Defines the storage abstraction layer the lifecycle engine writes
//! through: the canonical record store, the fast key-value cache, the
//! search index, and the id sequence, plus the typed attribute-value
//! encoding carried by change-stream records and in-process reference
//! implementations of every adapter.

pub mod attr;
pub mod local_cache;
pub mod memory;
pub mod search;
pub mod traits;

pub use attr::{decode_image, encode_record, AttrValue, ChangeKind, ChangeRecord};
pub use local_cache::ProcessCache;
pub use memory::{MemoryFastCache, MemoryIdSequence, MemoryRecordStore, MemorySearchIndex};
pub use search::{FieldFilter, SearchQuery, SearchResults, SortOrder};
pub use traits::{FastCache, IdSequence, IncrementSpec, IndexOptions, Record, RecordStore, SearchIndex};
