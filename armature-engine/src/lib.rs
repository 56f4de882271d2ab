//! ARMATURE Engine - Node Lifecycle and Multi-Tier Consistency
//!
//! The lifecycle engine drives nodes through prepare/create/update/delete
//! and keeps three storage tiers coherent: the canonical record store (the
//! durability authority), a fast key-value cache with content-hash
//! footprints, and a search index. A change-stream reconciler converges
//! whatever the best-effort write fan-out missed.

pub mod context;
pub mod engine;
pub mod reconciler;

pub use context::{OpMode, OperationContext};
pub use engine::{Clock, EngineDeps, NodeEngine, Outcome};
pub use reconciler::Reconciler;
