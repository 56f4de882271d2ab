//! ARMATURE Core - Data Model for the Record-Management Engine
//!
//! Defines the node data model, lifecycle states, schema descriptors,
//! content hashing, field crypto, and the error taxonomy shared by the
//! store adapters and the lifecycle engine.

pub mod crypto;
pub mod error;
pub mod hash;
pub mod node;
pub mod schema;

pub use crypto::{CryptoError, FieldCipher};
pub use error::{
    ArmatureError, ArmatureResult, EngineError, NotifyError, StoreError, ValidationError,
};
pub use hash::{content_hash, Footprint};
pub use node::{
    now_millis, LifecycleState, Node, NodeDraft, NodeId, Timestamp, validate_field_value,
};
pub use schema::{FieldDef, IdKind, Schema};
