//! Per-operation bookkeeping.
//!
//! Every engine call builds one `OperationContext` up front and threads it
//! through shaping, persistence, and notification. The operation name, the
//! frozen timestamp, and the recognized/changed counters all live here so
//! no step re-derives them.

use armature_core::{NodeId, Timestamp};

/// The mutating and reading operations the engine exposes. The name doubles
/// as the notification `notifier` and the `operation` in state errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    Prepare,
    Create,
    Update,
    Increment,
    Delete,
    Destroy,
    Clone,
    Read,
    Search,
}

impl OpMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Create => "create",
            Self::Update => "update",
            Self::Increment => "increment",
            Self::Delete => "delete",
            Self::Destroy => "destroy",
            Self::Clone => "clone",
            Self::Read => "read",
            Self::Search => "search",
        }
    }
}

/// State carried across the steps of a single engine call.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub mode: OpMode,
    pub id: NodeId,
    /// Wall-clock frozen at operation entry; every stamp written by this
    /// operation uses this one value.
    pub now: Timestamp,
    /// Caller identity passed through to subscribers, when known.
    pub principal: Option<String>,
    /// Draft fields this schema recognizes.
    pub recognized: usize,
    /// Recognized fields whose stored value actually differs.
    pub changed: usize,
}

impl OperationContext {
    pub fn new(mode: OpMode, id: NodeId, now: Timestamp) -> Self {
        Self {
            mode,
            id,
            now,
            principal: None,
            recognized: 0,
            changed: 0,
        }
    }

    pub fn with_principal(mut self, principal: &str) -> Self {
        self.principal = Some(principal.to_string());
        self
    }

    /// Name published as the event notifier.
    pub fn notifier(&self) -> &str {
        self.principal.as_deref().unwrap_or(self.mode.as_str())
    }

    /// True when at least one recognized field produced a different stored
    /// value. Mutating operations gate their write and notification on this.
    pub fn dirty(&self) -> bool {
        self.changed > 0
    }
}

// ============================================================================
// TESTS
// ============================================================================
