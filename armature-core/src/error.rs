//! Error types for ARMATURE operations

use thiserror::Error;

/// Store adapter errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Record not found: {table} with id {id}")]
    NotFound { table: String, id: String },

    #[error("Conditional update on {table} referenced missing attribute {attribute}")]
    StaleAttribute { table: String, attribute: String },

    #[error("Resource already exists: {resource}")]
    AlreadyExists { resource: String },

    #[error("Resource already absent: {resource}")]
    AlreadyAbsent { resource: String },

    #[error("Backend error: {reason}")]
    Backend { reason: String },

    #[error("Codec error: {reason}")]
    Codec { reason: String },
}

impl StoreError {
    /// Build a NotFound for a table/id pair.
    pub fn not_found(table: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            table: table.into(),
            id: id.to_string(),
        }
    }

    /// True for the "already exists"/"already absent" class that
    /// initialize/terminate swallow as non-fatal.
    pub fn is_idempotent_noise(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. } | Self::AlreadyAbsent { .. })
    }
}

/// Validation errors raised before any write is attempted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid data-type for field {field}: nested objects are not allowed")]
    InvalidDataType { field: String },

    #[error("Immutable field mutation attempted: {field}")]
    ImmutableField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Lifecycle engine errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Invalid state for {operation} on {table} id {id}: node is {state}")]
    InvalidState {
        table: String,
        id: String,
        state: String,
        operation: String,
    },

    #[error("Cloning is disabled for schema {table}")]
    CloneDisabled { table: String },

    #[error("An id is required for schema {table} with caller-supplied ids")]
    IdRequired { table: String },
}

/// Notify bus errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("Bus {namespace} is sealed; subscribe is only valid during registration")]
    Sealed { namespace: String },

    #[error("Malformed topic: {topic}")]
    BadTopic { topic: String },
}

pub use crate::crypto::CryptoError;

/// Master error type for all ARMATURE errors.
#[derive(Debug, Clone, Error)]
pub enum ArmatureError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Notify error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl ArmatureError {
    /// True when the error is the not-found class (404-equivalent for the
    /// HTTP-layer mapping done by out-of-scope route handlers).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(StoreError::NotFound { .. }))
    }
}

/// Result type alias for ARMATURE operations.
pub type ArmatureResult<T> = Result<T, ArmatureError>;

// =============================================================================
// TESTS
// =============================================================================
