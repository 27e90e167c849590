//! Error types for ortrack-core operations.
//!
//! Scan failures are not represented here: scanners report [`ScanError`]
//! (see `adapters`), which the engine logs and folds into an empty scan.
//!
//! [`ScanError`]: crate::adapters::ScanError

use std::path::PathBuf;

use ortrack_protocol::{ErrorInfo, ItemKind, OperationState};

/// Coarse classification used by callers deciding how to surface an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Session, tag, item or type does not exist.
    NotFound,
    /// The request is well formed but the current state forbids it.
    Precondition,
    /// Input data could not be interpreted.
    Invalid,
    /// Persistence or filesystem failure.
    Storage,
}

/// All errors that can occur in ortrack-core operations.
#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    // ─────────────────────────────────────────────────────────────────────
    // Lookup Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Operation session not found: {0}")]
    SessionNotFound(i64),

    #[error("Operation type not found: {0}")]
    OperationTypeNotFound(i64),

    #[error("{} not found: {id}", .kind.as_str())]
    ItemNotFound { kind: ItemKind, id: i64 },

    #[error("RFID tag not found: {0}")]
    TagNotFound(String),

    #[error("No verification session for operation session {0}; verification must run before outbound tracking")]
    VerificationMissing(i64),

    // ─────────────────────────────────────────────────────────────────────
    // Precondition Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Outbound tracking not allowed for operation session in '{}' state; it must be 'completed' or 'verified'", .state.as_str())]
    OutboundNotAllowed { state: OperationState },

    #[error("Invalid operation session transition: {} -> {}", .from.as_str(), .to.as_str())]
    InvalidTransition {
        from: OperationState,
        to: OperationState,
    },

    #[error("Verification session for operation session {0} recorded no used items")]
    NoUsedItems(i64),

    #[error("Verification session for operation session {0} has been invalidated")]
    VerificationInvalidated(i64),

    #[error("Operation session {session_id} is closed ('{}'); no further verification", .state.as_str())]
    SessionClosed {
        session_id: i64,
        state: OperationState,
    },

    #[error("No outbound check has been performed for operation session {0}")]
    NoOutboundCheck(i64),

    #[error("Latest outbound check for operation session {session_id} is {age_secs}s old; perform a new scan")]
    StaleOutboundCheck { session_id: i64, age_secs: i64 },

    #[error("Tag {tag_id} is already linked to instrument {instrument_id}")]
    TagAlreadyLinked { tag_id: String, instrument_id: i64 },

    // ─────────────────────────────────────────────────────────────────────
    // Invalid Input
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid requirement specification: {0}")]
    InvalidRequirement(String),

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Storage Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Storage error: {context}: {details}")]
    Storage { context: String, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl TrackError {
    pub fn storage(context: impl Into<String>, details: impl ToString) -> Self {
        TrackError::Storage {
            context: context.into(),
            details: details.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackError::SessionNotFound(_)
            | TrackError::OperationTypeNotFound(_)
            | TrackError::ItemNotFound { .. }
            | TrackError::TagNotFound(_)
            | TrackError::VerificationMissing(_) => ErrorKind::NotFound,
            TrackError::OutboundNotAllowed { .. }
            | TrackError::InvalidTransition { .. }
            | TrackError::NoUsedItems(_)
            | TrackError::VerificationInvalidated(_)
            | TrackError::SessionClosed { .. }
            | TrackError::NoOutboundCheck(_)
            | TrackError::StaleOutboundCheck { .. }
            | TrackError::TagAlreadyLinked { .. } => ErrorKind::Precondition,
            TrackError::InvalidRequirement(_) | TrackError::ConfigMalformed { .. } => {
                ErrorKind::Invalid
            }
            TrackError::Storage { .. } | TrackError::Io { .. } | TrackError::Json { .. } => {
                ErrorKind::Storage
            }
        }
    }

    /// Stable snake_case code for the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            TrackError::SessionNotFound(_) => "session_not_found",
            TrackError::OperationTypeNotFound(_) => "operation_type_not_found",
            TrackError::ItemNotFound { .. } => "item_not_found",
            TrackError::TagNotFound(_) => "tag_not_found",
            TrackError::VerificationMissing(_) => "verification_missing",
            TrackError::OutboundNotAllowed { .. } => "outbound_not_allowed",
            TrackError::InvalidTransition { .. } => "invalid_transition",
            TrackError::NoUsedItems(_) => "no_used_items",
            TrackError::VerificationInvalidated(_) => "verification_invalidated",
            TrackError::SessionClosed { .. } => "session_closed",
            TrackError::NoOutboundCheck(_) => "no_outbound_check",
            TrackError::StaleOutboundCheck { .. } => "stale_outbound_check",
            TrackError::TagAlreadyLinked { .. } => "tag_already_linked",
            TrackError::InvalidRequirement(_) => "invalid_requirement",
            TrackError::ConfigMalformed { .. } => "config_malformed",
            TrackError::Storage { .. } => "storage_error",
            TrackError::Io { .. } => "io_error",
            TrackError::Json { .. } => "json_error",
        }
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.code(), self.to_string())
    }
}

/// Convenience type alias for Results using TrackError.
pub type Result<T> = std::result::Result<T, TrackError>;
