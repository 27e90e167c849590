//! Collaborator interfaces consumed by the engine.
//!
//! Implementors should:
//! - Return `TrackError` not-found variants for missing sessions/types, never panic
//! - Treat status writes as last-write-wins (no versioning)
//! - Be shareable across threads; the engine holds them behind `Arc`

use std::time::Duration;

use ortrack_protocol::ScanPayload;

use crate::config::ReaderConfig;
use crate::error::Result;
use crate::requirements::RequirementSpec;
use crate::types::{
    Detection, InventoryItem, ItemKind, ItemStatus, OperationSession, OperationState,
    OutboundCheck, RfidTag, VerificationSession,
};

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("reader unavailable: {0}")]
    Unavailable(String),

    #[error("scan transport failed: {0}")]
    Transport(String),

    #[error("scan payload malformed: {0}")]
    Malformed(String),
}

/// Source of detected tag identifiers.
pub trait Scanner: Send + Sync {
    /// Collect tags for up to `duration`. Errors are logged by the engine and
    /// treated as an empty scan.
    fn scan(
        &self,
        duration: Duration,
        reader: &ReaderConfig,
    ) -> std::result::Result<ScanPayload, ScanError>;
}

/// Read access to tags, inventory and requirement manifests, plus the two
/// writes reconciliation performs (item status, tag sightings).
pub trait Catalog: Send + Sync {
    /// Registered tags among `tag_ids`. Unknown ids are simply absent.
    fn find_by_tag_ids(&self, tag_ids: &[String]) -> Result<Vec<RfidTag>>;

    /// Items of `kind` with the given ids. Unknown ids are simply absent.
    fn get_items(&self, kind: ItemKind, ids: &[i64]) -> Result<Vec<InventoryItem>>;

    /// Items named `name` with status `available`, excluding `exclude_ids`.
    fn find_available_by_name(
        &self,
        kind: ItemKind,
        name: &str,
        exclude_ids: &[i64],
    ) -> Result<Vec<InventoryItem>>;

    fn requirement_spec(&self, operation_type_id: i64) -> Result<RequirementSpec>;

    fn set_item_status(&self, kind: ItemKind, id: i64, status: ItemStatus) -> Result<()>;

    fn record_detection(&self, tag_id: &str, detection: &Detection) -> Result<()>;
}

/// Persistence for operation sessions and their verification/outbound records.
pub trait SessionStore: Send + Sync {
    fn operation_session(&self, id: i64) -> Result<OperationSession>;

    fn set_operation_state(&self, id: i64, state: OperationState) -> Result<()>;

    fn verification_session(&self, operation_session_id: i64)
        -> Result<Option<VerificationSession>>;

    fn get_or_create_verification_session(
        &self,
        operation: &OperationSession,
    ) -> Result<VerificationSession>;

    fn save_verification_session(&self, session: &VerificationSession) -> Result<()>;

    /// Most recent check by `check_time`, if any.
    fn latest_outbound_check(&self, operation_session_id: i64) -> Result<Option<OutboundCheck>>;

    /// Latest check, or a new one attributed to `checked_by`.
    fn get_or_create_outbound_check(
        &self,
        operation_session_id: i64,
        checked_by: Option<&str>,
    ) -> Result<OutboundCheck>;

    fn save_outbound_check(&self, check: &OutboundCheck) -> Result<()>;
}
