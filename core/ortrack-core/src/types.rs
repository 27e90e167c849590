//! Domain records shared by the engine and its collaborators.
//!
//! Bucket and state enums live in `ortrack-protocol` because they are also the
//! persisted/wire format; they are re-exported here for convenience.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use ortrack_protocol::{
    AvailableMatches, ItemEntry, ItemKind, OperationState, ReconciliationBucket,
    VerificationState,
};

use crate::requirements::RequirementSpec;
use crate::verification::ReconciliationState;

// ═══════════════════════════════════════════════════════════════════════════════
// Inventory
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Available,
    InUse,
    Missing,
    UnderSterilization,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Available => "available",
            ItemStatus::InUse => "in_use",
            ItemStatus::Missing => "missing",
            ItemStatus::UnderSterilization => "under_sterilization",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "available" => Some(ItemStatus::Available),
            "in_use" => Some(ItemStatus::InUse),
            "missing" => Some(ItemStatus::Missing),
            "under_sterilization" => Some(ItemStatus::UnderSterilization),
            _ => None,
        }
    }
}

/// An instrument or tray instance. Identity is `(kind, id)`; instruments and
/// trays have independent id spaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: i64,
    pub name: String,
    pub kind: ItemKind,
    pub status: ItemStatus,
    #[serde(default)]
    pub tag_id: Option<String>,
}

impl InventoryItem {
    pub fn key(&self) -> (ItemKind, i64) {
        (self.kind, self.id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tags
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagStatus {
    Active,
    Inactive,
    Maintenance,
}

impl TagStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagStatus::Active => "active",
            TagStatus::Inactive => "inactive",
            TagStatus::Maintenance => "maintenance",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "active" => Some(TagStatus::Active),
            "inactive" => Some(TagStatus::Inactive),
            "maintenance" => Some(TagStatus::Maintenance),
            _ => None,
        }
    }
}

/// What a registered tag points at.
///
/// An instrument owns at most one tag and a tag at most one instrument.
/// Any number of trays may share a tag, including one an instrument carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagLink {
    pub instrument: Option<i64>,
    pub trays: Vec<i64>,
}

impl TagLink {
    pub fn unlinked() -> Self {
        Self::default()
    }

    pub fn for_instrument(id: i64) -> Self {
        Self {
            instrument: Some(id),
            trays: Vec::new(),
        }
    }

    pub fn for_trays(ids: Vec<i64>) -> Self {
        Self {
            instrument: None,
            trays: ids,
        }
    }

    pub fn with_trays(mut self, ids: Vec<i64>) -> Self {
        self.trays = ids;
        self
    }

    pub fn is_unlinked(&self) -> bool {
        self.instrument.is_none() && self.trays.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RfidTag {
    pub tag_id: String,
    pub status: TagStatus,
    pub last_detected_by: Option<String>,
    pub last_detection_time: Option<DateTime<Utc>>,
    pub last_known_location: Option<String>,
    pub link: TagLink,
}

impl RfidTag {
    pub fn new(tag_id: impl Into<String>, link: TagLink) -> Self {
        Self {
            tag_id: tag_id.into(),
            status: TagStatus::Active,
            last_detected_by: None,
            last_detection_time: None,
            last_known_location: None,
            link,
        }
    }
}

/// A single sighting of a tag, written back onto the tag record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub reader: String,
    pub location: Option<String>,
    pub detected_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sessions
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationType {
    pub id: i64,
    pub name: String,
    pub requirements: RequirementSpec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSession {
    pub id: i64,
    pub operation_type_id: i64,
    pub state: OperationState,
    pub scheduled_time: DateTime<Utc>,
    pub room: Option<String>,
}

/// Pre-operative verification record; one per operation session.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationSession {
    pub id: i64,
    pub operation_session_id: i64,
    pub state: VerificationState,
    pub open_until: DateTime<Utc>,
    pub verified_by: Option<String>,
    pub used_items: ReconciliationBucket,
    pub missing_items: ReconciliationBucket,
    pub extra_items: ReconciliationBucket,
    pub available_items: ReconciliationBucket,
    pub available_matches: AvailableMatches,
}

impl VerificationSession {
    /// Fresh record as created on first verification of a session.
    pub fn new(id: i64, operation: &OperationSession) -> Self {
        Self {
            id,
            operation_session_id: operation.id,
            state: VerificationState::Incomplete,
            open_until: operation.scheduled_time,
            verified_by: None,
            used_items: ReconciliationBucket::default(),
            missing_items: ReconciliationBucket::default(),
            extra_items: ReconciliationBucket::default(),
            available_items: ReconciliationBucket::default(),
            available_matches: AvailableMatches::new(),
        }
    }

    pub fn reconciliation(&self) -> ReconciliationState {
        ReconciliationState {
            state: self.state,
            used: self.used_items.clone(),
            missing: self.missing_items.clone(),
            extra: self.extra_items.clone(),
            available: self.available_items.clone(),
            available_matches: self.available_matches.clone(),
        }
    }

    pub fn apply(&mut self, result: ReconciliationState) {
        self.state = result.state;
        self.used_items = result.used;
        self.missing_items = result.missing;
        self.extra_items = result.extra;
        self.available_items = result.available;
        self.available_matches = result.available_matches;
    }
}

/// Post-operative room check; latest by `check_time` wins.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCheck {
    pub id: i64,
    pub operation_session_id: i64,
    pub room_cleared: bool,
    pub remaining_items: ReconciliationBucket,
    pub extra_items: ReconciliationBucket,
    pub check_time: DateTime<Utc>,
    pub checked_by: Option<String>,
}

impl OutboundCheck {
    pub fn new(id: i64, operation_session_id: i64, checked_by: Option<String>) -> Self {
        Self {
            id,
            operation_session_id,
            room_cleared: false,
            remaining_items: ReconciliationBucket::default(),
            extra_items: ReconciliationBucket::default(),
            check_time: Utc::now(),
            checked_by,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_status_round_trips_through_str() {
        for status in [
            ItemStatus::Available,
            ItemStatus::InUse,
            ItemStatus::Missing,
            ItemStatus::UnderSterilization,
        ] {
            assert_eq!(ItemStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn new_verification_session_is_open_until_schedule() {
        let scheduled = Utc::now();
        let operation = OperationSession {
            id: 3,
            operation_type_id: 1,
            state: OperationState::Scheduled,
            scheduled_time: scheduled,
            room: None,
        };
        let session = VerificationSession::new(10, &operation);
        assert_eq!(session.state, VerificationState::Incomplete);
        assert_eq!(session.open_until, scheduled);
        assert!(session.used_items.is_empty());
    }
}
