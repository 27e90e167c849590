//! Wire and persisted JSON shapes for ortrack.
//!
//! This crate is shared by the engine, the SQLite store and the CLI so the
//! bucket format cannot drift between writers and readers. Field names here
//! are consumed by existing API layers (`used_items`, `missing_items`,
//! `extra_items`, `available_items`, each `{instruments: {..}, trays: {..}}`)
//! and must stay stable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};

pub const MAX_EPC_LEN: usize = 128;

// ═══════════════════════════════════════════════════════════════════════════════
// Envelope
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::error_with_info(ErrorInfo::new(code, message))
    }

    pub fn error_with_info(error: ErrorInfo) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// States
// ═══════════════════════════════════════════════════════════════════════════════

/// Inventory item family. Serialized as `"Instrument"` / `"Tray"` in tab rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ItemKind {
    Instrument,
    Tray,
}

impl ItemKind {
    pub const ALL: [ItemKind; 2] = [ItemKind::Instrument, ItemKind::Tray];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Instrument => "instrument",
            ItemKind::Tray => "tray",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "instrument" => Some(ItemKind::Instrument),
            "tray" => Some(ItemKind::Tray),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationState {
    Valid,
    Incomplete,
    Invalid,
}

impl VerificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationState::Valid => "valid",
            VerificationState::Incomplete => "incomplete",
            VerificationState::Invalid => "invalid",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "valid" => Some(VerificationState::Valid),
            "incomplete" => Some(VerificationState::Incomplete),
            "invalid" => Some(VerificationState::Invalid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Scheduled,
    InProgress,
    Completed,
    Verified,
    OutboundCleared,
    Cancelled,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Scheduled => "scheduled",
            OperationState::InProgress => "in_progress",
            OperationState::Completed => "completed",
            OperationState::Verified => "verified",
            OperationState::OutboundCleared => "outbound_cleared",
            OperationState::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(OperationState::Scheduled),
            "in_progress" => Some(OperationState::InProgress),
            "completed" => Some(OperationState::Completed),
            "verified" => Some(OperationState::Verified),
            "outbound_cleared" => Some(OperationState::OutboundCleared),
            "cancelled" => Some(OperationState::Cancelled),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Buckets
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-name quantity plus the instance ids backing it.
///
/// Missing entries carry a count only; their `ids` list is always empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemEntry {
    pub quantity: u32,
    #[serde(default)]
    pub ids: Vec<i64>,
}

impl ItemEntry {
    pub fn from_ids(ids: Vec<i64>) -> Self {
        Self {
            quantity: ids.len() as u32,
            ids,
        }
    }

    pub fn count_only(quantity: u32) -> Self {
        Self {
            quantity,
            ids: Vec::new(),
        }
    }
}

/// One of used/missing/extra/available (or outbound remaining/extra).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationBucket {
    #[serde(default)]
    pub instruments: BTreeMap<String, ItemEntry>,
    #[serde(default)]
    pub trays: BTreeMap<String, ItemEntry>,
}

impl ReconciliationBucket {
    pub fn group(&self, kind: ItemKind) -> &BTreeMap<String, ItemEntry> {
        match kind {
            ItemKind::Instrument => &self.instruments,
            ItemKind::Tray => &self.trays,
        }
    }

    pub fn group_mut(&mut self, kind: ItemKind) -> &mut BTreeMap<String, ItemEntry> {
        match kind {
            ItemKind::Instrument => &mut self.instruments,
            ItemKind::Tray => &mut self.trays,
        }
    }

    pub fn insert(&mut self, kind: ItemKind, name: &str, entry: ItemEntry) {
        self.group_mut(kind).insert(name.to_string(), entry);
    }

    pub fn entry(&self, kind: ItemKind, name: &str) -> Option<&ItemEntry> {
        self.group(kind).get(name)
    }

    /// Appends one instance id under `name`, keeping `quantity` in step.
    pub fn push_id(&mut self, kind: ItemKind, name: &str, id: i64) {
        let entry = self.group_mut(kind).entry(name.to_string()).or_default();
        entry.ids.push(id);
        entry.quantity = entry.ids.len() as u32;
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty() && self.trays.is_empty()
    }

    pub fn all_ids(&self, kind: ItemKind) -> BTreeSet<i64> {
        self.group(kind)
            .values()
            .flat_map(|entry| entry.ids.iter().copied())
            .collect()
    }
}

/// Substitute candidates for one missing name, keyed `"instrument:<name>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableMatch {
    pub missing_qty: u32,
    pub available_ids: Vec<i64>,
    pub available_qty: u32,
}

pub type AvailableMatches = BTreeMap<String, AvailableMatch>;

pub fn available_match_key(kind: ItemKind, name: &str) -> String {
    format!("{}:{}", kind.as_str(), name)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scanner payload
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedTag {
    #[serde(default)]
    pub epc: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub reader_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPayload {
    #[serde(default)]
    pub tags: Vec<ScannedTag>,
}

impl ScanPayload {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Distinct, non-blank EPCs in first-detection order.
    pub fn detected_tag_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.tags
            .iter()
            .map(|tag| tag.epc.trim())
            .filter(|epc| !epc.is_empty() && epc.len() <= MAX_EPC_LEN)
            .filter(|epc| seen.insert(epc.to_string()))
            .map(str::to_string)
            .collect()
    }

    /// EPCs longer than `MAX_EPC_LEN`, which `detected_tag_ids` skips.
    pub fn rejected_epcs(&self) -> Vec<&str> {
        self.tags
            .iter()
            .map(|tag| tag.epc.trim())
            .filter(|epc| epc.len() > MAX_EPC_LEN)
            .collect()
    }
}

/// Accepts both `{"tags": [...]}` and a bare `[...]` list; a missing `tags`
/// key is an empty scan.
pub fn parse_scan_payload(value: Value) -> Result<ScanPayload, ErrorInfo> {
    let value = match value {
        Value::Array(items) => serde_json::json!({ "tags": items }),
        Value::Null => return Ok(ScanPayload::empty()),
        other => other,
    };
    if !value.is_object() {
        return Err(ErrorInfo::new(
            "invalid_scan",
            "scan payload must be an object or a list of tags",
        ));
    }
    serde_json::from_value(value)
        .map_err(|err| ErrorInfo::new("invalid_scan", format!("scan payload is invalid: {}", err)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tabs and reports
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabItem {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub quantity: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabGroup {
    pub count: usize,
    pub items: Vec<TabItem>,
}

impl TabGroup {
    pub fn new(items: Vec<TabItem>) -> Self {
        Self {
            count: items.len(),
            items,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tabs {
    pub present: TabGroup,
    pub missing: TabGroup,
    pub extra: TabGroup,
    pub required: TabGroup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub verification_id: i64,
    pub operation_session_id: i64,
    pub state: VerificationState,
    pub tabs: Tabs,
    pub used_items: ReconciliationBucket,
    pub missing_items: ReconciliationBucket,
    pub extra_items: ReconciliationBucket,
    pub available_items: ReconciliationBucket,
    #[serde(default)]
    pub available_matches: AvailableMatches,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundReport {
    pub operation_session_id: i64,
    pub outbound_check_id: i64,
    pub room_cleared: bool,
    pub check_time: DateTime<Utc>,
    pub remaining_items: ReconciliationBucket,
    pub extra_items: ReconciliationBucket,
    pub used_items: ReconciliationBucket,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_by: Option<String>,
    pub session_state: OperationState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_serializes_with_stable_field_names() {
        let mut bucket = ReconciliationBucket::default();
        bucket.insert(ItemKind::Instrument, "Scalpel", ItemEntry::from_ids(vec![1, 2]));

        let value = serde_json::to_value(&bucket).expect("serialize bucket");
        assert_eq!(
            value,
            serde_json::json!({
                "instruments": {"Scalpel": {"quantity": 2, "ids": [1, 2]}},
                "trays": {}
            })
        );
    }

    #[test]
    fn bucket_tolerates_missing_groups() {
        let bucket: ReconciliationBucket =
            serde_json::from_str(r#"{"trays": {"Basic Tray": {"quantity": 1}}}"#).expect("parse");
        assert!(bucket.instruments.is_empty());
        assert_eq!(bucket.trays["Basic Tray"], ItemEntry::count_only(1));
    }

    #[test]
    fn push_id_tracks_quantity() {
        let mut bucket = ReconciliationBucket::default();
        bucket.push_id(ItemKind::Tray, "Basic Tray", 5);
        bucket.push_id(ItemKind::Tray, "Basic Tray", 6);
        assert_eq!(
            bucket.entry(ItemKind::Tray, "Basic Tray"),
            Some(&ItemEntry::from_ids(vec![5, 6]))
        );
        assert_eq!(bucket.all_ids(ItemKind::Tray).len(), 2);
        assert!(bucket.all_ids(ItemKind::Instrument).is_empty());
    }

    #[test]
    fn scan_payload_without_tags_key_is_empty() {
        let payload = parse_scan_payload(serde_json::json!({})).expect("parse");
        assert!(payload.detected_tag_ids().is_empty());
    }

    #[test]
    fn scan_payload_accepts_bare_list() {
        let payload = parse_scan_payload(serde_json::json!([
            {"epc": "E1", "timestamp": "2026-01-01T00:00:00Z"},
            {"epc": "E2"}
        ]))
        .expect("parse");
        assert_eq!(payload.detected_tag_ids(), vec!["E1", "E2"]);
    }

    #[test]
    fn scan_payload_rejects_scalars() {
        assert!(parse_scan_payload(serde_json::json!("E1")).is_err());
    }

    #[test]
    fn detected_tag_ids_dedupes_in_first_seen_order() {
        let payload = ScanPayload {
            tags: vec![
                ScannedTag {
                    epc: "B".to_string(),
                    ..Default::default()
                },
                ScannedTag {
                    epc: " ".to_string(),
                    ..Default::default()
                },
                ScannedTag {
                    epc: "A".to_string(),
                    ..Default::default()
                },
                ScannedTag {
                    epc: "B".to_string(),
                    ..Default::default()
                },
            ],
        };
        assert_eq!(payload.detected_tag_ids(), vec!["B", "A"]);
    }

    #[test]
    fn oversized_epcs_are_rejected_not_detected() {
        let long = "F".repeat(MAX_EPC_LEN + 1);
        let payload = ScanPayload {
            tags: vec![
                ScannedTag {
                    epc: long.clone(),
                    ..Default::default()
                },
                ScannedTag {
                    epc: "E1".to_string(),
                    ..Default::default()
                },
            ],
        };
        assert_eq!(payload.detected_tag_ids(), vec!["E1"]);
        assert_eq!(payload.rejected_epcs(), vec![long.as_str()]);
    }

    #[test]
    fn tab_item_uses_type_field() {
        let item = TabItem {
            name: "Scalpel".to_string(),
            kind: ItemKind::Instrument,
            quantity: 2,
        };
        let value = serde_json::to_value(item).expect("serialize");
        assert_eq!(value["type"], "Instrument");
    }

    #[test]
    fn operation_state_round_trips_through_str() {
        for state in [
            OperationState::Scheduled,
            OperationState::InProgress,
            OperationState::Completed,
            OperationState::Verified,
            OperationState::OutboundCleared,
            OperationState::Cancelled,
        ] {
            assert_eq!(OperationState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(OperationState::from_str("unknown"), None);
    }
}
