//! In-memory collaborators.
//!
//! Used by tests and by embedders that keep their own persistence. All three
//! are thread-safe and recover from lock poisoning instead of panicking.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use ortrack_protocol::{ScanPayload, ScannedTag};

use crate::adapters::{Catalog, ScanError, Scanner, SessionStore};
use crate::config::ReaderConfig;
use crate::error::{Result, TrackError};
use crate::inventory::InventoryIndex;
use crate::lock;
use crate::requirements::RequirementSpec;
use crate::types::{
    Detection, InventoryItem, ItemKind, ItemStatus, OperationSession, OperationState,
    OperationType, OutboundCheck, RfidTag, TagLink, VerificationSession,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Catalog
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct CatalogState {
    index: InventoryIndex,
    tags: BTreeMap<String, RfidTag>,
    operation_types: HashMap<i64, OperationType>,
    status_writes: Vec<(ItemKind, i64, ItemStatus)>,
}

/// Catalog backed by an [`InventoryIndex`]. Tag links are derived from the
/// items' `tag_id` at lookup time, so items and tags can be added in any order.
#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<CatalogState>,
    fail_status_writes: AtomicBool,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(&self, item: InventoryItem) {
        lock(&self.state).index.insert(item);
    }

    /// Registers a tag id. Its link follows whichever items carry it.
    pub fn add_tag(&self, tag_id: &str) {
        lock(&self.state)
            .tags
            .entry(tag_id.to_string())
            .or_insert_with(|| RfidTag::new(tag_id, TagLink::unlinked()));
    }

    pub fn add_operation_type(&self, operation_type: OperationType) {
        lock(&self.state)
            .operation_types
            .insert(operation_type.id, operation_type);
    }

    pub fn item(&self, kind: ItemKind, id: i64) -> Option<InventoryItem> {
        lock(&self.state).index.get(kind, id).cloned()
    }

    pub fn tag(&self, tag_id: &str) -> Option<RfidTag> {
        let state = lock(&self.state);
        state.tags.get(tag_id).map(|tag| linked(&state.index, tag))
    }

    /// Every status write received, in order.
    pub fn status_writes(&self) -> Vec<(ItemKind, i64, ItemStatus)> {
        lock(&self.state).status_writes.clone()
    }

    /// Makes `set_item_status` fail, to exercise best-effort writes.
    pub fn set_fail_status_writes(&self, fail: bool) {
        self.fail_status_writes.store(fail, Ordering::SeqCst);
    }
}

fn linked(index: &InventoryIndex, tag: &RfidTag) -> RfidTag {
    RfidTag {
        link: index.link_for_tag(&tag.tag_id),
        ..tag.clone()
    }
}

impl Catalog for MemoryCatalog {
    fn find_by_tag_ids(&self, tag_ids: &[String]) -> Result<Vec<RfidTag>> {
        let state = lock(&self.state);
        Ok(tag_ids
            .iter()
            .filter_map(|tag_id| state.tags.get(tag_id))
            .map(|tag| linked(&state.index, tag))
            .collect())
    }

    fn get_items(&self, kind: ItemKind, ids: &[i64]) -> Result<Vec<InventoryItem>> {
        let state = lock(&self.state);
        Ok(ids
            .iter()
            .filter_map(|id| state.index.get(kind, *id))
            .cloned()
            .collect())
    }

    fn find_available_by_name(
        &self,
        kind: ItemKind,
        name: &str,
        exclude_ids: &[i64],
    ) -> Result<Vec<InventoryItem>> {
        let state = lock(&self.state);
        Ok(state
            .index
            .available_by_name(kind, name, exclude_ids)
            .into_iter()
            .cloned()
            .collect())
    }

    fn requirement_spec(&self, operation_type_id: i64) -> Result<RequirementSpec> {
        lock(&self.state)
            .operation_types
            .get(&operation_type_id)
            .map(|operation_type| operation_type.requirements.clone())
            .ok_or(TrackError::OperationTypeNotFound(operation_type_id))
    }

    fn set_item_status(&self, kind: ItemKind, id: i64, status: ItemStatus) -> Result<()> {
        if self.fail_status_writes.load(Ordering::SeqCst) {
            return Err(TrackError::storage("updating item status", "writes disabled"));
        }
        let mut state = lock(&self.state);
        if !state.index.set_status(kind, id, status) {
            return Err(TrackError::ItemNotFound { kind, id });
        }
        state.status_writes.push((kind, id, status));
        Ok(())
    }

    fn record_detection(&self, tag_id: &str, detection: &Detection) -> Result<()> {
        let mut state = lock(&self.state);
        let tag = state
            .tags
            .get_mut(tag_id)
            .ok_or_else(|| TrackError::TagNotFound(tag_id.to_string()))?;
        tag.last_detected_by = Some(detection.reader.clone());
        tag.last_detection_time = Some(detection.detected_at);
        if detection.location.is_some() {
            tag.last_known_location = detection.location.clone();
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session Store
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct SessionState {
    operations: HashMap<i64, OperationSession>,
    verifications: HashMap<i64, VerificationSession>,
    outbound_checks: HashMap<i64, Vec<OutboundCheck>>,
}

#[derive(Default)]
pub struct MemorySessionStore {
    state: Mutex<SessionState>,
    next_id: AtomicI64,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&self, session: OperationSession) {
        lock(&self.state).operations.insert(session.id, session);
    }

    pub fn session(&self, id: i64) -> Option<OperationSession> {
        lock(&self.state).operations.get(&id).cloned()
    }

    pub fn outbound_checks(&self, operation_session_id: i64) -> Vec<OutboundCheck> {
        lock(&self.state)
            .outbound_checks
            .get(&operation_session_id)
            .cloned()
            .unwrap_or_default()
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl SessionStore for MemorySessionStore {
    fn operation_session(&self, id: i64) -> Result<OperationSession> {
        self.session(id).ok_or(TrackError::SessionNotFound(id))
    }

    fn set_operation_state(&self, id: i64, state: OperationState) -> Result<()> {
        let mut sessions = lock(&self.state);
        let session = sessions
            .operations
            .get_mut(&id)
            .ok_or(TrackError::SessionNotFound(id))?;
        session.state = state;
        Ok(())
    }

    fn verification_session(
        &self,
        operation_session_id: i64,
    ) -> Result<Option<VerificationSession>> {
        Ok(lock(&self.state)
            .verifications
            .get(&operation_session_id)
            .cloned())
    }

    fn get_or_create_verification_session(
        &self,
        operation: &OperationSession,
    ) -> Result<VerificationSession> {
        if let Some(existing) = self.verification_session(operation.id)? {
            return Ok(existing);
        }
        let session = VerificationSession::new(self.allocate_id(), operation);
        lock(&self.state)
            .verifications
            .insert(operation.id, session.clone());
        Ok(session)
    }

    fn save_verification_session(&self, session: &VerificationSession) -> Result<()> {
        lock(&self.state)
            .verifications
            .insert(session.operation_session_id, session.clone());
        Ok(())
    }

    fn latest_outbound_check(&self, operation_session_id: i64) -> Result<Option<OutboundCheck>> {
        Ok(lock(&self.state)
            .outbound_checks
            .get(&operation_session_id)
            .and_then(|checks| checks.iter().max_by_key(|check| check.check_time))
            .cloned())
    }

    fn get_or_create_outbound_check(
        &self,
        operation_session_id: i64,
        checked_by: Option<&str>,
    ) -> Result<OutboundCheck> {
        if let Some(existing) = self.latest_outbound_check(operation_session_id)? {
            return Ok(existing);
        }
        let check = OutboundCheck::new(
            self.allocate_id(),
            operation_session_id,
            checked_by.map(str::to_string),
        );
        lock(&self.state)
            .outbound_checks
            .entry(operation_session_id)
            .or_default()
            .push(check.clone());
        Ok(check)
    }

    fn save_outbound_check(&self, check: &OutboundCheck) -> Result<()> {
        let mut state = lock(&self.state);
        let checks = state
            .outbound_checks
            .entry(check.operation_session_id)
            .or_default();
        match checks.iter_mut().find(|existing| existing.id == check.id) {
            Some(existing) => *existing = check.clone(),
            None => checks.push(check.clone()),
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scanner
// ═══════════════════════════════════════════════════════════════════════════════

/// Replays queued scan results in order; an exhausted queue scans nothing.
#[derive(Default)]
pub struct ScriptedScanner {
    queue: Mutex<VecDeque<std::result::Result<ScanPayload, ScanError>>>,
    calls: Mutex<Vec<Duration>>,
}

impl ScriptedScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_tags(&self, epcs: &[&str]) {
        let payload = ScanPayload {
            tags: epcs
                .iter()
                .map(|epc| ScannedTag {
                    epc: epc.to_string(),
                    timestamp: Some(Utc::now().to_rfc3339()),
                    reader_id: None,
                })
                .collect(),
        };
        lock(&self.queue).push_back(Ok(payload));
    }

    pub fn push_error(&self, error: ScanError) {
        lock(&self.queue).push_back(Err(error));
    }

    /// Requested duration of every scan so far.
    pub fn calls(&self) -> Vec<Duration> {
        lock(&self.calls).clone()
    }
}

impl Scanner for ScriptedScanner {
    fn scan(
        &self,
        duration: Duration,
        _reader: &ReaderConfig,
    ) -> std::result::Result<ScanPayload, ScanError> {
        lock(&self.calls).push(duration);
        lock(&self.queue)
            .pop_front()
            .unwrap_or_else(|| Ok(ScanPayload::empty()))
    }
}
