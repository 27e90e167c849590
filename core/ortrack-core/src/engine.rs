//! Orchestrates scan → resolve → reconcile → persist for operation sessions.
//!
//! All work on one operation session is serialised through a per-session
//! mutex, so a cumulative verification cannot interleave with another
//! verification or an outbound check of the same session. Different sessions
//! proceed in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use ortrack_protocol::{OutboundReport, VerificationReport};
use tracing::{debug, info, warn};

use crate::adapters::{Catalog, Scanner, SessionStore};
use crate::config::EngineConfig;
use crate::error::{Result, TrackError};
use crate::formatter::{outbound_report, verification_report};
use crate::lifecycle;
use crate::lock;
use crate::outbound;
use crate::resolver::{resolve, Resolution};
use crate::types::{
    Detection, ItemKind, ItemStatus, OperationSession, OperationState, VerificationState,
};
use crate::verification;

const CANCEL_POLL_SLICE: Duration = Duration::from_millis(100);

/// Options for a single verification cycle.
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Carry previously used instances forward instead of starting fresh.
    pub cumulative: bool,
    /// Recorded as `verified_by`.
    pub operator: Option<String>,
    /// Overrides `verification.single_scan_secs`.
    pub scan_duration: Option<Duration>,
}

/// Options for continuous verification. Unset durations come from config.
#[derive(Debug, Clone)]
pub struct ContinuousOptions {
    pub cumulative: bool,
    pub operator: Option<String>,
    pub max_duration: Option<Duration>,
    pub scan_duration: Option<Duration>,
    pub cycle_interval: Option<Duration>,
}

impl Default for ContinuousOptions {
    fn default() -> Self {
        Self {
            cumulative: true,
            operator: None,
            max_duration: None,
            scan_duration: None,
            cycle_interval: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutboundOptions {
    /// Recorded as `checked_by`.
    pub operator: Option<String>,
    /// Overrides `outbound.scan_duration_secs`.
    pub scan_duration: Option<Duration>,
}

/// Shared flag that stops continuous verification between cycles.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct TrackingEngine {
    catalog: Arc<dyn Catalog>,
    sessions: Arc<dyn SessionStore>,
    scanner: Arc<dyn Scanner>,
    config: EngineConfig,
    session_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl TrackingEngine {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        sessions: Arc<dyn SessionStore>,
        scanner: Arc<dyn Scanner>,
        config: EngineConfig,
    ) -> Self {
        Self {
            catalog,
            sessions,
            scanner,
            config,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn session_lock(&self, session_id: i64) -> Arc<Mutex<()>> {
        lock(&self.session_locks)
            .entry(session_id)
            .or_default()
            .clone()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Verification
    // ─────────────────────────────────────────────────────────────────────

    /// Runs one scan-and-reconcile cycle and persists the result.
    pub fn verify(&self, session_id: i64, options: &VerifyOptions) -> Result<VerificationReport> {
        let session_lock = self.session_lock(session_id);
        let _guard = lock(&session_lock);

        let operation = self.sessions.operation_session(session_id)?;
        if lifecycle::is_terminal(operation.state) {
            return Err(TrackError::SessionClosed {
                session_id,
                state: operation.state,
            });
        }
        if let Some(existing) = self.sessions.verification_session(session_id)? {
            if existing.state == VerificationState::Invalid {
                return Err(TrackError::VerificationInvalidated(session_id));
            }
        }
        let required = self.catalog.requirement_spec(operation.operation_type_id)?;

        let scan_duration = options
            .scan_duration
            .unwrap_or_else(|| self.config.verification.single_scan());
        let resolution = self.scan_and_resolve(&operation, scan_duration)?;

        let mut session = self.sessions.get_or_create_verification_session(&operation)?;
        let previous = session.reconciliation();
        let catalog = &self.catalog;
        let mut lookup = |kind: ItemKind, name: &str, exclude: &[i64]| -> Vec<i64> {
            match catalog.find_available_by_name(kind, name, exclude) {
                Ok(items) => items.into_iter().map(|item| item.id).collect(),
                Err(err) => {
                    warn!(
                        kind = kind.as_str(),
                        name = %name,
                        error = %err,
                        "Available lookup failed; reporting no substitutes"
                    );
                    Vec::new()
                }
            }
        };
        let result = verification::verify(
            &required,
            &resolution.present,
            Some(&previous),
            options.cumulative,
            &mut lookup,
        );

        self.mark_in_use(result.used_keys());

        session.apply(result);
        if let Some(operator) = &options.operator {
            session.verified_by = Some(operator.clone());
        }
        self.sessions.save_verification_session(&session)?;

        info!(
            session_id,
            verification_id = session.id,
            state = session.state.as_str(),
            cumulative = options.cumulative,
            present = resolution.present.len(),
            "Verification cycle complete"
        );

        Ok(verification_report(&session))
    }

    /// Repeats verification until the session is valid, the deadline passes,
    /// or `cancel` fires. Returns the last cycle's report in every case; running
    /// out of time is not an error.
    pub fn start_continuous_verification(
        &self,
        session_id: i64,
        options: &ContinuousOptions,
        cancel: &CancelToken,
    ) -> Result<VerificationReport> {
        let verification = &self.config.verification;
        let max_duration = options
            .max_duration
            .unwrap_or_else(|| verification.max_duration());
        let scan_duration = options
            .scan_duration
            .unwrap_or_else(|| verification.scan_duration());
        let cycle_interval = options
            .cycle_interval
            .unwrap_or_else(|| verification.cycle_interval());
        let deadline = Instant::now() + max_duration;

        info!(
            session_id,
            max_duration_secs = max_duration.as_secs(),
            "Starting continuous verification"
        );

        let mut cycle: u32 = 0;
        loop {
            cycle += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let report = self.verify(
                session_id,
                &VerifyOptions {
                    cumulative: options.cumulative,
                    operator: options.operator.clone(),
                    scan_duration: Some(scan_duration.min(remaining)),
                },
            )?;

            if report.state == VerificationState::Valid {
                info!(session_id, cycle, "All required items found");
                return Ok(report);
            }
            if cancel.is_cancelled() {
                info!(session_id, cycle, "Continuous verification cancelled");
                return Ok(report);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    session_id,
                    cycle,
                    max_duration_secs = max_duration.as_secs(),
                    "Continuous verification timed out"
                );
                return Ok(report);
            }

            debug!(session_id, cycle, "Waiting before next verification cycle");
            if !sleep_unless_cancelled(cycle_interval.min(remaining), cancel) {
                info!(session_id, cycle, "Continuous verification cancelled");
                return Ok(report);
            }
            if Instant::now() >= deadline {
                warn!(
                    session_id,
                    cycle,
                    max_duration_secs = max_duration.as_secs(),
                    "Continuous verification timed out"
                );
                return Ok(report);
            }
        }
    }

    /// Stored verification result, without scanning.
    pub fn verification_status(&self, session_id: i64) -> Result<VerificationReport> {
        self.sessions.operation_session(session_id)?;
        let session = self
            .sessions
            .verification_session(session_id)?
            .ok_or(TrackError::VerificationMissing(session_id))?;
        Ok(verification_report(&session))
    }

    /// Marks the session's verification `invalid`. Later cycles are rejected.
    pub fn invalidate_verification(
        &self,
        session_id: i64,
        operator: Option<&str>,
    ) -> Result<VerificationReport> {
        let session_lock = self.session_lock(session_id);
        let _guard = lock(&session_lock);

        self.sessions.operation_session(session_id)?;
        let mut session = self
            .sessions
            .verification_session(session_id)?
            .ok_or(TrackError::VerificationMissing(session_id))?;
        session.state = VerificationState::Invalid;
        if let Some(operator) = operator {
            session.verified_by = Some(operator.to_string());
        }
        self.sessions.save_verification_session(&session)?;

        warn!(session_id, verification_id = session.id, "Verification invalidated");
        Ok(verification_report(&session))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────────────

    /// Scans the room after the procedure and checks that every used instance
    /// has left. Preconditions are checked before anything is written.
    pub fn check_outbound(
        &self,
        session_id: i64,
        options: &OutboundOptions,
    ) -> Result<OutboundReport> {
        let session_lock = self.session_lock(session_id);
        let _guard = lock(&session_lock);

        let operation = self.sessions.operation_session(session_id)?;
        if !lifecycle::outbound_allowed(operation.state) {
            return Err(TrackError::OutboundNotAllowed {
                state: operation.state,
            });
        }
        let verification = self
            .sessions
            .verification_session(session_id)?
            .ok_or(TrackError::VerificationMissing(session_id))?;
        if verification.used_items.is_empty() {
            return Err(TrackError::NoUsedItems(session_id));
        }

        let scan_duration = options
            .scan_duration
            .unwrap_or_else(|| self.config.outbound.scan_duration());
        let scan_time = Utc::now();
        let resolution = self.scan_and_resolve(&operation, scan_duration)?;

        let outcome = outbound::check_outbound(&verification.used_items, &resolution.present);
        self.mark_in_use(outcome.remaining_keys());

        let mut check = self
            .sessions
            .get_or_create_outbound_check(session_id, options.operator.as_deref())?;
        check.room_cleared = outcome.room_cleared;
        check.remaining_items = outcome.remaining;
        check.extra_items = outcome.extra;
        check.check_time = Utc::now();
        if let Some(operator) = &options.operator {
            check.checked_by = Some(operator.clone());
        }
        self.sessions.save_outbound_check(&check)?;

        let next_state = lifecycle::outbound_transition(operation.state, check.room_cleared)?;
        if next_state != operation.state {
            self.sessions.set_operation_state(session_id, next_state)?;
            info!(
                session_id,
                from = operation.state.as_str(),
                to = next_state.as_str(),
                "Operation session state changed"
            );
        }

        info!(
            session_id,
            outbound_check_id = check.id,
            room_cleared = check.room_cleared,
            "Outbound check complete"
        );

        Ok(outbound_report(
            &check,
            &verification.used_items,
            next_state,
            Some(scan_time),
        ))
    }

    /// Latest stored outbound check, provided it is recent enough to trust.
    pub fn outbound_status(&self, session_id: i64) -> Result<OutboundReport> {
        let operation = self.sessions.operation_session(session_id)?;
        let check = self
            .sessions
            .latest_outbound_check(session_id)?
            .ok_or(TrackError::NoOutboundCheck(session_id))?;

        let age_secs = (Utc::now() - check.check_time).num_seconds();
        let max_age = i64::try_from(self.config.outbound.status_max_age_secs).unwrap_or(i64::MAX);
        if age_secs > max_age {
            return Err(TrackError::StaleOutboundCheck {
                session_id,
                age_secs,
            });
        }

        let used_items = self
            .sessions
            .verification_session(session_id)?
            .map(|session| session.used_items)
            .unwrap_or_default();
        Ok(outbound_report(&check, &used_items, operation.state, None))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    pub fn advance_session(&self, session_id: i64, to: OperationState) -> Result<OperationSession> {
        let session_lock = self.session_lock(session_id);
        let _guard = lock(&session_lock);

        let mut operation = self.sessions.operation_session(session_id)?;
        let next = lifecycle::transition(operation.state, to)?;
        self.sessions.set_operation_state(session_id, next)?;
        info!(
            session_id,
            from = operation.state.as_str(),
            to = next.as_str(),
            "Operation session state changed"
        );
        operation.state = next;
        Ok(operation)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────

    fn scan_and_resolve(
        &self,
        operation: &OperationSession,
        duration: Duration,
    ) -> Result<Resolution> {
        let reader = &self.config.reader;
        let payload = match self.scanner.scan(duration, reader) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    session_id = operation.id,
                    port = %reader.port,
                    error = %err,
                    "Scan failed; treating as no tags detected"
                );
                ortrack_protocol::ScanPayload::empty()
            }
        };

        for epc in payload.rejected_epcs() {
            warn!(
                session_id = operation.id,
                epc_len = epc.len(),
                epc = %epc,
                "Dropping EPC longer than the tag id limit"
            );
        }
        let detected = payload.detected_tag_ids();
        debug!(
            session_id = operation.id,
            detected = detected.len(),
            "Scan complete"
        );
        let resolution = resolve(&detected, self.catalog.as_ref())?;

        let detection = Detection {
            reader: reader.name.clone(),
            location: reader.location.clone().or_else(|| operation.room.clone()),
            detected_at: Utc::now(),
        };
        for tag in &resolution.tags {
            if let Err(err) = self.catalog.record_detection(&tag.tag_id, &detection) {
                warn!(tag_id = %tag.tag_id, error = %err, "Failed to record tag detection");
            }
        }

        Ok(resolution)
    }

    fn mark_in_use(&self, keys: Vec<(ItemKind, i64)>) {
        for (kind, id) in keys {
            if let Err(err) = self.catalog.set_item_status(kind, id, ItemStatus::InUse) {
                warn!(
                    kind = kind.as_str(),
                    id,
                    error = %err,
                    "Failed to mark item in use"
                );
            }
        }
    }
}

/// Sleeps for `total`, waking early if cancelled. Returns false if cancelled.
fn sleep_unless_cancelled(total: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        thread::sleep(remaining.min(CANCEL_POLL_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCatalog, MemorySessionStore, ScriptedScanner};

    fn engine() -> TrackingEngine {
        TrackingEngine::new(
            Arc::new(MemoryCatalog::new()),
            Arc::new(MemorySessionStore::new()),
            Arc::new(ScriptedScanner::new()),
            EngineConfig::default(),
        )
    }

    #[test]
    fn session_locks_are_shared_per_session() {
        let engine = engine();
        let first = engine.session_lock(1);
        let again = engine.session_lock(1);
        let other = engine.session_lock(2);
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn sleep_returns_early_when_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        let started = Instant::now();
        assert!(!sleep_unless_cancelled(Duration::from_secs(5), &token));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn sleep_completes_without_cancel() {
        assert!(sleep_unless_cancelled(
            Duration::from_millis(10),
            &CancelToken::new()
        ));
    }

    #[test]
    fn unknown_session_is_not_found() {
        let engine = engine();
        let err = engine
            .verify(42, &VerifyOptions::default())
            .expect_err("missing session");
        assert!(matches!(err, TrackError::SessionNotFound(42)));
    }
}
