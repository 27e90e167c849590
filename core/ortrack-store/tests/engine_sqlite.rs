//! Full verification and outbound cycles against a real database file.

use std::path::Path;
use std::sync::Arc;

use ortrack_core::adapters::SessionStore;
use ortrack_core::memory::ScriptedScanner;
use ortrack_core::{
    EngineConfig, ItemKind, ItemStatus, OperationState, OutboundOptions, TrackError,
    TrackingEngine, VerificationState, VerifyOptions,
};
use ortrack_store::{load_seed, Db};

const SEED: &str = r#"{
    "instruments": [
        {"id": 1, "name": "Scalpel", "tag": "E1"},
        {"id": 2, "name": "Scalpel", "tag": "E2"},
        {"id": 3, "name": "Clamp", "tag": "E3"}
    ],
    "trays": [
        {"id": 5, "name": "Basic Tray", "tag": "T5"},
        {"id": 6, "name": "Basic Tray", "tag": "T6"}
    ],
    "operation_types": [
        {"id": 1, "name": "Appendectomy",
         "requirements": {"instruments": {"Scalpel": 2}, "trays": {"Basic Tray": 1}}}
    ],
    "operation_sessions": [
        {"id": 1, "operation_type_id": 1, "scheduled_time": "2024-05-01T08:00:00Z", "room": "OR-3"}
    ]
}"#;

fn seeded_db(dir: &Path) -> Arc<Db> {
    let seed_path = dir.join("seed.json");
    fs_err::write(&seed_path, SEED).expect("write seed");
    let db = Db::new(dir.join("ortrack.db")).expect("db init");
    db.import_seed(&load_seed(&seed_path).expect("load seed"))
        .expect("import");
    Arc::new(db)
}

fn engine(db: &Arc<Db>, scanner: &Arc<ScriptedScanner>) -> TrackingEngine {
    let mut config = EngineConfig::default();
    config.reader.name = "reader-or3".to_string();
    TrackingEngine::new(db.clone(), db.clone(), scanner.clone(), config)
}

fn verify_options() -> VerifyOptions {
    VerifyOptions {
        operator: Some("nurse.kim".to_string()),
        ..VerifyOptions::default()
    }
}

#[test]
fn verification_through_outbound_clearance_is_persisted() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let db = seeded_db(temp_dir.path());
    let scanner = Arc::new(ScriptedScanner::new());
    let engine = engine(&db, &scanner);

    scanner.push_tags(&["E1", "E2", "T5", "E3"]);
    let report = engine.verify(1, &verify_options()).expect("verify");
    assert_eq!(report.state, VerificationState::Valid);
    assert_eq!(
        report
            .extra_items
            .entry(ItemKind::Instrument, "Clamp")
            .map(|entry| entry.ids.clone()),
        Some(vec![3])
    );

    // A second handle on the same file sees everything the engine wrote.
    let reopened = Db::new(db.path().to_path_buf()).expect("reopen");
    let stored = reopened
        .verification_session(1)
        .expect("load")
        .expect("verification exists");
    assert_eq!(stored.state, VerificationState::Valid);
    assert_eq!(stored.verified_by.as_deref(), Some("nurse.kim"));
    assert_eq!(
        stored.used_items.all_ids(ItemKind::Instrument).into_iter().collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(
        reopened.item(ItemKind::Tray, 5).expect("item").map(|item| item.status),
        Some(ItemStatus::InUse)
    );
    let tag = reopened.tag("E1").expect("tag").expect("tag exists");
    assert_eq!(tag.last_detected_by.as_deref(), Some("reader-or3"));
    assert_eq!(tag.last_known_location.as_deref(), Some("OR-3"));

    engine
        .advance_session(1, OperationState::InProgress)
        .expect("start");
    engine
        .advance_session(1, OperationState::Completed)
        .expect("complete");

    scanner.push_tags(&[]);
    let outbound = engine
        .check_outbound(1, &OutboundOptions::default())
        .expect("outbound");
    assert!(outbound.room_cleared);
    assert_eq!(outbound.session_state, OperationState::OutboundCleared);
    assert_eq!(
        reopened.operation_session(1).expect("session").state,
        OperationState::OutboundCleared
    );
}

#[test]
fn missing_instrument_reports_an_available_substitute() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let db = seeded_db(temp_dir.path());
    let scanner = Arc::new(ScriptedScanner::new());
    let engine = engine(&db, &scanner);

    scanner.push_tags(&["E1", "T5"]);
    let report = engine.verify(1, &verify_options()).expect("verify");

    assert_eq!(report.state, VerificationState::Incomplete);
    let missing = report
        .missing_items
        .entry(ItemKind::Instrument, "Scalpel")
        .expect("scalpel missing");
    assert_eq!(missing.quantity, 1);
    assert!(missing.ids.is_empty());
    assert_eq!(
        report
            .available_items
            .entry(ItemKind::Instrument, "Scalpel")
            .map(|entry| entry.ids.clone()),
        Some(vec![2])
    );
}

#[test]
fn outbound_status_survives_a_new_engine() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let db = seeded_db(temp_dir.path());
    let scanner = Arc::new(ScriptedScanner::new());
    let engine = engine(&db, &scanner);

    scanner.push_tags(&["E1", "E2", "T5"]);
    engine.verify(1, &verify_options()).expect("verify");
    engine
        .advance_session(1, OperationState::InProgress)
        .expect("start");
    engine
        .advance_session(1, OperationState::Completed)
        .expect("complete");

    scanner.push_tags(&["E2"]);
    let outbound = engine
        .check_outbound(
            1,
            &OutboundOptions {
                operator: Some("nurse.kim".to_string()),
                ..OutboundOptions::default()
            },
        )
        .expect("outbound");
    assert!(!outbound.room_cleared);
    assert_eq!(outbound.session_state, OperationState::Verified);

    let fresh_db = Arc::new(Db::new(db.path().to_path_buf()).expect("reopen"));
    let fresh = engine_for(&fresh_db);
    let status = fresh.outbound_status(1).expect("status");
    assert_eq!(status.outbound_check_id, outbound.outbound_check_id);
    assert_eq!(status.checked_by.as_deref(), Some("nurse.kim"));
    assert_eq!(
        status
            .remaining_items
            .entry(ItemKind::Instrument, "Scalpel")
            .map(|entry| entry.ids.clone()),
        Some(vec![2])
    );
}

#[test]
fn tray_on_an_instrument_tag_is_tracked_through_outbound() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let db = seeded_db(temp_dir.path());
    let seed: ortrack_store::CatalogSeed =
        serde_json::from_str(r#"{"trays": [{"id": 7, "name": "Basic Tray", "tag": "E1"}]}"#)
            .expect("parse");
    db.import_seed(&seed).expect("import shared tag");
    let scanner = Arc::new(ScriptedScanner::new());
    let engine = engine(&db, &scanner);

    scanner.push_tags(&["E1", "E2"]);
    let report = engine.verify(1, &verify_options()).expect("verify");
    assert_eq!(report.state, VerificationState::Valid);
    assert_eq!(
        report
            .used_items
            .entry(ItemKind::Tray, "Basic Tray")
            .map(|entry| entry.ids.clone()),
        Some(vec![7])
    );

    engine
        .advance_session(1, OperationState::InProgress)
        .expect("start");
    engine
        .advance_session(1, OperationState::Completed)
        .expect("complete");

    scanner.push_tags(&["E1"]);
    let outbound = engine
        .check_outbound(1, &OutboundOptions::default())
        .expect("outbound");
    assert!(!outbound.room_cleared);
    assert_eq!(
        outbound
            .remaining_items
            .entry(ItemKind::Tray, "Basic Tray")
            .map(|entry| entry.ids.clone()),
        Some(vec![7])
    );
}

#[test]
fn outbound_before_verification_is_rejected_without_writes() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let db = seeded_db(temp_dir.path());
    let scanner = Arc::new(ScriptedScanner::new());
    let engine = engine(&db, &scanner);

    engine
        .advance_session(1, OperationState::InProgress)
        .expect("start");
    engine
        .advance_session(1, OperationState::Completed)
        .expect("complete");

    let err = engine
        .check_outbound(1, &OutboundOptions::default())
        .expect_err("no verification");
    assert!(matches!(err, TrackError::VerificationMissing(1)));
    assert!(db.latest_outbound_check(1).expect("load").is_none());
    assert!(scanner.calls().is_empty());
}

fn engine_for(db: &Arc<Db>) -> TrackingEngine {
    engine(db, &Arc::new(ScriptedScanner::new()))
}
