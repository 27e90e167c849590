//! SQLite persistence for ortrack.
//!
//! Holds the catalog (tags, instruments, trays, operation types) and the
//! session records (operation sessions, verification sessions, outbound
//! checks). Each call opens its own WAL-mode connection, so several processes
//! can share one database file. Buckets are stored as JSON text in exactly the
//! wire shape, `{"instruments": {name: {quantity, ids}}, "trays": {...}}`.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use ortrack_core::adapters::{Catalog, SessionStore};
use ortrack_core::{
    Detection, InventoryItem, ItemKind, ItemStatus, OperationSession, OperationState,
    OutboundCheck, RequirementSpec, Result, RfidTag, TagLink, TagStatus, TrackError,
    VerificationSession, VerificationState,
};
use ortrack_protocol::{AvailableMatches, ReconciliationBucket};

pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tag(&self, tag_id: &str) -> Result<Option<RfidTag>> {
        Ok(self.find_by_tag_ids(&[tag_id.to_string()])?.into_iter().next())
    }

    pub fn item(&self, kind: ItemKind, id: i64) -> Result<Option<InventoryItem>> {
        Ok(self.get_items(kind, &[id])?.into_iter().next())
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS rfid_tags (
                    tag_id TEXT PRIMARY KEY,
                    status TEXT NOT NULL DEFAULT 'active',
                    last_detected_by TEXT,
                    last_detection_time TEXT,
                    last_known_location TEXT
                 );
                 CREATE TABLE IF NOT EXISTS items (
                    kind TEXT NOT NULL,
                    id INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'available',
                    tag_id TEXT REFERENCES rfid_tags(tag_id),
                    PRIMARY KEY (kind, id)
                 );
                 CREATE INDEX IF NOT EXISTS idx_items_kind_name
                    ON items (kind, name, status);
                 CREATE INDEX IF NOT EXISTS idx_items_tag ON items (tag_id);
                 CREATE UNIQUE INDEX IF NOT EXISTS idx_items_instrument_tag
                    ON items (tag_id) WHERE kind = 'instrument' AND tag_id IS NOT NULL;
                 CREATE TABLE IF NOT EXISTS operation_types (
                    id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    requirements TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS operation_sessions (
                    id INTEGER PRIMARY KEY,
                    operation_type_id INTEGER NOT NULL REFERENCES operation_types(id),
                    state TEXT NOT NULL,
                    scheduled_time TEXT NOT NULL,
                    room TEXT
                 );
                 CREATE TABLE IF NOT EXISTS verification_sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    operation_session_id INTEGER NOT NULL UNIQUE
                        REFERENCES operation_sessions(id),
                    state TEXT NOT NULL,
                    open_until TEXT NOT NULL,
                    used_items TEXT NOT NULL,
                    missing_items TEXT NOT NULL,
                    extra_items TEXT NOT NULL,
                    available_items TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS outbound_checks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    operation_session_id INTEGER NOT NULL REFERENCES operation_sessions(id),
                    room_cleared INTEGER NOT NULL DEFAULT 0,
                    remaining_items TEXT NOT NULL,
                    extra_items TEXT NOT NULL,
                    check_time TEXT NOT NULL,
                    checked_by TEXT
                 );
                 CREATE INDEX IF NOT EXISTS idx_outbound_checks_session
                    ON outbound_checks (operation_session_id, check_time);
                 COMMIT;",
            )
            .map_err(|err| TrackError::storage("Failed to initialize schema", err))?;
            ensure_verification_columns(conn)?;
            Ok(())
        })
    }

    pub(crate) fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent).map_err(|source| TrackError::Io {
                context: "Failed to create data dir".to_string(),
                source,
            })?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| TrackError::storage("Failed to open sqlite db", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| TrackError::storage("Failed to enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| TrackError::storage("Failed to set synchronous", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| TrackError::storage("Failed to set busy_timeout", err))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|err| TrackError::storage("Failed to enable foreign keys", err))?;

        Ok(conn)
    }
}

/// Verification sessions written before substitutes and operator attribution
/// were tracked lack these columns.
fn ensure_verification_columns(conn: &Connection) -> Result<()> {
    let mut stmt = conn
        .prepare("PRAGMA table_info(verification_sessions)")
        .map_err(|err| TrackError::storage("Failed to read verification schema", err))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|err| TrackError::storage("Failed to read verification schema rows", err))?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row.map_err(|err| TrackError::storage("Failed to decode schema row", err))?);
    }

    if !columns.iter().any(|name| name == "verified_by") {
        conn.execute(
            "ALTER TABLE verification_sessions ADD COLUMN verified_by TEXT",
            [],
        )
        .map_err(|err| TrackError::storage("Failed to add verified_by column", err))?;
    }

    if !columns.iter().any(|name| name == "available_matches") {
        conn.execute(
            "ALTER TABLE verification_sessions ADD COLUMN available_matches TEXT NOT NULL DEFAULT '{}'",
            [],
        )
        .map_err(|err| TrackError::storage("Failed to add available_matches column", err))?;
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row conversion
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) fn format_time(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| TrackError::storage(format!("Invalid {} timestamp '{}'", field, value), err))
}

pub(crate) fn to_json<T: Serialize>(value: &T, field: &str) -> Result<String> {
    serde_json::to_string(value).map_err(|source| TrackError::Json {
        context: format!("serializing {}", field),
        source,
    })
}

fn from_json<T: DeserializeOwned>(value: &str, field: &str) -> Result<T> {
    serde_json::from_str(value).map_err(|source| TrackError::Json {
        context: format!("parsing {}", field),
        source,
    })
}

fn parse_kind(value: &str) -> Result<ItemKind> {
    ItemKind::from_str(value)
        .ok_or_else(|| TrackError::storage("Unknown item kind", value))
}

type ItemRow = (String, i64, String, String, Option<String>);

const ITEM_COLUMNS: &str = "kind, id, name, status, tag_id";

fn read_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn item_from_row((kind, id, name, status, tag_id): ItemRow) -> Result<InventoryItem> {
    Ok(InventoryItem {
        id,
        name,
        kind: parse_kind(&kind)?,
        status: ItemStatus::from_str(&status)
            .ok_or_else(|| TrackError::storage("Unknown item status", &status))?,
        tag_id,
    })
}

type TagRow = (String, String, Option<String>, Option<String>, Option<String>);

fn read_tag_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TagRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn tag_from_row(
    (tag_id, status, last_detected_by, last_detection_time, last_known_location): TagRow,
    link: TagLink,
) -> Result<RfidTag> {
    Ok(RfidTag {
        tag_id,
        status: TagStatus::from_str(&status)
            .ok_or_else(|| TrackError::storage("Unknown tag status", &status))?,
        last_detected_by,
        last_detection_time: last_detection_time
            .map(|value| parse_time(&value, "last_detection_time"))
            .transpose()?,
        last_known_location,
        link,
    })
}

fn link_from_rows(rows: Vec<(String, i64)>) -> Result<TagLink> {
    let mut link = TagLink::unlinked();
    for (kind, id) in rows {
        match parse_kind(&kind)? {
            ItemKind::Instrument => link.instrument = Some(id),
            ItemKind::Tray => link.trays.push(id),
        }
    }
    Ok(link)
}

fn parse_operation_state(value: &str) -> Result<OperationState> {
    OperationState::from_str(value)
        .ok_or_else(|| TrackError::storage("Unknown operation state", value))
}

type SessionRow = (i64, i64, String, String, Option<String>);

fn session_from_row((id, operation_type_id, state, scheduled_time, room): SessionRow) -> Result<OperationSession> {
    Ok(OperationSession {
        id,
        operation_type_id,
        state: parse_operation_state(&state)?,
        scheduled_time: parse_time(&scheduled_time, "scheduled_time")?,
        room,
    })
}

struct VerificationRow {
    id: i64,
    operation_session_id: i64,
    state: String,
    open_until: String,
    verified_by: Option<String>,
    used_items: String,
    missing_items: String,
    extra_items: String,
    available_items: String,
    available_matches: String,
}

const VERIFICATION_COLUMNS: &str = "id, operation_session_id, state, open_until, verified_by, \
     used_items, missing_items, extra_items, available_items, available_matches";

fn read_verification_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VerificationRow> {
    Ok(VerificationRow {
        id: row.get(0)?,
        operation_session_id: row.get(1)?,
        state: row.get(2)?,
        open_until: row.get(3)?,
        verified_by: row.get(4)?,
        used_items: row.get(5)?,
        missing_items: row.get(6)?,
        extra_items: row.get(7)?,
        available_items: row.get(8)?,
        available_matches: row.get(9)?,
    })
}

impl VerificationRow {
    fn into_session(self) -> Result<VerificationSession> {
        Ok(VerificationSession {
            id: self.id,
            operation_session_id: self.operation_session_id,
            state: VerificationState::from_str(&self.state)
                .ok_or_else(|| TrackError::storage("Unknown verification state", &self.state))?,
            open_until: parse_time(&self.open_until, "open_until")?,
            verified_by: self.verified_by,
            used_items: from_json::<ReconciliationBucket>(&self.used_items, "used_items")?,
            missing_items: from_json::<ReconciliationBucket>(&self.missing_items, "missing_items")?,
            extra_items: from_json::<ReconciliationBucket>(&self.extra_items, "extra_items")?,
            available_items: from_json::<ReconciliationBucket>(
                &self.available_items,
                "available_items",
            )?,
            available_matches: from_json::<AvailableMatches>(
                &self.available_matches,
                "available_matches",
            )?,
        })
    }
}

type OutboundRow = (i64, i64, bool, String, String, String, Option<String>);

const OUTBOUND_COLUMNS: &str =
    "id, operation_session_id, room_cleared, remaining_items, extra_items, check_time, checked_by";

fn read_outbound_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboundRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn outbound_from_row(
    (id, operation_session_id, room_cleared, remaining, extra, check_time, checked_by): OutboundRow,
) -> Result<OutboundCheck> {
    Ok(OutboundCheck {
        id,
        operation_session_id,
        room_cleared,
        remaining_items: from_json(&remaining, "remaining_items")?,
        extra_items: from_json(&extra, "extra_items")?,
        check_time: parse_time(&check_time, "check_time")?,
        checked_by,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Catalog
// ═══════════════════════════════════════════════════════════════════════════════

impl Catalog for Db {
    fn find_by_tag_ids(&self, tag_ids: &[String]) -> Result<Vec<RfidTag>> {
        self.with_connection(|conn| {
            let mut tag_stmt = conn
                .prepare(
                    "SELECT tag_id, status, last_detected_by, last_detection_time, last_known_location \
                     FROM rfid_tags WHERE tag_id = ?1",
                )
                .map_err(|err| TrackError::storage("Failed to prepare tag query", err))?;
            let mut link_stmt = conn
                .prepare("SELECT kind, id FROM items WHERE tag_id = ?1 ORDER BY kind ASC, id ASC")
                .map_err(|err| TrackError::storage("Failed to prepare tag link query", err))?;

            let mut tags = Vec::new();
            for tag_id in tag_ids {
                let Some(row) = tag_stmt
                    .query_row(params![tag_id], read_tag_row)
                    .optional()
                    .map_err(|err| TrackError::storage("Failed to query tag", err))?
                else {
                    continue;
                };

                let links = link_stmt
                    .query_map(params![tag_id], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })
                    .map_err(|err| TrackError::storage("Failed to query tag links", err))?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|err| TrackError::storage("Failed to decode tag link row", err))?;

                tags.push(tag_from_row(row, link_from_rows(links)?)?);
            }
            Ok(tags)
        })
    }

    fn get_items(&self, kind: ItemKind, ids: &[i64]) -> Result<Vec<InventoryItem>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM items WHERE kind = ?1 AND id = ?2",
                    ITEM_COLUMNS
                ))
                .map_err(|err| TrackError::storage("Failed to prepare item query", err))?;

            let mut items = Vec::new();
            for id in ids {
                let row = stmt
                    .query_row(params![kind.as_str(), id], read_item_row)
                    .optional()
                    .map_err(|err| TrackError::storage("Failed to query item", err))?;
                if let Some(row) = row {
                    items.push(item_from_row(row)?);
                }
            }
            Ok(items)
        })
    }

    fn find_available_by_name(
        &self,
        kind: ItemKind,
        name: &str,
        exclude_ids: &[i64],
    ) -> Result<Vec<InventoryItem>> {
        let rows = self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM items \
                     WHERE kind = ?1 AND name = ?2 AND status = ?3 \
                     ORDER BY id ASC",
                    ITEM_COLUMNS
                ))
                .map_err(|err| TrackError::storage("Failed to prepare availability query", err))?;
            let rows = stmt
                .query_map(
                    params![kind.as_str(), name, ItemStatus::Available.as_str()],
                    read_item_row,
                )
                .map_err(|err| TrackError::storage("Failed to query available items", err))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|err| TrackError::storage("Failed to decode item row", err))?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(item_from_row)
            .filter(|item| match item {
                Ok(item) => !exclude_ids.contains(&item.id),
                Err(_) => true,
            })
            .collect()
    }

    fn requirement_spec(&self, operation_type_id: i64) -> Result<RequirementSpec> {
        let raw: Option<String> = self.with_connection(|conn| {
            conn.query_row(
                "SELECT requirements FROM operation_types WHERE id = ?1",
                params![operation_type_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| TrackError::storage("Failed to query operation type", err))
        })?;
        let raw = raw.ok_or(TrackError::OperationTypeNotFound(operation_type_id))?;
        let value: serde_json::Value = from_json(&raw, "requirements")?;
        RequirementSpec::from_value(&value)
    }

    fn set_item_status(&self, kind: ItemKind, id: i64, status: ItemStatus) -> Result<()> {
        let updated = self.with_connection(|conn| {
            conn.execute(
                "UPDATE items SET status = ?3 WHERE kind = ?1 AND id = ?2",
                params![kind.as_str(), id, status.as_str()],
            )
            .map_err(|err| TrackError::storage("Failed to update item status", err))
        })?;
        if updated == 0 {
            return Err(TrackError::ItemNotFound { kind, id });
        }
        debug!(kind = kind.as_str(), id, status = status.as_str(), "Item status updated");
        Ok(())
    }

    fn record_detection(&self, tag_id: &str, detection: &Detection) -> Result<()> {
        let updated = self.with_connection(|conn| {
            conn.execute(
                "UPDATE rfid_tags SET \
                    last_detected_by = ?2, \
                    last_detection_time = ?3, \
                    last_known_location = COALESCE(?4, last_known_location) \
                 WHERE tag_id = ?1",
                params![
                    tag_id,
                    detection.reader,
                    format_time(&detection.detected_at),
                    detection.location
                ],
            )
            .map_err(|err| TrackError::storage("Failed to record tag detection", err))
        })?;
        if updated == 0 {
            return Err(TrackError::TagNotFound(tag_id.to_string()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session Store
// ═══════════════════════════════════════════════════════════════════════════════

impl SessionStore for Db {
    fn operation_session(&self, id: i64) -> Result<OperationSession> {
        let row: Option<SessionRow> = self.with_connection(|conn| {
            conn.query_row(
                "SELECT id, operation_type_id, state, scheduled_time, room \
                 FROM operation_sessions WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()
            .map_err(|err| TrackError::storage("Failed to query operation session", err))
        })?;
        session_from_row(row.ok_or(TrackError::SessionNotFound(id))?)
    }

    fn set_operation_state(&self, id: i64, state: OperationState) -> Result<()> {
        let updated = self.with_connection(|conn| {
            conn.execute(
                "UPDATE operation_sessions SET state = ?2 WHERE id = ?1",
                params![id, state.as_str()],
            )
            .map_err(|err| TrackError::storage("Failed to update operation state", err))
        })?;
        if updated == 0 {
            return Err(TrackError::SessionNotFound(id));
        }
        Ok(())
    }

    fn verification_session(
        &self,
        operation_session_id: i64,
    ) -> Result<Option<VerificationSession>> {
        let row = self.with_connection(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM verification_sessions WHERE operation_session_id = ?1",
                    VERIFICATION_COLUMNS
                ),
                params![operation_session_id],
                read_verification_row,
            )
            .optional()
            .map_err(|err| TrackError::storage("Failed to query verification session", err))
        })?;
        row.map(VerificationRow::into_session).transpose()
    }

    fn get_or_create_verification_session(
        &self,
        operation: &OperationSession,
    ) -> Result<VerificationSession> {
        if let Some(existing) = self.verification_session(operation.id)? {
            return Ok(existing);
        }

        let fresh = VerificationSession::new(0, operation);
        let empty = to_json(&ReconciliationBucket::default(), "bucket")?;
        let matches = to_json(&fresh.available_matches, "available_matches")?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO verification_sessions \
                    (operation_session_id, state, open_until, used_items, missing_items, \
                     extra_items, available_items, available_matches) \
                 VALUES (?1, ?2, ?3, ?4, ?4, ?4, ?4, ?5) \
                 ON CONFLICT(operation_session_id) DO NOTHING",
                params![
                    operation.id,
                    fresh.state.as_str(),
                    format_time(&fresh.open_until),
                    empty,
                    matches
                ],
            )
            .map_err(|err| TrackError::storage("Failed to create verification session", err))
        })?;

        debug!(session_id = operation.id, "Verification session created");
        self.verification_session(operation.id)?.ok_or_else(|| {
            TrackError::storage(
                "Failed to create verification session",
                format!("no row for operation session {}", operation.id),
            )
        })
    }

    fn save_verification_session(&self, session: &VerificationSession) -> Result<()> {
        let used = to_json(&session.used_items, "used_items")?;
        let missing = to_json(&session.missing_items, "missing_items")?;
        let extra = to_json(&session.extra_items, "extra_items")?;
        let available = to_json(&session.available_items, "available_items")?;
        let matches = to_json(&session.available_matches, "available_matches")?;

        let updated = self.with_connection(|conn| {
            conn.execute(
                "UPDATE verification_sessions SET \
                    state = ?2, \
                    open_until = ?3, \
                    verified_by = ?4, \
                    used_items = ?5, \
                    missing_items = ?6, \
                    extra_items = ?7, \
                    available_items = ?8, \
                    available_matches = ?9 \
                 WHERE id = ?1",
                params![
                    session.id,
                    session.state.as_str(),
                    format_time(&session.open_until),
                    session.verified_by,
                    used,
                    missing,
                    extra,
                    available,
                    matches
                ],
            )
            .map_err(|err| TrackError::storage("Failed to save verification session", err))
        })?;
        if updated == 0 {
            return Err(TrackError::VerificationMissing(session.operation_session_id));
        }
        Ok(())
    }

    fn latest_outbound_check(&self, operation_session_id: i64) -> Result<Option<OutboundCheck>> {
        let row = self.with_connection(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM outbound_checks WHERE operation_session_id = ?1 \
                     ORDER BY check_time DESC, id DESC LIMIT 1",
                    OUTBOUND_COLUMNS
                ),
                params![operation_session_id],
                read_outbound_row,
            )
            .optional()
            .map_err(|err| TrackError::storage("Failed to query outbound check", err))
        })?;
        row.map(outbound_from_row).transpose()
    }

    fn get_or_create_outbound_check(
        &self,
        operation_session_id: i64,
        checked_by: Option<&str>,
    ) -> Result<OutboundCheck> {
        if let Some(existing) = self.latest_outbound_check(operation_session_id)? {
            return Ok(existing);
        }

        let mut check = OutboundCheck::new(0, operation_session_id, checked_by.map(str::to_string));
        let empty = to_json(&ReconciliationBucket::default(), "bucket")?;
        check.id = self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO outbound_checks \
                    (operation_session_id, room_cleared, remaining_items, extra_items, check_time, checked_by) \
                 VALUES (?1, 0, ?2, ?2, ?3, ?4)",
                params![
                    operation_session_id,
                    empty,
                    format_time(&check.check_time),
                    check.checked_by
                ],
            )
            .map_err(|err| TrackError::storage("Failed to create outbound check", err))?;
            Ok(conn.last_insert_rowid())
        })?;

        debug!(
            session_id = operation_session_id,
            outbound_check_id = check.id,
            "Outbound check created"
        );
        Ok(check)
    }

    fn save_outbound_check(&self, check: &OutboundCheck) -> Result<()> {
        let remaining = to_json(&check.remaining_items, "remaining_items")?;
        let extra = to_json(&check.extra_items, "extra_items")?;
        let updated = self.with_connection(|conn| {
            conn.execute(
                "UPDATE outbound_checks SET \
                    room_cleared = ?2, \
                    remaining_items = ?3, \
                    extra_items = ?4, \
                    check_time = ?5, \
                    checked_by = ?6 \
                 WHERE id = ?1",
                params![
                    check.id,
                    check.room_cleared,
                    remaining,
                    extra,
                    format_time(&check.check_time),
                    check.checked_by
                ],
            )
            .map_err(|err| TrackError::storage("Failed to save outbound check", err))
        })?;
        if updated == 0 {
            return Err(TrackError::NoOutboundCheck(check.operation_session_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ortrack_protocol::ItemEntry;

    fn db() -> (tempfile::TempDir, Db) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("ortrack.db")).expect("db init");
        (temp_dir, db)
    }

    fn insert_item(db: &Db, kind: ItemKind, id: i64, name: &str, tag: Option<&str>) {
        db.with_connection(|conn| {
            if let Some(tag) = tag {
                conn.execute(
                    "INSERT OR IGNORE INTO rfid_tags (tag_id) VALUES (?1)",
                    params![tag],
                )
                .map_err(|err| TrackError::storage("insert tag", err))?;
            }
            conn.execute(
                "INSERT INTO items (kind, id, name, status, tag_id) VALUES (?1, ?2, ?3, 'available', ?4)",
                params![kind.as_str(), id, name, tag],
            )
            .map_err(|err| TrackError::storage("insert item", err))?;
            Ok(())
        })
        .expect("insert item");
    }

    fn insert_session(db: &Db, id: i64, requirements: &str) {
        db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO operation_types (id, name, requirements) VALUES (?1, 'Op', ?2)",
                params![id, requirements],
            )
            .map_err(|err| TrackError::storage("insert type", err))?;
            conn.execute(
                "INSERT INTO operation_sessions (id, operation_type_id, state, scheduled_time) \
                 VALUES (?1, ?1, 'scheduled', ?2)",
                params![id, format_time(&Utc::now())],
            )
            .map_err(|err| TrackError::storage("insert session", err))?;
            Ok(())
        })
        .expect("insert session");
    }

    #[test]
    fn resolves_tag_links_from_items() {
        let (_dir, db) = db();
        insert_item(&db, ItemKind::Instrument, 1, "Scalpel", Some("E1"));
        insert_item(&db, ItemKind::Tray, 5, "Basic Tray", Some("T1"));
        insert_item(&db, ItemKind::Tray, 6, "Basic Tray", Some("T1"));
        db.with_connection(|conn| {
            conn.execute("INSERT INTO rfid_tags (tag_id) VALUES ('LOOSE')", [])
                .map_err(|err| TrackError::storage("insert tag", err))
        })
        .expect("insert tag");

        let detected: Vec<String> = ["E1", "T1", "LOOSE", "GHOST"]
            .iter()
            .map(|tag| tag.to_string())
            .collect();
        let tags = db.find_by_tag_ids(&detected).expect("find tags");

        assert_eq!(tags.len(), 3);
        assert_eq!(tags[0].link, TagLink::for_instrument(1));
        assert_eq!(tags[1].link, TagLink::for_trays(vec![5, 6]));
        assert!(tags[2].link.is_unlinked());
    }

    #[test]
    fn tag_carried_by_instrument_and_tray_links_both() {
        let (_dir, db) = db();
        insert_item(&db, ItemKind::Instrument, 1, "Scalpel", Some("E1"));
        insert_item(&db, ItemKind::Tray, 5, "Basic Tray", Some("E1"));

        let link = db.tag("E1").expect("tag").map(|tag| tag.link);
        assert_eq!(link, Some(TagLink::for_instrument(1).with_trays(vec![5])));
    }

    #[test]
    fn second_instrument_on_a_tag_is_rejected_by_schema() {
        let (_dir, db) = db();
        insert_item(&db, ItemKind::Instrument, 1, "Scalpel", Some("E1"));
        let result = db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO items (kind, id, name, tag_id) VALUES ('instrument', 2, 'Scalpel', 'E1')",
                [],
            )
            .map_err(|err| TrackError::storage("insert item", err))
        });
        assert!(result.is_err());
    }

    #[test]
    fn available_lookup_excludes_ids_and_busy_items() {
        let (_dir, db) = db();
        for id in 1..=3 {
            insert_item(&db, ItemKind::Instrument, id, "Scalpel", None);
        }
        db.set_item_status(ItemKind::Instrument, 2, ItemStatus::InUse)
            .expect("status");

        let ids: Vec<i64> = db
            .find_available_by_name(ItemKind::Instrument, "Scalpel", &[1])
            .expect("lookup")
            .into_iter()
            .map(|item| item.id)
            .collect();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn status_write_on_missing_item_is_not_found() {
        let (_dir, db) = db();
        let err = db
            .set_item_status(ItemKind::Tray, 7, ItemStatus::InUse)
            .expect_err("missing");
        assert!(matches!(err, TrackError::ItemNotFound { id: 7, .. }));
    }

    #[test]
    fn requirement_spec_accepts_legacy_lists() {
        let (_dir, db) = db();
        insert_session(&db, 1, r#"{"instruments": ["Scalpel", "Scalpel"]}"#);
        let spec = db.requirement_spec(1).expect("spec");
        assert_eq!(spec.count(ItemKind::Instrument, "Scalpel"), Some(2));
        assert!(matches!(
            db.requirement_spec(2),
            Err(TrackError::OperationTypeNotFound(2))
        ));
    }

    #[test]
    fn verification_buckets_round_trip_in_wire_shape() {
        let (_dir, db) = db();
        insert_session(&db, 1, r#"{"instruments": {"Scalpel": 2}}"#);
        let operation = db.operation_session(1).expect("session");

        let mut session = db
            .get_or_create_verification_session(&operation)
            .expect("create");
        session
            .used_items
            .insert(ItemKind::Instrument, "Scalpel", ItemEntry::from_ids(vec![1]));
        session
            .missing_items
            .insert(ItemKind::Instrument, "Scalpel", ItemEntry::count_only(1));
        session.verified_by = Some("nurse".to_string());
        db.save_verification_session(&session).expect("save");

        let loaded = db
            .verification_session(1)
            .expect("load")
            .expect("exists");
        assert_eq!(loaded, session);

        let raw: String = db
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT used_items FROM verification_sessions WHERE id = ?1",
                    params![session.id],
                    |row| row.get(0),
                )
                .map_err(|err| TrackError::storage("read", err))
            })
            .expect("raw");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&raw).expect("json"),
            serde_json::json!({"instruments": {"Scalpel": {"quantity": 1, "ids": [1]}}, "trays": {}})
        );

        let again = db
            .get_or_create_verification_session(&operation)
            .expect("get");
        assert_eq!(again.id, session.id);
    }

    #[test]
    fn latest_outbound_check_wins() {
        let (_dir, db) = db();
        insert_session(&db, 1, "{}");

        let mut first = db.get_or_create_outbound_check(1, None).expect("create");
        first.check_time = Utc::now() - chrono::Duration::minutes(10);
        db.save_outbound_check(&first).expect("save");

        let second_id = db
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO outbound_checks \
                        (operation_session_id, room_cleared, remaining_items, extra_items, check_time) \
                     VALUES (1, 1, '{}', '{}', ?1)",
                    params![format_time(&Utc::now())],
                )
                .map_err(|err| TrackError::storage("insert", err))?;
                Ok(conn.last_insert_rowid())
            })
            .expect("insert");

        let latest = db.latest_outbound_check(1).expect("latest").expect("some");
        assert_eq!(latest.id, second_id);
        assert!(latest.room_cleared);
        assert!(latest.remaining_items.is_empty());
    }

    #[test]
    fn detection_updates_tag_and_keeps_location_when_unknown() {
        let (_dir, db) = db();
        insert_item(&db, ItemKind::Instrument, 1, "Scalpel", Some("E1"));
        let first = Detection {
            reader: "reader-a".to_string(),
            location: Some("OR-1".to_string()),
            detected_at: Utc::now(),
        };
        db.record_detection("E1", &first).expect("first");
        let second = Detection {
            reader: "reader-b".to_string(),
            location: None,
            detected_at: Utc::now(),
        };
        db.record_detection("E1", &second).expect("second");

        let tag = db.tag("E1").expect("tag").expect("exists");
        assert_eq!(tag.last_detected_by.as_deref(), Some("reader-b"));
        assert_eq!(tag.last_known_location.as_deref(), Some("OR-1"));
        assert_eq!(tag.last_detection_time, Some(second.detected_at));

        assert!(matches!(
            db.record_detection("GHOST", &second),
            Err(TrackError::TagNotFound(_))
        ));
    }

    #[test]
    fn unknown_session_is_not_found() {
        let (_dir, db) = db();
        assert!(matches!(
            db.operation_session(4),
            Err(TrackError::SessionNotFound(4))
        ));
        assert!(matches!(
            db.set_operation_state(4, OperationState::Completed),
            Err(TrackError::SessionNotFound(4))
        ));
    }

    #[test]
    fn adds_missing_verification_columns() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("legacy.db");
        {
            let conn = Connection::open(&path).expect("open");
            conn.execute_batch(
                "CREATE TABLE verification_sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    operation_session_id INTEGER NOT NULL UNIQUE,
                    state TEXT NOT NULL,
                    open_until TEXT NOT NULL,
                    used_items TEXT NOT NULL,
                    missing_items TEXT NOT NULL,
                    extra_items TEXT NOT NULL,
                    available_items TEXT NOT NULL
                 );",
            )
            .expect("legacy schema");
        }

        let db = Db::new(path).expect("migrate");
        let columns: Vec<String> = db
            .with_connection(|conn| {
                let mut stmt = conn
                    .prepare("PRAGMA table_info(verification_sessions)")
                    .map_err(|err| TrackError::storage("pragma", err))?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(1))
                    .map_err(|err| TrackError::storage("pragma", err))?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|err| TrackError::storage("pragma", err))?;
                Ok(rows)
            })
            .expect("columns");
        assert!(columns.iter().any(|name| name == "verified_by"));
        assert!(columns.iter().any(|name| name == "available_matches"));
    }
}
