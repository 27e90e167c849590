//! Catalog import from a JSON fixture.
//!
//! ```json
//! {
//!   "tags": [{"tag_id": "E200..01"}],
//!   "instruments": [{"id": 1, "name": "Scalpel", "tag": "E200..01"}],
//!   "trays": [{"id": 5, "name": "Basic Tray", "tag": "T1"}],
//!   "operation_types": [{"id": 1, "name": "Appendectomy",
//!                        "requirements": {"instruments": {"Scalpel": 2}}}],
//!   "operation_sessions": [{"id": 1, "operation_type_id": 1,
//!                           "scheduled_time": "2024-05-01T08:00:00Z", "room": "OR-3"}]
//! }
//! ```
//!
//! Import is an upsert inside one transaction: re-importing the same file is a
//! no-op, and a rejected record rolls back the whole file. Tags referenced by
//! items but not listed are registered automatically.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use ortrack_core::{
    ItemKind, ItemStatus, OperationState, RequirementSpec, Result, TagStatus, TrackError,
};

use crate::db::{format_time, to_json, Db};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogSeed {
    #[serde(default)]
    pub tags: Vec<TagSeed>,
    #[serde(default)]
    pub instruments: Vec<ItemSeed>,
    #[serde(default)]
    pub trays: Vec<ItemSeed>,
    #[serde(default)]
    pub operation_types: Vec<OperationTypeSeed>,
    #[serde(default)]
    pub operation_sessions: Vec<OperationSessionSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagSeed {
    pub tag_id: String,
    #[serde(default = "default_tag_status")]
    pub status: TagStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemSeed {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_item_status")]
    pub status: ItemStatus,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationTypeSeed {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub requirements: RequirementSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationSessionSeed {
    pub id: i64,
    pub operation_type_id: i64,
    #[serde(default = "default_operation_state")]
    pub state: OperationState,
    pub scheduled_time: DateTime<Utc>,
    #[serde(default)]
    pub room: Option<String>,
}

fn default_tag_status() -> TagStatus {
    TagStatus::Active
}

fn default_item_status() -> ItemStatus {
    ItemStatus::Available
}

fn default_operation_state() -> OperationState {
    OperationState::Scheduled
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub tags: usize,
    pub instruments: usize,
    pub trays: usize,
    pub operation_types: usize,
    pub operation_sessions: usize,
}

pub fn load_seed(path: &Path) -> Result<CatalogSeed> {
    let content = fs_err::read_to_string(path).map_err(|source| TrackError::Io {
        context: format!("reading catalog seed {}", path.display()),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| TrackError::Json {
        context: format!("parsing catalog seed {}", path.display()),
        source,
    })
}

impl Db {
    pub fn import_seed(&self, seed: &CatalogSeed) -> Result<ImportSummary> {
        let summary = self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| TrackError::storage("Failed to begin import", err))?;
            let mut summary = ImportSummary::default();

            for tag in &seed.tags {
                upsert_tag(&tx, &tag.tag_id, Some(tag.status))?;
                summary.tags += 1;
            }
            for item in &seed.instruments {
                upsert_item(&tx, ItemKind::Instrument, item)?;
                summary.instruments += 1;
            }
            for item in &seed.trays {
                upsert_item(&tx, ItemKind::Tray, item)?;
                summary.trays += 1;
            }
            for operation_type in &seed.operation_types {
                tx.execute(
                    "INSERT INTO operation_types (id, name, requirements) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(id) DO UPDATE SET \
                        name = excluded.name, \
                        requirements = excluded.requirements",
                    params![
                        operation_type.id,
                        operation_type.name,
                        to_json(&operation_type.requirements.to_value(), "requirements")?
                    ],
                )
                .map_err(|err| TrackError::storage("Failed to import operation type", err))?;
                summary.operation_types += 1;
            }
            for session in &seed.operation_sessions {
                tx.execute(
                    "INSERT INTO operation_sessions \
                        (id, operation_type_id, state, scheduled_time, room) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(id) DO UPDATE SET \
                        operation_type_id = excluded.operation_type_id, \
                        state = excluded.state, \
                        scheduled_time = excluded.scheduled_time, \
                        room = excluded.room",
                    params![
                        session.id,
                        session.operation_type_id,
                        session.state.as_str(),
                        format_time(&session.scheduled_time),
                        session.room
                    ],
                )
                .map_err(|err| TrackError::storage("Failed to import operation session", err))?;
                summary.operation_sessions += 1;
            }

            tx.commit()
                .map_err(|err| TrackError::storage("Failed to commit import", err))?;
            Ok(summary)
        })?;

        info!(
            tags = summary.tags,
            instruments = summary.instruments,
            trays = summary.trays,
            operation_types = summary.operation_types,
            operation_sessions = summary.operation_sessions,
            "Catalog imported"
        );
        Ok(summary)
    }
}

/// `status` of `None` registers the tag without touching an existing status.
fn upsert_tag(tx: &Transaction<'_>, tag_id: &str, status: Option<TagStatus>) -> Result<()> {
    match status {
        Some(status) => tx.execute(
            "INSERT INTO rfid_tags (tag_id, status) VALUES (?1, ?2) \
             ON CONFLICT(tag_id) DO UPDATE SET status = excluded.status",
            params![tag_id, status.as_str()],
        ),
        None => tx.execute(
            "INSERT OR IGNORE INTO rfid_tags (tag_id) VALUES (?1)",
            params![tag_id],
        ),
    }
    .map_err(|err| TrackError::storage("Failed to import tag", err))?;
    Ok(())
}

fn upsert_item(tx: &Transaction<'_>, kind: ItemKind, item: &ItemSeed) -> Result<()> {
    if let Some(tag_id) = &item.tag {
        upsert_tag(tx, tag_id, None)?;

        if kind == ItemKind::Instrument {
            let holder: Option<i64> = tx
                .query_row(
                    "SELECT id FROM items WHERE kind = 'instrument' AND tag_id = ?1 AND id != ?2",
                    params![tag_id, item.id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| TrackError::storage("Failed to check tag link", err))?;
            if let Some(instrument_id) = holder {
                return Err(TrackError::TagAlreadyLinked {
                    tag_id: tag_id.clone(),
                    instrument_id,
                });
            }
        }
    }

    tx.execute(
        "INSERT INTO items (kind, id, name, status, tag_id) VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(kind, id) DO UPDATE SET \
            name = excluded.name, \
            status = excluded.status, \
            tag_id = excluded.tag_id",
        params![
            kind.as_str(),
            item.id,
            item.name,
            item.status.as_str(),
            item.tag
        ],
    )
    .map_err(|err| TrackError::storage(format!("Failed to import {}", kind.as_str()), err))?;
    Ok(())
}
