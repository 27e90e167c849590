//! Maps detected tag identifiers to the inventory instances they represent.
//!
//! Unknown tags and tags linked to nothing are dropped with a warning; they
//! count neither as present nor as missing. An instance reached through more
//! than one tag read is reported once, at its first detection.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::adapters::Catalog;
use crate::error::Result;
use crate::inventory::PresentItems;
use crate::types::{InventoryItem, ItemKind, RfidTag};

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub present: PresentItems,
    /// Registered tags that were detected, in detection order.
    pub tags: Vec<RfidTag>,
    /// Detected ids with no registered tag.
    pub unknown_tags: Vec<String>,
    /// Registered tags linked to neither an instrument nor a tray.
    pub unlinked_tags: Vec<String>,
}

pub fn resolve(detected_tag_ids: &[String], catalog: &dyn Catalog) -> Result<Resolution> {
    let mut resolution = Resolution::default();
    if detected_tag_ids.is_empty() {
        return Ok(resolution);
    }

    let registered: HashMap<String, RfidTag> = catalog
        .find_by_tag_ids(detected_tag_ids)?
        .into_iter()
        .map(|tag| (tag.tag_id.clone(), tag))
        .collect();

    let mut seen_tags = HashSet::new();
    let mut ordered_keys: Vec<(ItemKind, i64)> = Vec::new();
    let mut seen_keys = HashSet::new();

    for tag_id in detected_tag_ids {
        if !seen_tags.insert(tag_id.as_str()) {
            continue;
        }
        let Some(tag) = registered.get(tag_id) else {
            warn!(tag_id = %tag_id, "RFID tag not found in catalog");
            resolution.unknown_tags.push(tag_id.clone());
            continue;
        };

        if tag.link.is_unlinked() {
            warn!(tag_id = %tag_id, "Tag has no linked instrument or tray");
            resolution.unlinked_tags.push(tag_id.clone());
        }
        let linked = tag
            .link
            .instrument
            .map(|id| (ItemKind::Instrument, id))
            .into_iter()
            .chain(tag.link.trays.iter().map(|id| (ItemKind::Tray, *id)));
        for key in linked {
            if seen_keys.insert(key) {
                ordered_keys.push(key);
            }
        }
        resolution.tags.push(tag.clone());
    }

    let mut fetched: HashMap<(ItemKind, i64), InventoryItem> = HashMap::new();
    for kind in ItemKind::ALL {
        let ids: Vec<i64> = ordered_keys
            .iter()
            .filter(|(candidate, _)| *candidate == kind)
            .map(|(_, id)| *id)
            .collect();
        if ids.is_empty() {
            continue;
        }
        for item in catalog.get_items(kind, &ids)? {
            fetched.insert(item.key(), item);
        }
    }

    for key in ordered_keys {
        match fetched.remove(&key) {
            Some(item) => resolution.present.push(item),
            None => warn!(
                kind = key.0.as_str(),
                id = key.1,
                "Tag links to an item missing from the catalog"
            ),
        }
    }

    debug!(
        detected = detected_tag_ids.len(),
        instruments = resolution.present.instruments.len(),
        trays = resolution.present.trays.len(),
        unknown = resolution.unknown_tags.len(),
        unlinked = resolution.unlinked_tags.len(),
        "Resolved detected tags"
    );

    Ok(resolution)
}
