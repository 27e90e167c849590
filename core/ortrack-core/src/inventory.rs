//! Name-keyed index over inventory instances.
//!
//! Used in two places: the in-memory catalog keeps the whole inventory in one,
//! and the reconcilers build one over the items detected in the room to group
//! them by name. Insertion order is preserved per name, which is what makes
//! "the first N found instances" deterministic.

use std::collections::{HashMap, HashSet};

use crate::types::{InventoryItem, ItemKind, ItemStatus, TagLink};

#[derive(Debug, Clone, Default)]
pub struct InventoryIndex {
    items: Vec<InventoryItem>,
    by_key: HashMap<(ItemKind, i64), usize>,
    by_name: HashMap<(ItemKind, String), Vec<usize>>,
    name_order: Vec<(ItemKind, String)>,
}

impl InventoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a InventoryItem>) -> Self {
        let mut index = Self::new();
        for item in items {
            index.insert(item.clone());
        }
        index
    }

    /// Inserts an item, replacing any existing instance with the same identity.
    pub fn insert(&mut self, item: InventoryItem) {
        if let Some(&slot) = self.by_key.get(&item.key()) {
            let previous_name = self.items[slot].name.clone();
            if previous_name != item.name {
                if let Some(slots) = self.by_name.get_mut(&(item.kind, previous_name)) {
                    slots.retain(|existing| *existing != slot);
                }
                self.push_name(item.kind, &item.name, slot);
            }
            self.items[slot] = item;
            return;
        }

        let slot = self.items.len();
        self.by_key.insert(item.key(), slot);
        self.push_name(item.kind, &item.name, slot);
        self.items.push(item);
    }

    fn push_name(&mut self, kind: ItemKind, name: &str, slot: usize) {
        let key = (kind, name.to_string());
        let slots = self.by_name.entry(key.clone()).or_default();
        if slots.is_empty() && !self.name_order.contains(&key) {
            self.name_order.push(key);
        }
        slots.push(slot);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, kind: ItemKind, id: i64) -> Option<&InventoryItem> {
        self.by_key.get(&(kind, id)).map(|slot| &self.items[*slot])
    }

    pub fn contains(&self, kind: ItemKind, id: i64) -> bool {
        self.by_key.contains_key(&(kind, id))
    }

    /// Returns false when the item is unknown.
    pub fn set_status(&mut self, kind: ItemKind, id: i64, status: ItemStatus) -> bool {
        match self.by_key.get(&(kind, id)) {
            Some(&slot) => {
                self.items[slot].status = status;
                true
            }
            None => false,
        }
    }

    /// Instances with this name, in insertion order.
    pub fn instances(&self, kind: ItemKind, name: &str) -> Vec<&InventoryItem> {
        self.by_name
            .get(&(kind, name.to_string()))
            .map(|slots| slots.iter().map(|slot| &self.items[*slot]).collect())
            .unwrap_or_default()
    }

    /// Distinct names of this kind, in first-seen order.
    pub fn names(&self, kind: ItemKind) -> Vec<&str> {
        self.name_order
            .iter()
            .filter(|(candidate, name)| {
                *candidate == kind
                    && self
                        .by_name
                        .get(&(kind, name.clone()))
                        .map(|slots| !slots.is_empty())
                        .unwrap_or(false)
            })
            .map(|(_, name)| name.as_str())
            .collect()
    }

    pub fn ids(&self, kind: ItemKind) -> Vec<i64> {
        self.items
            .iter()
            .filter(|item| item.kind == kind)
            .map(|item| item.id)
            .collect()
    }

    pub fn items(&self, kind: ItemKind) -> impl Iterator<Item = &InventoryItem> {
        self.items.iter().filter(move |item| item.kind == kind)
    }

    /// Available instances with this name, skipping `exclude_ids`.
    pub fn available_by_name(
        &self,
        kind: ItemKind,
        name: &str,
        exclude_ids: &[i64],
    ) -> Vec<&InventoryItem> {
        let excluded: HashSet<i64> = exclude_ids.iter().copied().collect();
        self.instances(kind, name)
            .into_iter()
            .filter(|item| item.status == ItemStatus::Available && !excluded.contains(&item.id))
            .collect()
    }

    /// Resolves which instances carry `tag_id`.
    pub fn link_for_tag(&self, tag_id: &str) -> TagLink {
        let carries = |item: &&InventoryItem| item.tag_id.as_deref() == Some(tag_id);

        TagLink {
            instrument: self
                .items(ItemKind::Instrument)
                .find(carries)
                .map(|instrument| instrument.id),
            trays: self
                .items(ItemKind::Tray)
                .filter(carries)
                .map(|tray| tray.id)
                .collect(),
        }
    }
}

/// Items resolved as physically present, split by kind, in detection order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresentItems {
    pub instruments: Vec<InventoryItem>,
    pub trays: Vec<InventoryItem>,
}

impl PresentItems {
    pub fn of(&self, kind: ItemKind) -> &[InventoryItem] {
        match kind {
            ItemKind::Instrument => &self.instruments,
            ItemKind::Tray => &self.trays,
        }
    }

    pub fn push(&mut self, item: InventoryItem) {
        match item.kind {
            ItemKind::Instrument => self.instruments.push(item),
            ItemKind::Tray => self.trays.push(item),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty() && self.trays.is_empty()
    }

    pub fn len(&self) -> usize {
        self.instruments.len() + self.trays.len()
    }

    pub fn index(&self) -> InventoryIndex {
        InventoryIndex::from_items(self.instruments.iter().chain(self.trays.iter()))
    }
}
