//! Pre-operative verification: is everything the procedure needs in the room?
//!
//! Matching is by name and quantity. For each required `(name, count)`:
//!
//! ```text
//! candidates = previous used ids (cumulative only) ∪ found ids, in that order
//! used       = first `count` candidates
//! extra      = remaining candidates          (surplus beyond the count)
//! missing    = count - |used|                (quantity only, no ids)
//! available  = up to `missing` available instances elsewhere with the name
//! ```
//!
//! Found names that are not required at all go to `extra` wholesale. The
//! result is `valid` iff nothing is missing; `invalid` is never produced here.

use std::collections::HashSet;

use crate::inventory::PresentItems;
use crate::requirements::RequirementSpec;
use crate::types::{
    AvailableMatches, ItemEntry, ItemKind, ReconciliationBucket, VerificationState,
};
use ortrack_protocol::{available_match_key, AvailableMatch};

/// Outcome of one verification pass; also the carried state between
/// cumulative passes.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationState {
    pub state: VerificationState,
    pub used: ReconciliationBucket,
    pub missing: ReconciliationBucket,
    pub extra: ReconciliationBucket,
    pub available: ReconciliationBucket,
    pub available_matches: AvailableMatches,
}

impl Default for ReconciliationState {
    fn default() -> Self {
        Self {
            state: VerificationState::Incomplete,
            used: ReconciliationBucket::default(),
            missing: ReconciliationBucket::default(),
            extra: ReconciliationBucket::default(),
            available: ReconciliationBucket::default(),
            available_matches: AvailableMatches::new(),
        }
    }
}

impl ReconciliationState {
    pub fn is_valid(&self) -> bool {
        self.state == VerificationState::Valid
    }

    /// Every `(kind, id)` placed in the used bucket.
    pub fn used_keys(&self) -> Vec<(ItemKind, i64)> {
        ItemKind::ALL
            .into_iter()
            .flat_map(|kind| {
                self.used
                    .group(kind)
                    .values()
                    .flat_map(move |entry| entry.ids.iter().map(move |id| (kind, *id)))
            })
            .collect()
    }
}

/// Looks up available substitutes: `(kind, name, exclude_ids) -> ids`.
pub type AvailabilityLookup<'a> = dyn FnMut(ItemKind, &str, &[i64]) -> Vec<i64> + 'a;

pub fn verify(
    required: &RequirementSpec,
    present: &PresentItems,
    previous: Option<&ReconciliationState>,
    cumulative: bool,
    lookup_available: &mut AvailabilityLookup<'_>,
) -> ReconciliationState {
    let previous = if cumulative { previous } else { None };
    let found = present.index();
    let mut result = ReconciliationState::default();

    for kind in ItemKind::ALL {
        let found_ids = found.ids(kind);
        let prior_ids = previous
            .map(|state| state.used.all_ids(kind))
            .unwrap_or_default();
        let mut excluded: Vec<i64> = found_ids.clone();
        excluded.extend(prior_ids.iter().copied().filter(|id| !found_ids.contains(id)));

        for (name, &required_qty) in required.required(kind) {
            let mut candidates: Vec<i64> = previous
                .and_then(|state| state.used.entry(kind, name))
                .map(|entry| entry.ids.clone())
                .unwrap_or_default();
            let mut seen: HashSet<i64> = candidates.iter().copied().collect();
            for item in found.instances(kind, name) {
                if seen.insert(item.id) {
                    candidates.push(item.id);
                }
            }

            let split = candidates.len().min(required_qty as usize);
            let surplus = candidates.split_off(split);
            let used = candidates;
            let missing_qty = required_qty.saturating_sub(used.len() as u32);

            if !used.is_empty() {
                result.used.insert(kind, name, ItemEntry::from_ids(used));
            }
            if !surplus.is_empty() {
                result.extra.insert(kind, name, ItemEntry::from_ids(surplus));
            }
            if missing_qty > 0 {
                result
                    .missing
                    .insert(kind, name, ItemEntry::count_only(missing_qty));

                let mut substitutes = lookup_available(kind, name, &excluded);
                substitutes.truncate(missing_qty as usize);
                if !substitutes.is_empty() {
                    result.available_matches.insert(
                        available_match_key(kind, name),
                        AvailableMatch {
                            missing_qty,
                            available_qty: substitutes.len() as u32,
                            available_ids: substitutes.clone(),
                        },
                    );
                    result
                        .available
                        .insert(kind, name, ItemEntry::from_ids(substitutes));
                }
            }
        }

        for name in found.names(kind) {
            if required.count(kind, name).is_some() {
                continue;
            }
            let ids = found
                .instances(kind, name)
                .iter()
                .map(|item| item.id)
                .collect();
            result.extra.insert(kind, name, ItemEntry::from_ids(ids));
        }
    }

    result.state = if result.missing.is_empty() {
        VerificationState::Valid
    } else {
        VerificationState::Incomplete
    };
    result
}
