//! Post-operative room check.
//!
//! Matching is strictly by instance identity: an instance is "remaining" only
//! if its exact `(kind, id)` was recorded as used during verification. A
//! same-name substitute lying in the room is extra, never remaining.

use std::collections::BTreeSet;

use crate::inventory::PresentItems;
use crate::types::{ItemKind, ReconciliationBucket};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundOutcome {
    pub remaining: ReconciliationBucket,
    pub extra: ReconciliationBucket,
    /// True iff nothing used is still present. Extras never block clearance.
    pub room_cleared: bool,
}

impl OutboundOutcome {
    /// Every `(kind, id)` still in the room that was used.
    pub fn remaining_keys(&self) -> Vec<(ItemKind, i64)> {
        ItemKind::ALL
            .into_iter()
            .flat_map(|kind| {
                self.remaining
                    .all_ids(kind)
                    .into_iter()
                    .map(move |id| (kind, id))
            })
            .collect()
    }
}

pub fn check_outbound(used: &ReconciliationBucket, present: &PresentItems) -> OutboundOutcome {
    let mut outcome = OutboundOutcome::default();

    for kind in ItemKind::ALL {
        let used_ids: BTreeSet<i64> = used.all_ids(kind);
        for item in present.of(kind) {
            if used_ids.contains(&item.id) {
                outcome.remaining.push_id(kind, &item.name, item.id);
            } else {
                outcome.extra.push_id(kind, &item.name, item.id);
            }
        }
    }

    outcome.room_cleared = outcome.remaining.is_empty();
    outcome
}
