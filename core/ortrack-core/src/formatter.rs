//! Projects reconciliation buckets into the tab lists shown to operators.
//!
//! Pure; nothing here reads a collaborator or mutates state.

use std::collections::BTreeMap;

use ortrack_protocol::{OutboundReport, TabGroup, TabItem, Tabs, VerificationReport};

use crate::types::{
    ItemKind, OperationState, OutboundCheck, ReconciliationBucket, VerificationSession,
};
use crate::verification::ReconciliationState;

/// Flattens a bucket, instruments first, names in bucket order.
pub fn format_items(bucket: &ReconciliationBucket) -> Vec<TabItem> {
    ItemKind::ALL
        .into_iter()
        .flat_map(|kind| {
            bucket.group(kind).iter().map(move |(name, entry)| TabItem {
                name: name.clone(),
                kind,
                quantity: entry.quantity,
            })
        })
        .collect()
}

/// `required` is everything asked for: present quantities plus missing ones.
pub fn format_tabs(state: &ReconciliationState) -> Tabs {
    let mut required: BTreeMap<(ItemKind, String), u32> = BTreeMap::new();
    for bucket in [&state.used, &state.missing] {
        for item in format_items(bucket) {
            *required.entry((item.kind, item.name)).or_insert(0) += item.quantity;
        }
    }

    Tabs {
        present: TabGroup::new(format_items(&state.used)),
        missing: TabGroup::new(format_items(&state.missing)),
        extra: TabGroup::new(format_items(&state.extra)),
        required: TabGroup::new(
            required
                .into_iter()
                .map(|((kind, name), quantity)| TabItem {
                    name,
                    kind,
                    quantity,
                })
                .collect(),
        ),
    }
}

pub fn verification_report(session: &VerificationSession) -> VerificationReport {
    VerificationReport {
        verification_id: session.id,
        operation_session_id: session.operation_session_id,
        state: session.state,
        tabs: format_tabs(&session.reconciliation()),
        used_items: session.used_items.clone(),
        missing_items: session.missing_items.clone(),
        extra_items: session.extra_items.clone(),
        available_items: session.available_items.clone(),
        available_matches: session.available_matches.clone(),
    }
}

pub fn outbound_report(
    check: &OutboundCheck,
    used_items: &ReconciliationBucket,
    session_state: OperationState,
    scan_time: Option<chrono::DateTime<chrono::Utc>>,
) -> OutboundReport {
    OutboundReport {
        operation_session_id: check.operation_session_id,
        outbound_check_id: check.id,
        room_cleared: check.room_cleared,
        check_time: check.check_time,
        remaining_items: check.remaining_items.clone(),
        extra_items: check.extra_items.clone(),
        used_items: used_items.clone(),
        scan_time,
        checked_by: check.checked_by.clone(),
        session_state,
    }
}
