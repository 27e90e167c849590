//! Operation session state machine.
//!
//! ```text
//! scheduled ──> in_progress ──> completed ──> verified
//!     │              │              │            │
//!     └──> cancelled <┘              └── outbound check ──┴──> verified | outbound_cleared
//! ```
//!
//! Manual advancement covers the forward path and cancellation. The outbound
//! transitions are reachable only through an outbound check, from
//! `completed` or `verified`. `outbound_cleared` and `cancelled` are terminal.

use crate::error::{Result, TrackError};
use crate::types::OperationState;

/// Whether a manual `advance` from `from` to `to` is allowed.
pub fn can_transition(from: OperationState, to: OperationState) -> bool {
    use OperationState::*;
    matches!(
        (from, to),
        (Scheduled, InProgress)
            | (InProgress, Completed)
            | (Completed, Verified)
            | (Scheduled, Cancelled)
            | (InProgress, Cancelled)
    )
}

pub fn transition(from: OperationState, to: OperationState) -> Result<OperationState> {
    if can_transition(from, to) {
        Ok(to)
    } else {
        Err(TrackError::InvalidTransition { from, to })
    }
}

/// Outbound checks may only run once the procedure is over.
pub fn outbound_allowed(state: OperationState) -> bool {
    matches!(state, OperationState::Completed | OperationState::Verified)
}

/// Target state after an outbound check.
pub fn outbound_transition(from: OperationState, room_cleared: bool) -> Result<OperationState> {
    if !outbound_allowed(from) {
        return Err(TrackError::OutboundNotAllowed { state: from });
    }
    Ok(if room_cleared {
        OperationState::OutboundCleared
    } else {
        OperationState::Verified
    })
}

pub fn is_terminal(state: OperationState) -> bool {
    matches!(
        state,
        OperationState::OutboundCleared | OperationState::Cancelled
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use OperationState::*;

    const ALL: [OperationState; 6] = [
        Scheduled,
        InProgress,
        Completed,
        Verified,
        OutboundCleared,
        Cancelled,
    ];

    #[test]
    fn forward_path_is_allowed() {
        assert_eq!(transition(Scheduled, InProgress).ok(), Some(InProgress));
        assert_eq!(transition(InProgress, Completed).ok(), Some(Completed));
        assert_eq!(transition(Completed, Verified).ok(), Some(Verified));
    }

    #[test]
    fn cancellation_only_before_completion() {
        assert!(can_transition(Scheduled, Cancelled));
        assert!(can_transition(InProgress, Cancelled));
        assert!(!can_transition(Completed, Cancelled));
        assert!(!can_transition(Verified, Cancelled));
    }

    #[test]
    fn terminal_states_go_nowhere() {
        for from in [OutboundCleared, Cancelled] {
            assert!(is_terminal(from));
            for to in ALL {
                assert!(!can_transition(from, to), "{:?} -> {:?}", from, to);
            }
        }
    }

    #[test]
    fn outbound_cleared_is_not_reachable_manually() {
        for from in ALL {
            assert!(!can_transition(from, OutboundCleared));
        }
    }

    #[test]
    fn skipping_ahead_is_rejected() {
        let err = transition(Scheduled, Completed).expect_err("skip");
        assert!(matches!(
            err,
            TrackError::InvalidTransition {
                from: Scheduled,
                to: Completed
            }
        ));
    }

    #[test]
    fn outbound_routes_by_clearance() {
        assert_eq!(outbound_transition(Completed, false).ok(), Some(Verified));
        assert_eq!(outbound_transition(Verified, false).ok(), Some(Verified));
        assert_eq!(
            outbound_transition(Completed, true).ok(),
            Some(OutboundCleared)
        );
        assert_eq!(
            outbound_transition(Verified, true).ok(),
            Some(OutboundCleared)
        );
    }

    #[test]
    fn outbound_rejected_outside_completed_or_verified() {
        for from in [Scheduled, InProgress, OutboundCleared, Cancelled] {
            let err = outbound_transition(from, true).expect_err("rejected");
            assert!(matches!(err, TrackError::OutboundNotAllowed { state } if state == from));
        }
    }
}
