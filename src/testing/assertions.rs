//! Assertions over session state.

use crate::session::{Session, TerminalReason};
use crate::validator::ValidationAction;

/// Assert the structural invariants every session must hold.
///
/// # Panics
///
/// Panics with a description of the first violated invariant.
pub fn assert_session_invariants(session: &Session) {
    assert!(
        session.total_iterations() <= session.max_iterations,
        "session {} has {} iterations, budget is {}",
        session.session_id,
        session.total_iterations(),
        session.max_iterations
    );

    for (position, iteration) in session.iterations.iter().enumerate() {
        assert_eq!(
            iteration.index as usize,
            position + 1,
            "iteration indices must be 1-based and contiguous"
        );
    }

    match session.terminal_reason {
        Some(TerminalReason::QualityThresholdMet) => {
            let Some(last) = session.last_iteration() else {
                panic!("successful session {} has no iterations", session.session_id);
            };
            assert!(
                last.report.score >= session.quality_threshold,
                "success with score {} below threshold {}",
                last.report.score,
                session.quality_threshold
            );
            assert_eq!(last.decision.action, ValidationAction::TerminateSuccess);
        }
        Some(TerminalReason::MaxIterationsReached) => {
            assert_eq!(
                session.total_iterations(),
                session.max_iterations,
                "max_iterations_reached with spare budget"
            );
            let Some(last) = session.last_iteration() else {
                panic!("exhausted session {} has no iterations", session.session_id);
            };
            assert!(last.report.score < session.quality_threshold);
        }
        _ => {}
    }

    if session.terminal_reason.is_some() {
        assert!(session.is_terminal(), "terminal reason set on a live session");
    }
    if session.is_terminal() {
        assert!(session.terminal_reason.is_some(), "terminal session without reason");
        assert!(session.finished_at.is_some(), "terminal session without finish time");
    }
}

/// Assert a session ended with `reason`.
///
/// # Panics
///
/// Panics if the session is live or ended differently.
pub fn assert_terminated_with(session: &Session, reason: TerminalReason) {
    assert_eq!(
        session.terminal_reason,
        Some(reason),
        "session {} ended as {:?} (status {}), expected {}",
        session.session_id,
        session.terminal_reason,
        session.status,
        reason
    );
    assert_eq!(session.status, reason.status());
}
