//! Events derived from engine results

use tollgate_api::{EventPayload, Session, SweepSummary, TerminatedBy, TerminationReason};

/// Event for a freshly admitted session
pub fn admitted_event(session: &Session) -> EventPayload {
    EventPayload::SessionAdmitted {
        key: session.key,
        session_id: session.session_id.clone(),
        account_id: session.account_id.clone(),
        plan_id: session.plan_id.clone(),
        plan_expiry_time: session.plan_expiry_time,
    }
}

/// Event for a session that is no longer active; None while it still is
pub fn ended_event(session: &Session) -> Option<EventPayload> {
    if session.is_active {
        return None;
    }
    Some(EventPayload::SessionEnded {
        key: session.key,
        session_id: session.session_id.clone(),
        account_id: session.account_id.clone(),
        reason: session
            .termination_reason
            .unwrap_or(TerminationReason::System),
        terminated_by: session.terminated_by.unwrap_or(TerminatedBy::System),
        expired: session.is_expired,
    })
}

/// Result of a sweep pass
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub summary: SweepSummary,
    /// Final state of every session the pass ended
    pub ended: Vec<Session>,
}

impl SweepReport {
    /// Events to broadcast for this pass; empty when nothing changed
    pub fn events(&self) -> Vec<EventPayload> {
        if self.summary == SweepSummary::default() {
            return Vec::new();
        }
        self.ended
            .iter()
            .filter_map(ended_event)
            .chain(std::iter::once(EventPayload::SweepCompleted(self.summary)))
            .collect()
    }
}
