//! Event types for tollgated -> client streaming

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tollgate_util::{AccountId, PlanId, SessionId, SessionKey};

use crate::{API_VERSION, SweepSummary, TerminatedBy, TerminationReason};

/// Event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub api_version: u32,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            api_version: API_VERSION,
            timestamp: tollgate_util::now(),
            payload,
        }
    }
}

/// All possible events from the service to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A session was admitted
    SessionAdmitted {
        key: SessionKey,
        session_id: SessionId,
        account_id: AccountId,
        plan_id: PlanId,
        /// None when the plan has no time limit
        plan_expiry_time: Option<DateTime<Utc>>,
    },

    /// A session stopped being active
    SessionEnded {
        key: SessionKey,
        session_id: SessionId,
        account_id: AccountId,
        reason: TerminationReason,
        terminated_by: TerminatedBy,
        expired: bool,
    },

    /// A sweep pass finished with at least one change
    SweepCompleted(SweepSummary),

    /// Service is shutting down
    Shutdown,
}
