//! Audit event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tollgate_api::{TerminatedBy, TerminationReason};
use tollgate_util::{AccountId, PlanId, SessionId, SessionKey};

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    ServiceStarted,

    ServiceStopped,

    /// Configuration loaded and plans seeded
    ConfigLoaded { plan_count: usize },

    PlanUpserted { plan_id: PlanId },

    AccountUpserted { account_id: AccountId },

    AccountBlocked {
        account_id: AccountId,
        blocked: bool,
        reason: Option<String>,
    },

    SessionAdmitted {
        key: SessionKey,
        session_id: SessionId,
        account_id: AccountId,
        plan_id: PlanId,
        plan_expiry_time: Option<DateTime<Utc>>,
    },

    /// Admission refused for a business reason
    AdmissionDenied {
        session_id: SessionId,
        account_id: AccountId,
        reason: String,
    },

    SessionEnded {
        key: SessionKey,
        session_id: SessionId,
        account_id: AccountId,
        reason: TerminationReason,
        terminated_by: TerminatedBy,
    },

    SweepCompleted {
        reconciled: usize,
        accounts_repaired: usize,
    },

    ClientConnected {
        client_id: String,
        role: String,
        uid: Option<u32>,
    },

    ClientDisconnected { client_id: String },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: i64,

    pub timestamp: DateTime<Utc>,

    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self {
            id: 0, // Will be set by store
            timestamp: tollgate_util::now(),
            event,
        }
    }
}
