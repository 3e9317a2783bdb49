//! Command types for the tollgated protocol

use serde::{Deserialize, Serialize};
use tollgate_util::{AccountId, ClientId, PlanId, SessionId, SessionKey};

use crate::{
    Account, AccountProfile, AccountStats, ClientRole, DeviceInfo, FreeAllowance, HealthStatus,
    NetworkInfo, Page, Plan, SessionDetail, SweepSummary, TerminatedBy, TerminationReason,
    UsageReport, API_VERSION,
};

/// Request wrapper with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for correlation
    pub request_id: u64,
    pub api_version: u32,
    pub command: Command,
}

impl Request {
    pub fn new(request_id: u64, command: Command) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            command,
        }
    }
}

/// Response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Corresponding request ID
    pub request_id: u64,
    pub api_version: u32,
    pub result: ResponseResult,
}

impl Response {
    pub fn success(request_id: u64, payload: ResponsePayload) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Ok(payload),
        }
    }

    pub fn error(request_id: u64, error: ErrorInfo) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok(ResponsePayload),
    Err(ErrorInfo),
}

/// Error information returned to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    /// Session the failure is about: the existing active session on a
    /// conflict, or the final state of a session a report just expired
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Box<SessionDetail>>,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            session: None,
        }
    }

    pub fn with_session(mut self, session: SessionDetail) -> Self {
        self.session = Some(Box::new(session));
        self
    }
}

/// Stable failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Referenced account, plan, or session does not exist
    NotFound,
    /// Account is blocked
    Forbidden,
    /// Duplicate active session, or a lost concurrent update
    Conflict,
    /// Operation not valid for the session's current status
    InvalidState,
    /// Malformed identifiers or usage values
    InvalidInput,
    /// The report was accepted and it ended the session
    ExpiredNow,
    /// Backing store unreachable; retry with the same session id
    Unavailable,
    InvalidRequest,
    PermissionDenied,
    RateLimited,
    Timeout,
    InternalError,
}

impl ErrorCode {
    /// Whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Unavailable | ErrorCode::RateLimited | ErrorCode::Timeout
        )
    }
}

/// Admission input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmitRequest {
    pub account_id: AccountId,
    pub plan_id: PlanId,
    pub session_id: SessionId,
    pub device: DeviceInfo,
    #[serde(default)]
    pub network: NetworkInfo,
    #[serde(default)]
    pub free_allowance: Option<FreeAllowance>,
}

/// All possible commands from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Admit a new session against a plan
    AdmitSession(AdmitRequest),

    /// Report cumulative usage for a session
    ReportUsage {
        key: SessionKey,
        report: UsageReport,
    },

    /// End an active session
    TerminateSession {
        key: SessionKey,
        reason: Option<TerminationReason>,
        /// Defaults to admin
        actor: Option<TerminatedBy>,
    },

    /// Expire every active session past a limit (admin only)
    Sweep,

    GetSession {
        key: SessionKey,
    },

    GetSessionBySessionId {
        session_id: SessionId,
    },

    ListActiveSessions {
        page: Option<u32>,
        limit: Option<u32>,
    },

    ListAccountSessions {
        account_id: AccountId,
        active: Option<bool>,
        page: Option<u32>,
        limit: Option<u32>,
    },

    GetAccountStats {
        account_id: AccountId,
    },

    GetAccount {
        account_id: AccountId,
    },

    // Admin commands

    /// Create or replace a plan template
    UpsertPlan {
        plan: Plan,
    },

    /// Create an account or update its identity fields
    UpsertAccount {
        profile: AccountProfile,
    },

    SetAccountBlocked {
        account_id: AccountId,
        blocked: bool,
        reason: Option<String>,
    },

    /// Subscribe to events (returns immediately, events stream separately)
    SubscribeEvents,

    UnsubscribeEvents,

    GetHealth,

    Ping,
}

impl Command {
    /// Whether the command changes state only an admin may change
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Command::Sweep
                | Command::UpsertPlan { .. }
                | Command::UpsertAccount { .. }
                | Command::SetAccountBlocked { .. }
        )
    }

    /// Whether the command mutates sessions
    pub fn operates_sessions(&self) -> bool {
        matches!(
            self,
            Command::AdmitSession(_)
                | Command::ReportUsage { .. }
                | Command::TerminateSession { .. }
        )
    }

    /// Whether the role may issue this command
    pub fn permitted_for(&self, role: ClientRole) -> bool {
        if self.requires_admin() {
            role.can_administer()
        } else if self.operates_sessions() {
            role.can_operate_sessions()
        } else {
            true
        }
    }
}

/// Response payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    Session(SessionDetail),
    Sessions(Page<SessionDetail>),
    Swept(SweepSummary),
    Stats(AccountStats),
    Account(Account),
    PlanSaved { plan_id: PlanId },
    AccountSaved { account_id: AccountId },
    Subscribed { client_id: ClientId },
    Unsubscribed,
    Health(HealthStatus),
    Pong,
}

/// Client connection info (set by IPC layer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub role: ClientRole,
    /// Unix UID if available
    pub uid: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let req = Request::new(
            7,
            Command::ReportUsage {
                key: SessionKey::new(),
                report: UsageReport {
                    data_used_mb: Some(12.5),
                    ..Default::default()
                },
            },
        );
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"report_usage\""));

        let parsed: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.request_id, 7);
        assert!(matches!(parsed.command, Command::ReportUsage { .. }));
    }

    #[test]
    fn admit_request_defaults_network() {
        let json = r#"{
            "type": "admit_session",
            "account_id": "acct-1",
            "plan_id": "day-pass",
            "session_id": "mt-42",
            "device": { "mac_address": "aa:bb:cc:dd:ee:ff", "ip": "10.0.0.7",
                        "device_id": null, "device_type": null, "model": null,
                        "os": null, "browser": null }
        }"#;
        let command: Command = serde_json::from_str(json).unwrap();
        match command {
            Command::AdmitSession(req) => {
                assert_eq!(req.session_id.as_str(), "mt-42");
                assert_eq!(req.network, NetworkInfo::default());
                assert!(req.free_allowance.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn error_serialization_omits_missing_session() {
        let resp = Response::error(3, ErrorInfo::new(ErrorCode::NotFound, "Session not found"));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("not_found"));
        assert!(!json.contains("\"session\""));
    }

    #[test]
    fn role_permissions() {
        assert!(Command::Sweep.permitted_for(ClientRole::Admin));
        assert!(!Command::Sweep.permitted_for(ClientRole::Gateway));
        assert!(Command::Ping.permitted_for(ClientRole::Observer));

        let terminate = Command::TerminateSession {
            key: SessionKey::new(),
            reason: None,
            actor: None,
        };
        assert!(terminate.permitted_for(ClientRole::Gateway));
        assert!(!terminate.permitted_for(ClientRole::Observer));
    }
}
