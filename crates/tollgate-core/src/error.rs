//! Engine error taxonomy

use thiserror::Error;
use tollgate_api::{ErrorCode, ErrorInfo, SessionDetail, TerminationReason};
use tollgate_store::StoreError;
use tollgate_util::{AccountId, PlanId, SessionKey};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Plan not found: {0}")]
    PlanNotFound(PlanId),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Account {account_id} is blocked")]
    AccountBlocked {
        account_id: AccountId,
        reason: Option<String>,
    },

    /// Carries the session already holding the id
    #[error("Session id already has an active session")]
    ActiveSessionExists(Box<SessionDetail>),

    #[error("Session {key} is not active")]
    NotActive {
        key: SessionKey,
        reason: Option<TerminationReason>,
    },

    #[error("Session {0} kept changing underneath the update; retry")]
    Contended(SessionKey),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The report was applied and it ended the session
    #[error("Session ended: {reason}")]
    ExpiredNow {
        reason: TerminationReason,
        detail: Box<SessionDetail>,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type SessionResult<T> = Result<T, SessionError>;

impl SessionError {
    pub fn invalid(message: impl Into<String>) -> Self {
        SessionError::InvalidInput(message.into())
    }

    /// Stable failure category for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::AccountNotFound(_)
            | SessionError::PlanNotFound(_)
            | SessionError::SessionNotFound(_)
            | SessionError::Store(StoreError::MissingAccount(_)) => ErrorCode::NotFound,
            SessionError::AccountBlocked { .. } => ErrorCode::Forbidden,
            SessionError::ActiveSessionExists(_) | SessionError::Contended(_) => {
                ErrorCode::Conflict
            }
            SessionError::NotActive { .. } => ErrorCode::InvalidState,
            SessionError::InvalidInput(_) => ErrorCode::InvalidInput,
            SessionError::ExpiredNow { .. } => ErrorCode::ExpiredNow,
            SessionError::Store(StoreError::Serialization(_)) => ErrorCode::InternalError,
            SessionError::Store(_) => ErrorCode::Unavailable,
        }
    }

    /// Session the caller needs to act on, if any
    pub fn session(&self) -> Option<&SessionDetail> {
        match self {
            SessionError::ActiveSessionExists(detail) => Some(detail.as_ref()),
            SessionError::ExpiredNow { detail, .. } => Some(detail.as_ref()),
            _ => None,
        }
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        let message = match self {
            SessionError::AccountBlocked {
                reason: Some(reason),
                ..
            } => format!("{}: {}", self, reason),
            SessionError::NotActive {
                reason: Some(reason),
                ..
            } => format!("{} (ended: {})", self, reason),
            _ => self.to_string(),
        };

        let info = ErrorInfo::new(self.code(), message);
        match self.session() {
            Some(detail) => info.with_session(detail.clone()),
            None => info,
        }
    }
}
