//! Store trait definitions

use tollgate_api::{Account, AccountMirror, AccountProfile, AccountStats, Plan, Session};
use tollgate_util::{AccountId, PlanId, SessionId, SessionKey};

use crate::{AuditEvent, StoreResult};

/// Main store trait
///
/// Session writes are guarded by the row's `version`: a write carrying
/// `session.version = n` is only applied when the stored row is at `n - 1`.
pub trait Store: Send + Sync {
    // Audit log

    /// Append an audit event
    fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    /// Get recent audit events, newest first
    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    // Plan catalog

    fn get_plan(&self, plan_id: &PlanId) -> StoreResult<Option<Plan>>;

    /// Create or replace a plan template
    fn upsert_plan(&self, plan: &Plan) -> StoreResult<()>;

    // Account directory

    fn get_account(&self, account_id: &AccountId) -> StoreResult<Option<Account>>;

    /// Create an account or update its identity fields, leaving the mirror alone
    fn upsert_account(&self, profile: &AccountProfile) -> StoreResult<()>;

    /// Returns false when the account does not exist
    fn set_account_blocked(
        &self,
        account_id: &AccountId,
        blocked: bool,
        reason: Option<&str>,
    ) -> StoreResult<bool>;

    /// Overwrite an account's session mirror.
    ///
    /// `key` is the session the mirror points at. Returns false when the
    /// account does not exist.
    fn set_session_pointer(
        &self,
        account_id: &AccountId,
        key: Option<SessionKey>,
        mirror: &AccountMirror,
    ) -> StoreResult<bool>;

    // Sessions

    /// Insert a freshly admitted session and point its account's mirror at
    /// it, in one transaction
    fn insert_session(&self, session: &Session, mirror: &AccountMirror)
    -> StoreResult<AdmitOutcome>;

    /// Persist a session transition.
    ///
    /// When the session is no longer active, the owning account's
    /// `is_session_active` is cleared in the same transaction (if the mirror
    /// still points at this session). Returns false when the stored version
    /// moved on.
    fn commit_session(&self, session: &Session) -> StoreResult<bool>;

    fn get_session(&self, key: SessionKey) -> StoreResult<Option<Session>>;

    /// Most recently started session carrying this caller-supplied id
    fn find_session(&self, session_id: &SessionId) -> StoreResult<Option<Session>>;

    /// Active sessions, newest start first
    fn list_active_sessions(&self, offset: u64, limit: u32) -> StoreResult<Vec<Session>>;

    fn count_active_sessions(&self) -> StoreResult<u64>;

    /// All active sessions, for the sweep
    fn all_active_sessions(&self) -> StoreResult<Vec<Session>>;

    /// An account's sessions, newest start first
    fn list_account_sessions(
        &self,
        account_id: &AccountId,
        active: Option<bool>,
        offset: u64,
        limit: u32,
    ) -> StoreResult<Vec<Session>>;

    fn count_account_sessions(
        &self,
        account_id: &AccountId,
        active: Option<bool>,
    ) -> StoreResult<u64>;

    /// Commit a batch of sweep terminations and repair stale account mirrors,
    /// in one transaction. Sessions whose version moved on are skipped.
    fn commit_sweep(&self, ended: &[Session]) -> StoreResult<SweepCommit>;

    fn account_stats(&self, account_id: &AccountId) -> StoreResult<AccountStats>;

    // Health

    /// Check if store is healthy
    fn is_healthy(&self) -> bool;
}

/// Result of inserting a new session
#[derive(Debug, Clone, PartialEq)]
pub enum AdmitOutcome {
    Inserted,
    /// Another active session already holds this session id
    ActiveExists(Box<Session>),
}

/// What a sweep transaction actually wrote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepCommit {
    pub ended: Vec<SessionKey>,
    pub accounts_repaired: usize,
}
