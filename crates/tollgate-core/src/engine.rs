//! Session lifecycle engine

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tollgate_api::{
    Account, AccountMirror, AccountProfile, AccountStats, AdmitRequest, Page, Plan, PlanSnapshot,
    Session, SessionDetail, SweepSummary, TerminatedBy, TerminationReason, UsageCounters,
    UsageReport,
};
use tollgate_config::EngineConfig;
use tollgate_store::{AdmitOutcome, AuditEvent, AuditEventType, Store, StoreResult};
use tollgate_util::{AccountId, PlanId, SessionId, SessionKey, add_minutes};
use tracing::{debug, info, warn};

use crate::{
    SessionError, SessionResult, SweepReport, apply_usage, end_session, expiry_reason,
    session_detail, validate_admit_request, validate_identifier, validate_usage_report,
};

/// Page size for the active-session listing when the caller gives none
pub const DEFAULT_ACTIVE_PAGE_LIMIT: u32 = 50;

/// Page size for an account's session listing when the caller gives none
pub const DEFAULT_ACCOUNT_PAGE_LIMIT: u32 = 20;

/// Pause between attempts after a transient store failure
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// The session lifecycle engine.
///
/// Stateless apart from the store: every method is safe to call from many
/// threads at once, and calls on different sessions do not contend beyond
/// the store's own locking.
pub struct SessionEngine {
    store: Arc<dyn Store>,
    config: EngineConfig,
}

impl SessionEngine {
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        info!(
            usage_regression = %config.usage_regression,
            report_retry_attempts = config.report_retry_attempts,
            "Session engine initialized"
        );
        Self { store, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn audit(&self, event: AuditEventType) {
        if let Err(e) = self.store.append_audit(AuditEvent::new(event)) {
            warn!(error = %e, "Failed to append audit event");
        }
    }

    /// Run a read (or the sweep) with bounded retries on transient failures
    fn with_retry<T>(&self, op: &str, mut f: impl FnMut() -> StoreResult<T>) -> SessionResult<T> {
        let attempts = self.config.store_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(op, attempt, error = %e, "Transient store failure, retrying");
                    std::thread::sleep(RETRY_BACKOFF * attempt);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn expand(&self, session: Session, now: DateTime<Utc>) -> StoreResult<SessionDetail> {
        let account = self.store.get_account(&session.account_id)?;
        let plan = self.store.get_plan(&session.plan_id)?;
        Ok(session_detail(session, account.as_ref(), plan, now))
    }

    /// Expand after a committed write; lookups failing must not hide the commit
    fn expand_committed(&self, session: Session, now: DateTime<Utc>) -> SessionDetail {
        let account = self.store.get_account(&session.account_id).unwrap_or_else(|e| {
            warn!(error = %e, "Account lookup failed after commit");
            None
        });
        let plan = self.store.get_plan(&session.plan_id).unwrap_or_else(|e| {
            warn!(error = %e, "Plan lookup failed after commit");
            None
        });
        session_detail(session, account.as_ref(), plan, now)
    }

    fn expand_all(
        &self,
        sessions: Vec<Session>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<SessionDetail>> {
        let mut accounts: HashMap<AccountId, Option<Account>> = HashMap::new();
        let mut plans: HashMap<PlanId, Option<Plan>> = HashMap::new();
        let mut details = Vec::with_capacity(sessions.len());

        for session in sessions {
            if !accounts.contains_key(&session.account_id) {
                let account = self.store.get_account(&session.account_id)?;
                accounts.insert(session.account_id.clone(), account);
            }
            if !plans.contains_key(&session.plan_id) {
                let plan = self.store.get_plan(&session.plan_id)?;
                plans.insert(session.plan_id.clone(), plan);
            }
            let account = accounts.get(&session.account_id).and_then(Option::as_ref);
            let plan = plans.get(&session.plan_id).cloned().flatten();
            details.push(session_detail(session, account, plan, now));
        }

        Ok(details)
    }

    // Admission

    /// Admit a new session against a plan
    pub fn admit(&self, request: AdmitRequest, now: DateTime<Utc>) -> SessionResult<SessionDetail> {
        validate_admit_request(&request)?;

        let account = self
            .store
            .get_account(&request.account_id)?
            .ok_or_else(|| SessionError::AccountNotFound(request.account_id.clone()))?;

        if account.is_blocked {
            self.audit(AuditEventType::AdmissionDenied {
                session_id: request.session_id.clone(),
                account_id: request.account_id.clone(),
                reason: "account blocked".into(),
            });
            return Err(SessionError::AccountBlocked {
                account_id: account.account_id,
                reason: account.block_reason,
            });
        }

        let plan = self
            .store
            .get_plan(&request.plan_id)?
            .ok_or_else(|| SessionError::PlanNotFound(request.plan_id.clone()))?;

        let snapshot = PlanSnapshot::of(&plan);
        let plan_expiry_time = snapshot.time_limit_minutes.map(|m| add_minutes(now, m));

        let session = Session {
            key: SessionKey::new(),
            session_id: request.session_id,
            account_id: request.account_id,
            plan_id: request.plan_id,
            snapshot,
            device: request.device.with_defaults(&account.device),
            network: request.network,
            free_allowance: request.free_allowance.unwrap_or_default(),
            session_start_time: now,
            session_end_time: None,
            plan_start_time: now,
            plan_expiry_time,
            usage: UsageCounters::default(),
            is_active: true,
            is_expired: false,
            termination_reason: None,
            terminated_by: None,
            last_activity_time: now,
            last_data_update_time: None,
            version: 0,
        };

        let mirror = AccountMirror {
            is_session_active: true,
            session_id: Some(session.session_id.clone()),
            plan_id: Some(session.plan_id.clone()),
            plan_start_time: Some(now),
            plan_expiry_time,
            ap_mac_address: session.network.ap_mac_address.clone(),
            gateway_ip: session.network.gateway_ip.clone(),
            last_connection_time: Some(now),
        };

        if let AdmitOutcome::ActiveExists(existing) = self.store.insert_session(&session, &mirror)? {
            self.audit(AuditEventType::AdmissionDenied {
                session_id: session.session_id.clone(),
                account_id: session.account_id.clone(),
                reason: "session id already active".into(),
            });
            debug!(
                session_id = %session.session_id,
                existing_key = %existing.key,
                "Admission conflicts with active session"
            );
            let existing = self.expand(*existing, now)?;
            return Err(SessionError::ActiveSessionExists(Box::new(existing)));
        }

        self.audit(AuditEventType::SessionAdmitted {
            key: session.key,
            session_id: session.session_id.clone(),
            account_id: session.account_id.clone(),
            plan_id: session.plan_id.clone(),
            plan_expiry_time,
        });

        info!(
            key = %session.key,
            session_id = %session.session_id,
            account_id = %session.account_id,
            plan_id = %session.plan_id,
            data_limit_mb = ?snapshot.data_limit_mb,
            plan_expiry_time = ?plan_expiry_time,
            "Session admitted"
        );

        Ok(session_detail(session, Some(&account), Some(plan), now))
    }

    // Usage and termination

    /// Apply a cumulative usage report and evaluate expiry.
    ///
    /// When a limit is crossed the counters are still persisted, the session
    /// ends, and the final state comes back as [`SessionError::ExpiredNow`].
    pub fn report_usage(
        &self,
        key: SessionKey,
        report: &UsageReport,
        now: DateTime<Utc>,
    ) -> SessionResult<SessionDetail> {
        validate_usage_report(report)?;

        let attempts = self.config.report_retry_attempts.max(1);
        for attempt in 1..=attempts {
            let current = self
                .store
                .get_session(key)?
                .ok_or_else(|| SessionError::SessionNotFound(key.to_string()))?;

            if !current.is_active {
                return Err(SessionError::NotActive {
                    key,
                    reason: current.termination_reason,
                });
            }

            let mut next = current.clone();
            next.version = current.version + 1;

            // A closed window ends the session whatever the counters say
            let window_closed = current.plan_expiry_time.is_some_and(|expiry| now > expiry);
            if !window_closed {
                apply_usage(&mut next, report, self.config.usage_regression)?;
                next.last_data_update_time = Some(now);
            }
            next.last_activity_time = now;

            let reason = expiry_reason(&next, now);
            if let Some(reason) = reason {
                end_session(&mut next, reason, TerminatedBy::System, true, now);
            }

            if !self.store.commit_session(&next)? {
                debug!(key = %key, attempt, "Usage report lost a race, re-reading");
                continue;
            }

            let Some(reason) = reason else {
                debug!(
                    key = %key,
                    data_used_mb = next.usage.data_used_mb,
                    time_used_minutes = next.usage.time_used_minutes,
                    "Usage recorded"
                );
                return Ok(self.expand_committed(next, now));
            };

            self.record_ended(&next);
            return Err(SessionError::ExpiredNow {
                reason,
                detail: Box::new(self.expand_committed(next, now)),
            });
        }

        warn!(key = %key, attempts, "Usage report kept losing races");
        Err(SessionError::Contended(key))
    }

    /// End an active session on request
    pub fn terminate(
        &self,
        key: SessionKey,
        reason: Option<TerminationReason>,
        actor: Option<TerminatedBy>,
        now: DateTime<Utc>,
    ) -> SessionResult<SessionDetail> {
        let reason = reason.unwrap_or(TerminationReason::Manual);
        let actor = actor.unwrap_or(TerminatedBy::Admin);
        if actor == TerminatedBy::System {
            return Err(SessionError::invalid(
                "terminated_by=system is reserved for automatic expiry",
            ));
        }

        let attempts = self.config.report_retry_attempts.max(1);
        for attempt in 1..=attempts {
            let current = self
                .store
                .get_session(key)?
                .ok_or_else(|| SessionError::SessionNotFound(key.to_string()))?;

            if !current.is_active {
                return Err(SessionError::NotActive {
                    key,
                    reason: current.termination_reason,
                });
            }

            let mut next = current.clone();
            end_session(&mut next, reason, actor, false, now);
            next.version = current.version + 1;

            if self.store.commit_session(&next)? {
                self.record_ended(&next);
                return Ok(self.expand_committed(next, now));
            }
            debug!(key = %key, attempt, "Termination lost a race, re-reading");
        }

        warn!(key = %key, attempts, "Termination kept losing races");
        Err(SessionError::Contended(key))
    }

    fn record_ended(&self, session: &Session) {
        let (Some(reason), Some(terminated_by)) = (session.termination_reason, session.terminated_by)
        else {
            return;
        };

        self.audit(AuditEventType::SessionEnded {
            key: session.key,
            session_id: session.session_id.clone(),
            account_id: session.account_id.clone(),
            reason,
            terminated_by,
        });

        info!(
            key = %session.key,
            session_id = %session.session_id,
            account_id = %session.account_id,
            reason = %reason,
            terminated_by = %terminated_by,
            data_used_mb = session.usage.data_used_mb,
            time_used_minutes = session.usage.time_used_minutes,
            "Session ended"
        );
    }

    // Sweep

    /// Expire every active session past a limit and repair stale account
    /// mirrors, in one store transaction
    pub fn sweep(&self, now: DateTime<Utc>) -> SessionResult<SweepReport> {
        let (due, commit) = self.with_retry("sweep", || {
            let due: Vec<Session> = self
                .store
                .all_active_sessions()?
                .into_iter()
                .filter(|s| expiry_reason(s, now).is_some())
                .map(|mut s| {
                    end_session(&mut s, TerminationReason::Expired, TerminatedBy::System, true, now);
                    s.version += 1;
                    s
                })
                .collect();
            let commit = self.store.commit_sweep(&due)?;
            Ok((due, commit))
        })?;

        let ended: Vec<Session> = due
            .into_iter()
            .filter(|s| commit.ended.contains(&s.key))
            .collect();

        let summary = SweepSummary {
            reconciled: ended.len(),
            accounts_repaired: commit.accounts_repaired,
        };

        if summary == SweepSummary::default() {
            debug!("Sweep found nothing to do");
        } else {
            for session in &ended {
                self.record_ended(session);
            }
            self.audit(AuditEventType::SweepCompleted {
                reconciled: summary.reconciled,
                accounts_repaired: summary.accounts_repaired,
            });
            info!(
                reconciled = summary.reconciled,
                accounts_repaired = summary.accounts_repaired,
                "Sweep completed"
            );
        }

        Ok(SweepReport { summary, ended })
    }

    // Queries

    pub fn get_session(&self, key: SessionKey, now: DateTime<Utc>) -> SessionResult<SessionDetail> {
        let session = self
            .with_retry("get_session", || self.store.get_session(key))?
            .ok_or_else(|| SessionError::SessionNotFound(key.to_string()))?;
        self.with_retry("expand", || self.expand(session.clone(), now))
    }

    /// Most recently started session carrying this caller-supplied id
    pub fn get_session_by_session_id(
        &self,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> SessionResult<SessionDetail> {
        let session = self
            .with_retry("find_session", || self.store.find_session(session_id))?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        self.with_retry("expand", || self.expand(session.clone(), now))
    }

    /// Resolve page/limit to (page, limit, offset)
    fn paging(
        &self,
        page: Option<u32>,
        limit: Option<u32>,
        default_limit: u32,
    ) -> SessionResult<(u32, u32, u64)> {
        let page = page.unwrap_or(1);
        if page == 0 {
            return Err(SessionError::invalid("page starts at 1"));
        }
        let limit = limit.unwrap_or(default_limit);
        if limit == 0 {
            return Err(SessionError::invalid("limit must be positive"));
        }
        let limit = limit.min(self.config.max_page_limit);
        let offset = u64::from(page - 1) * u64::from(limit);
        Ok((page, limit, offset))
    }

    /// Active sessions, newest start first
    pub fn list_active(
        &self,
        page: Option<u32>,
        limit: Option<u32>,
        now: DateTime<Utc>,
    ) -> SessionResult<Page<SessionDetail>> {
        let (page, limit, offset) = self.paging(page, limit, DEFAULT_ACTIVE_PAGE_LIMIT)?;

        let (sessions, total) = self.with_retry("list_active", || {
            let sessions = self.store.list_active_sessions(offset, limit)?;
            let total = self.store.count_active_sessions()?;
            Ok((sessions, total))
        })?;
        let items = self.with_retry("expand", || self.expand_all(sessions.clone(), now))?;

        Ok(Page::new(items, page, limit, total))
    }

    /// An account's sessions, newest start first
    pub fn list_account_sessions(
        &self,
        account_id: &AccountId,
        active: Option<bool>,
        page: Option<u32>,
        limit: Option<u32>,
        now: DateTime<Utc>,
    ) -> SessionResult<Page<SessionDetail>> {
        let (page, limit, offset) = self.paging(page, limit, DEFAULT_ACCOUNT_PAGE_LIMIT)?;

        let (sessions, total) = self.with_retry("list_account_sessions", || {
            let sessions = self
                .store
                .list_account_sessions(account_id, active, offset, limit)?;
            let total = self.store.count_account_sessions(account_id, active)?;
            Ok((sessions, total))
        })?;
        let items = self.with_retry("expand", || self.expand_all(sessions.clone(), now))?;

        Ok(Page::new(items, page, limit, total))
    }

    /// Usage totals over all of an account's sessions; zeros when it has none
    pub fn account_stats(&self, account_id: &AccountId) -> SessionResult<AccountStats> {
        self.with_retry("account_stats", || self.store.account_stats(account_id))
    }

    // Account directory and plan catalog

    pub fn get_account(&self, account_id: &AccountId) -> SessionResult<Account> {
        self.with_retry("get_account", || self.store.get_account(account_id))?
            .ok_or_else(|| SessionError::AccountNotFound(account_id.clone()))
    }

    /// Create or replace a plan template. Running sessions keep their snapshot.
    pub fn upsert_plan(&self, plan: &Plan) -> SessionResult<()> {
        validate_identifier("plan_id", plan.plan_id.as_str())?;
        if plan.name.trim().is_empty() {
            return Err(SessionError::invalid("plan name must not be empty"));
        }

        self.store.upsert_plan(plan)?;
        self.audit(AuditEventType::PlanUpserted {
            plan_id: plan.plan_id.clone(),
        });
        info!(plan_id = %plan.plan_id, active = plan.is_active, "Plan saved");
        Ok(())
    }

    /// Upsert the plans listed in configuration
    pub fn seed_plans(&self, plans: &[Plan]) -> SessionResult<usize> {
        for plan in plans {
            self.upsert_plan(plan)?;
        }
        self.audit(AuditEventType::ConfigLoaded {
            plan_count: plans.len(),
        });
        Ok(plans.len())
    }

    pub fn upsert_account(&self, profile: &AccountProfile) -> SessionResult<()> {
        validate_identifier("account_id", profile.account_id.as_str())?;
        if profile.name.trim().is_empty() {
            return Err(SessionError::invalid("account name must not be empty"));
        }

        self.store.upsert_account(profile)?;
        self.audit(AuditEventType::AccountUpserted {
            account_id: profile.account_id.clone(),
        });
        info!(account_id = %profile.account_id, "Account saved");
        Ok(())
    }

    /// Block or unblock an account. Active sessions are left running.
    pub fn set_account_blocked(
        &self,
        account_id: &AccountId,
        blocked: bool,
        reason: Option<String>,
    ) -> SessionResult<()> {
        if !self
            .store
            .set_account_blocked(account_id, blocked, reason.as_deref())?
        {
            return Err(SessionError::AccountNotFound(account_id.clone()));
        }

        info!(account_id = %account_id, blocked, reason = ?reason, "Account block changed");
        self.audit(AuditEventType::AccountBlocked {
            account_id: account_id.clone(),
            blocked,
            reason,
        });
        Ok(())
    }

    pub fn is_healthy(&self) -> bool {
        self.store.is_healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tollgate_api::{DeviceInfo, DeviceProfile, ErrorCode, NetworkInfo};
    use tollgate_config::UsageRegression;
    use tollgate_store::SqliteStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn minutes(n: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::minutes(n)
    }

    fn make_engine(config: EngineConfig) -> SessionEngine {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let engine = SessionEngine::new(store, config);

        engine
            .upsert_account(&AccountProfile {
                account_id: "acct-1".into(),
                name: "Ada".into(),
                phone: Some("+15550100".into()),
                device: DeviceProfile {
                    os: Some("Android".into()),
                    ..Default::default()
                },
            })
            .unwrap();
        engine
            .seed_plans(&[
                Plan {
                    plan_id: "day-pass".into(),
                    name: "1GB Day Pass".into(),
                    data_limit_mb: Some(1024),
                    time_limit_minutes: Some(1440),
                    price: 500,
                    is_active: true,
                },
                Plan {
                    plan_id: "data-only".into(),
                    name: "100MB".into(),
                    data_limit_mb: Some(100),
                    time_limit_minutes: Some(0),
                    price: 100,
                    is_active: true,
                },
                Plan {
                    plan_id: "hour".into(),
                    name: "One Hour".into(),
                    data_limit_mb: None,
                    time_limit_minutes: Some(60),
                    price: 50,
                    is_active: true,
                },
            ])
            .unwrap();
        engine
    }

    fn engine() -> SessionEngine {
        make_engine(EngineConfig::default())
    }

    fn admit_request(session_id: &str, plan: &str) -> AdmitRequest {
        AdmitRequest {
            account_id: "acct-1".into(),
            plan_id: plan.into(),
            session_id: session_id.into(),
            device: DeviceInfo {
                mac_address: "aa:bb:cc:dd:ee:ff".into(),
                ip: "10.5.50.2".into(),
                ..Default::default()
            },
            network: NetworkInfo {
                ap_mac_address: Some("11:22:33:44:55:66".into()),
                gateway_ip: Some("10.5.50.1".into()),
            },
            free_allowance: None,
        }
    }

    fn data(mb: f64) -> UsageReport {
        UsageReport {
            data_used_mb: Some(mb),
            ..Default::default()
        }
    }

    #[test]
    fn test_admit_snapshots_plan() {
        let engine = engine();
        let detail = engine.admit(admit_request("mt-1", "day-pass"), t0()).unwrap();
        let session = &detail.session;

        assert!(session.is_active);
        assert_eq!(session.snapshot.data_limit_mb, Some(1024));
        assert_eq!(session.plan_expiry_time, Some(minutes(1440)));
        assert_eq!(session.device.os.as_deref(), Some("Android"));
        assert_eq!(detail.remaining_minutes, Some(1440));
        assert_eq!(detail.account.as_ref().map(|a| a.name.as_str()), Some("Ada"));

        let account = engine.get_account(&"acct-1".into()).unwrap();
        assert!(account.mirror.is_session_active);
        assert_eq!(account.mirror.session_id, Some(SessionId::new("mt-1")));
        assert_eq!(account.mirror.plan_expiry_time, Some(minutes(1440)));
        assert_eq!(account.mirror.gateway_ip.as_deref(), Some("10.5.50.1"));
    }

    #[test]
    fn test_admit_preconditions() {
        let engine = engine();

        let mut req = admit_request("mt-1", "day-pass");
        req.account_id = "ghost".into();
        assert!(matches!(
            engine.admit(req, t0()),
            Err(SessionError::AccountNotFound(_))
        ));

        let req = admit_request("mt-1", "no-such-plan");
        assert_eq!(engine.admit(req, t0()).unwrap_err().code(), ErrorCode::NotFound);

        engine
            .set_account_blocked(&"acct-1".into(), true, Some("fraud".into()))
            .unwrap();
        let err = engine.admit(admit_request("mt-1", "day-pass"), t0()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);

        let mut req = admit_request("mt-1", "day-pass");
        req.device.mac_address = "not-a-mac".into();
        assert_eq!(engine.admit(req, t0()).unwrap_err().code(), ErrorCode::InvalidInput);
    }

    #[test]
    fn test_duplicate_admission_returns_first() {
        let engine = engine();
        let first = engine.admit(admit_request("mt-1", "day-pass"), t0()).unwrap();

        let err = engine
            .admit(admit_request("mt-1", "hour"), minutes(1))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
        assert_eq!(err.session().map(|d| d.session.key), Some(first.session.key));

        let info = err.to_error_info();
        assert_eq!(info.session.map(|d| d.session.key), Some(first.session.key));
    }

    #[test]
    fn test_zero_limit_is_unlimited() {
        let engine = engine();
        let detail = engine.admit(admit_request("mt-1", "data-only"), t0()).unwrap();
        assert_eq!(detail.session.snapshot.time_limit_minutes, None);
        assert_eq!(detail.session.plan_expiry_time, None);
        assert_eq!(detail.remaining_minutes, None);
    }

    #[test]
    fn test_report_records_usage() {
        let engine = engine();
        let key = engine
            .admit(admit_request("mt-1", "day-pass"), t0())
            .unwrap()
            .session
            .key;

        let report = UsageReport {
            data_used_mb: Some(200.0),
            time_used_minutes: Some(30.0),
            bytes_downloaded: Some(200 * 1024 * 1024),
            ..Default::default()
        };
        let detail = engine.report_usage(key, &report, minutes(30)).unwrap();
        assert!(detail.session.is_active);
        assert_eq!(detail.session.usage.data_used_mb, 200.0);
        assert_eq!(detail.session.last_data_update_time, Some(minutes(30)));
        assert_eq!(detail.remaining_data_mb, Some(824.0));
        assert_eq!(detail.session.version, 1);
    }

    #[test]
    fn test_data_exceeded_at_exact_limit() {
        let engine = engine();
        let key = engine
            .admit(admit_request("mt-1", "data-only"), t0())
            .unwrap()
            .session
            .key;

        let err = engine.report_usage(key, &data(100.0), minutes(5)).unwrap_err();
        let SessionError::ExpiredNow { reason, detail } = err else {
            panic!("expected ExpiredNow, got {:?}", err);
        };
        assert_eq!(reason, TerminationReason::DataExceeded);
        assert!(!detail.session.is_active);
        assert!(detail.session.is_expired);
        assert_eq!(detail.session.usage.data_used_mb, 100.0);
        assert_eq!(detail.session.terminated_by, Some(TerminatedBy::System));
        assert_eq!(detail.session.session_end_time, Some(minutes(5)));

        let account = engine.get_account(&"acct-1".into()).unwrap();
        assert!(!account.mirror.is_session_active);

        // Further reports hit an ended session
        let err = engine.report_usage(key, &data(101.0), minutes(6)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);
    }

    #[test]
    fn test_window_wins_over_data() {
        let engine = engine();
        let key = engine
            .admit(admit_request("mt-1", "day-pass"), t0())
            .unwrap()
            .session
            .key;

        let err = engine
            .report_usage(key, &data(5000.0), minutes(1441))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::ExpiredNow {
                reason: TerminationReason::Expired,
                ..
            }
        ));
    }

    #[test]
    fn test_time_exceeded() {
        let engine = engine();
        let key = engine
            .admit(admit_request("mt-1", "hour"), t0())
            .unwrap()
            .session
            .key;

        let report = UsageReport {
            time_used_minutes: Some(60.0),
            ..Default::default()
        };
        let err = engine.report_usage(key, &report, minutes(59)).unwrap_err();
        assert!(matches!(
            err,
            SessionError::ExpiredNow {
                reason: TerminationReason::TimeExceeded,
                ..
            }
        ));
    }

    #[test]
    fn test_clock_skewed_admission_expires_on_report() {
        let engine = engine();
        // Admitted with a clock two hours behind
        let key = engine
            .admit(admit_request("mt-1", "hour"), minutes(-120))
            .unwrap()
            .session
            .key;

        let err = engine
            .report_usage(key, &UsageReport::default(), t0())
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::ExpiredNow {
                reason: TerminationReason::Expired,
                ..
            }
        ));
    }

    #[test]
    fn test_usage_regression() {
        let engine = engine();
        let key = engine
            .admit(admit_request("mt-1", "day-pass"), t0())
            .unwrap()
            .session
            .key;
        engine.report_usage(key, &data(50.0), minutes(1)).unwrap();

        let err = engine.report_usage(key, &data(40.0), minutes(2)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
        let stored = engine.get_session(key, minutes(2)).unwrap();
        assert_eq!(stored.session.usage.data_used_mb, 50.0);
        assert_eq!(stored.session.version, 1);

        let err = engine.report_usage(key, &data(-1.0), minutes(2)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }

    #[test]
    fn test_lower_counter_after_window_still_expires() {
        let engine = engine();
        let key = engine
            .admit(admit_request("mt-1", "hour"), t0())
            .unwrap()
            .session
            .key;
        engine.report_usage(key, &data(50.0), minutes(1)).unwrap();

        let err = engine.report_usage(key, &data(10.0), minutes(90)).unwrap_err();
        match err {
            SessionError::ExpiredNow { reason, detail } => {
                assert_eq!(reason, TerminationReason::Expired);
                assert!(!detail.session.is_active);
                assert_eq!(detail.session.usage.data_used_mb, 50.0);
            }
            other => panic!("expected expiry, got {:?}", other),
        }

        let stored = engine.get_session(key, minutes(90)).unwrap();
        assert!(!stored.session.is_active);
        assert_eq!(stored.session.terminated_by, Some(TerminatedBy::System));
        assert!(!engine.get_account(&"acct-1".into()).unwrap().mirror.is_session_active);
    }

    #[test]
    fn test_usage_regression_clamped() {
        let engine = make_engine(EngineConfig {
            usage_regression: UsageRegression::Clamp,
            ..EngineConfig::default()
        });
        let key = engine
            .admit(admit_request("mt-1", "day-pass"), t0())
            .unwrap()
            .session
            .key;
        engine.report_usage(key, &data(50.0), minutes(1)).unwrap();

        let detail = engine.report_usage(key, &data(40.0), minutes(2)).unwrap();
        assert_eq!(detail.session.usage.data_used_mb, 50.0);
    }

    #[test]
    fn test_report_unknown_session() {
        let engine = engine();
        let err = engine
            .report_usage(SessionKey::new(), &data(1.0), t0())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_manual_termination() {
        let engine = engine();
        let key = engine
            .admit(admit_request("mt-1", "day-pass"), t0())
            .unwrap()
            .session
            .key;

        let detail = engine
            .terminate(key, None, Some(TerminatedBy::User), minutes(10))
            .unwrap();
        assert!(!detail.session.is_active);
        assert!(!detail.session.is_expired);
        assert_eq!(
            detail.session.termination_reason,
            Some(TerminationReason::Manual)
        );
        assert_eq!(detail.session.terminated_by, Some(TerminatedBy::User));

        let account = engine.get_account(&"acct-1".into()).unwrap();
        assert!(!account.mirror.is_session_active);

        let err = engine.terminate(key, None, None, minutes(11)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);

        // The id is free again
        engine.admit(admit_request("mt-1", "day-pass"), minutes(12)).unwrap();
    }

    #[test]
    fn test_terminate_rejects_system_actor() {
        let engine = engine();
        let key = engine
            .admit(admit_request("mt-1", "day-pass"), t0())
            .unwrap()
            .session
            .key;
        let err = engine
            .terminate(key, None, Some(TerminatedBy::System), t0())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
        assert!(engine.get_session(key, t0()).unwrap().session.is_active);
    }

    #[test]
    fn test_sweep_expires_and_is_idempotent() {
        let engine = engine();
        let hour = engine
            .admit(admit_request("mt-1", "hour"), t0())
            .unwrap()
            .session
            .key;
        let day = engine
            .admit(admit_request("mt-2", "day-pass"), t0())
            .unwrap()
            .session
            .key;

        let report = engine.sweep(minutes(30)).unwrap();
        assert_eq!(report.summary, SweepSummary::default());
        assert!(report.events().is_empty());

        let report = engine.sweep(minutes(61)).unwrap();
        assert_eq!(report.summary.reconciled, 1);
        assert_eq!(report.ended[0].key, hour);
        assert_eq!(report.events().len(), 2);

        let swept = engine.get_session(hour, minutes(61)).unwrap().session;
        assert!(!swept.is_active);
        assert!(swept.is_expired);
        assert_eq!(swept.termination_reason, Some(TerminationReason::Expired));
        assert_eq!(swept.terminated_by, Some(TerminatedBy::System));
        assert!(engine.get_session(day, minutes(61)).unwrap().session.is_active);

        let again = engine.sweep(minutes(61)).unwrap();
        assert_eq!(again.summary, SweepSummary::default());
    }

    #[test]
    fn test_sweep_uses_persisted_counters() {
        let engine = engine();
        let key = engine
            .admit(admit_request("mt-1", "data-only"), t0())
            .unwrap()
            .session
            .key;
        engine.report_usage(key, &data(99.0), minutes(1)).unwrap();
        assert_eq!(engine.sweep(minutes(2)).unwrap().summary.reconciled, 0);

        // Counter persisted at the limit without a report evaluating it
        let mut stored = engine.store().get_session(key).unwrap().unwrap();
        stored.usage.data_used_mb = 100.0;
        stored.version += 1;
        assert!(engine.store().commit_session(&stored).unwrap());

        let report = engine.sweep(minutes(3)).unwrap();
        assert_eq!(report.summary.reconciled, 1);
        assert_eq!(
            report.ended[0].termination_reason,
            Some(TerminationReason::Expired)
        );
        assert!(!engine
            .get_account(&"acct-1".into())
            .unwrap()
            .mirror
            .is_session_active);
    }

    #[test]
    fn test_sweep_repairs_stale_mirror() {
        let engine = engine();
        let detail = engine.admit(admit_request("mt-1", "day-pass"), t0()).unwrap();
        engine
            .terminate(detail.session.key, None, None, minutes(1))
            .unwrap();

        let mirror = AccountMirror {
            is_session_active: true,
            session_id: Some("mt-1".into()),
            ..Default::default()
        };
        engine
            .store()
            .set_session_pointer(&"acct-1".into(), Some(detail.session.key), &mirror)
            .unwrap();

        let report = engine.sweep(minutes(2)).unwrap();
        assert_eq!(report.summary.reconciled, 0);
        assert_eq!(report.summary.accounts_repaired, 1);
        assert!(!engine
            .get_account(&"acct-1".into())
            .unwrap()
            .mirror
            .is_session_active);
    }

    #[test]
    fn test_snapshot_survives_plan_edit() {
        let engine = engine();
        let key = engine
            .admit(admit_request("mt-1", "data-only"), t0())
            .unwrap()
            .session
            .key;

        engine
            .upsert_plan(&Plan {
                plan_id: "data-only".into(),
                name: "100MB".into(),
                data_limit_mb: Some(10),
                time_limit_minutes: None,
                price: 100,
                is_active: true,
            })
            .unwrap();

        let detail = engine.report_usage(key, &data(50.0), minutes(1)).unwrap();
        assert!(detail.session.is_active);
        assert_eq!(detail.session.snapshot.data_limit_mb, Some(100));
        assert_eq!(detail.plan.and_then(|p| p.data_limit_mb), Some(10));
    }

    #[test]
    fn test_lookup_by_session_id_prefers_newest() {
        let engine = engine();
        let first = engine.admit(admit_request("mt-1", "hour"), t0()).unwrap();
        engine
            .terminate(first.session.key, None, None, minutes(1))
            .unwrap();
        let second = engine.admit(admit_request("mt-1", "hour"), minutes(2)).unwrap();

        let found = engine
            .get_session_by_session_id(&"mt-1".into(), minutes(3))
            .unwrap();
        assert_eq!(found.session.key, second.session.key);

        let err = engine
            .get_session_by_session_id(&"nope".into(), minutes(3))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_pagination() {
        let engine = make_engine(EngineConfig {
            max_page_limit: 2,
            ..EngineConfig::default()
        });
        for i in 0..5 {
            engine
                .admit(admit_request(&format!("mt-{}", i), "hour"), minutes(i))
                .unwrap();
        }

        let page = engine.list_active(Some(1), Some(10), minutes(5)).unwrap();
        assert_eq!(page.limit, 2);
        assert_eq!(page.total, 5);
        assert_eq!(page.pages, 3);
        assert_eq!(page.items[0].session.session_id, SessionId::new("mt-4"));

        let last = engine.list_active(Some(3), None, minutes(5)).unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].session.session_id, SessionId::new("mt-0"));

        let err = engine.list_active(Some(0), None, minutes(5)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }

    #[test]
    fn test_account_listing_and_stats() {
        let engine = engine();
        let a = engine.admit(admit_request("mt-1", "hour"), t0()).unwrap();
        engine.admit(admit_request("mt-2", "hour"), minutes(1)).unwrap();
        engine
            .report_usage(a.session.key, &data(12.5), minutes(2))
            .unwrap();
        engine.terminate(a.session.key, None, None, minutes(3)).unwrap();

        let acct: AccountId = "acct-1".into();
        let page = engine
            .list_account_sessions(&acct, None, None, None, minutes(4))
            .unwrap();
        assert_eq!(page.limit, DEFAULT_ACCOUNT_PAGE_LIMIT);
        assert_eq!(page.total, 2);

        let active = engine
            .list_account_sessions(&acct, Some(true), None, None, minutes(4))
            .unwrap();
        assert_eq!(active.total, 1);
        assert_eq!(active.items[0].session.session_id, SessionId::new("mt-2"));

        let stats = engine.account_stats(&acct).unwrap();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.total_data_used_mb, 12.5);

        let empty = engine.account_stats(&"nobody".into()).unwrap();
        assert_eq!(empty, AccountStats::default());
    }

    #[test]
    fn test_admin_validation() {
        let engine = engine();
        let err = engine
            .set_account_blocked(&"ghost".into(), true, None)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        let err = engine
            .upsert_plan(&Plan {
                plan_id: "bad id".into(),
                name: "x".into(),
                data_limit_mb: None,
                time_limit_minutes: None,
                price: 0,
                is_active: true,
            })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }
}
