//! Engine command execution for request workers

use chrono::{DateTime, Utc};
use tollgate_api::{
    Command, ErrorCode, ErrorInfo, EventPayload, Response, ResponsePayload,
};
use tollgate_core::{SessionEngine, SessionError, admitted_event, ended_event};

/// Result of one command plus the events it should broadcast
#[derive(Debug)]
pub struct Outcome {
    pub result: Result<ResponsePayload, ErrorInfo>,
    pub events: Vec<EventPayload>,
}

impl Outcome {
    pub fn ok(payload: ResponsePayload) -> Self {
        Self {
            result: Ok(payload),
            events: Vec::new(),
        }
    }

    fn with_events(payload: ResponsePayload, events: Vec<EventPayload>) -> Self {
        Self {
            result: Ok(payload),
            events,
        }
    }

    pub fn failed(error: ErrorInfo) -> Self {
        Self {
            result: Err(error),
            events: Vec::new(),
        }
    }

    fn from_error(error: SessionError) -> Self {
        // A report that consumed the session still ended it
        let events = match &error {
            SessionError::ExpiredNow { detail, .. } => {
                ended_event(&detail.session).into_iter().collect()
            }
            _ => Vec::new(),
        };
        Self {
            result: Err(error.to_error_info()),
            events,
        }
    }

    fn from_result<T>(
        result: Result<T, SessionError>,
        payload: impl FnOnce(T) -> ResponsePayload,
    ) -> Self {
        match result {
            Ok(value) => Self::ok(payload(value)),
            Err(e) => Self::from_error(e),
        }
    }

    pub fn into_response(self, request_id: u64) -> Response {
        match self.result {
            Ok(payload) => Response::success(request_id, payload),
            Err(error) => Response::error(request_id, error),
        }
    }
}

/// Run a command against the engine. Blocks on the store.
pub fn execute(engine: &SessionEngine, command: Command, now: DateTime<Utc>) -> Outcome {
    match command {
        Command::AdmitSession(request) => match engine.admit(request, now) {
            Ok(detail) => {
                let event = admitted_event(&detail.session);
                Outcome::with_events(ResponsePayload::Session(detail), vec![event])
            }
            Err(e) => Outcome::from_error(e),
        },

        Command::ReportUsage { key, report } => {
            Outcome::from_result(engine.report_usage(key, &report, now), ResponsePayload::Session)
        }

        Command::TerminateSession { key, reason, actor } => {
            match engine.terminate(key, reason, actor, now) {
                Ok(detail) => {
                    let events = ended_event(&detail.session).into_iter().collect();
                    Outcome::with_events(ResponsePayload::Session(detail), events)
                }
                Err(e) => Outcome::from_error(e),
            }
        }

        Command::Sweep => match engine.sweep(now) {
            Ok(report) => {
                let events = report.events();
                Outcome::with_events(ResponsePayload::Swept(report.summary), events)
            }
            Err(e) => Outcome::from_error(e),
        },

        Command::GetSession { key } => {
            Outcome::from_result(engine.get_session(key, now), ResponsePayload::Session)
        }

        Command::GetSessionBySessionId { session_id } => Outcome::from_result(
            engine.get_session_by_session_id(&session_id, now),
            ResponsePayload::Session,
        ),

        Command::ListActiveSessions { page, limit } => {
            Outcome::from_result(engine.list_active(page, limit, now), ResponsePayload::Sessions)
        }

        Command::ListAccountSessions {
            account_id,
            active,
            page,
            limit,
        } => Outcome::from_result(
            engine.list_account_sessions(&account_id, active, page, limit, now),
            ResponsePayload::Sessions,
        ),

        Command::GetAccountStats { account_id } => {
            Outcome::from_result(engine.account_stats(&account_id), ResponsePayload::Stats)
        }

        Command::GetAccount { account_id } => {
            Outcome::from_result(engine.get_account(&account_id), ResponsePayload::Account)
        }

        Command::UpsertPlan { plan } => {
            Outcome::from_result(engine.upsert_plan(&plan), |()| ResponsePayload::PlanSaved {
                plan_id: plan.plan_id.clone(),
            })
        }

        Command::UpsertAccount { profile } => {
            Outcome::from_result(engine.upsert_account(&profile), |()| {
                ResponsePayload::AccountSaved {
                    account_id: profile.account_id.clone(),
                }
            })
        }

        Command::SetAccountBlocked {
            account_id,
            blocked,
            reason,
        } => Outcome::from_result(
            engine.set_account_blocked(&account_id, blocked, reason),
            |()| ResponsePayload::AccountSaved {
                account_id: account_id.clone(),
            },
        ),

        Command::SubscribeEvents
        | Command::UnsubscribeEvents
        | Command::GetHealth
        | Command::Ping => Outcome::failed(ErrorInfo::new(
            ErrorCode::InvalidRequest,
            "Command is answered by the connection layer",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tollgate_api::{
        AccountProfile, AdmitRequest, DeviceInfo, NetworkInfo, Plan, ResponseResult,
        TerminationReason, UsageReport,
    };
    use tollgate_config::EngineConfig;
    use tollgate_store::SqliteStore;
    use tollgate_util::SessionKey;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
    }

    fn engine() -> SessionEngine {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let engine = SessionEngine::new(store, EngineConfig::default());
        engine
            .upsert_account(&AccountProfile {
                account_id: "acct-1".into(),
                name: "Ada".into(),
                phone: None,
                device: Default::default(),
            })
            .unwrap();
        engine
            .upsert_plan(&Plan {
                plan_id: "small".into(),
                name: "100MB".into(),
                data_limit_mb: Some(100),
                time_limit_minutes: Some(60),
                price: 100,
                is_active: true,
            })
            .unwrap();
        engine
    }

    fn admit(session_id: &str) -> Command {
        Command::AdmitSession(AdmitRequest {
            account_id: "acct-1".into(),
            plan_id: "small".into(),
            session_id: session_id.into(),
            device: DeviceInfo {
                mac_address: "aa:bb:cc:dd:ee:ff".into(),
                ip: "10.5.50.2".into(),
                ..Default::default()
            },
            network: NetworkInfo::default(),
            free_allowance: None,
        })
    }

    fn admitted_key(outcome: &Outcome) -> SessionKey {
        match &outcome.result {
            Ok(ResponsePayload::Session(detail)) => detail.session.key,
            other => panic!("expected session, got {:?}", other),
        }
    }

    #[test]
    fn admission_broadcasts_admitted() {
        let engine = engine();
        let outcome = execute(&engine, admit("mt-1"), t0());

        admitted_key(&outcome);
        assert_eq!(outcome.events.len(), 1);
        assert!(matches!(
            outcome.events[0],
            EventPayload::SessionAdmitted { .. }
        ));
    }

    #[test]
    fn duplicate_admission_is_conflict_with_session() {
        let engine = engine();
        let first = admitted_key(&execute(&engine, admit("mt-1"), t0()));

        let outcome = execute(&engine, admit("mt-1"), t0());
        let error = outcome.result.unwrap_err();
        assert_eq!(error.code, ErrorCode::Conflict);
        assert_eq!(error.session.unwrap().session.key, first);
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn consuming_report_broadcasts_ended() {
        let engine = engine();
        let key = admitted_key(&execute(&engine, admit("mt-1"), t0()));

        let outcome = execute(
            &engine,
            Command::ReportUsage {
                key,
                report: UsageReport {
                    data_used_mb: Some(100.0),
                    ..Default::default()
                },
            },
            t0(),
        );

        let error = outcome.result.unwrap_err();
        assert_eq!(error.code, ErrorCode::ExpiredNow);
        assert!(error.session.is_some());
        match &outcome.events[..] {
            [EventPayload::SessionEnded { reason, expired, .. }] => {
                assert_eq!(*reason, TerminationReason::DataExceeded);
                assert!(*expired);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn idle_sweep_is_silent() {
        let engine = engine();
        let outcome = execute(&engine, Command::Sweep, t0());

        let response = outcome.into_response(9);
        assert_eq!(response.request_id, 9);
        match response.result {
            ResponseResult::Ok(ResponsePayload::Swept(summary)) => {
                assert_eq!(summary.reconciled, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn connection_commands_are_not_engine_commands() {
        let engine = engine();
        let outcome = execute(&engine, Command::Ping, t0());
        assert_eq!(outcome.result.unwrap_err().code, ErrorCode::InvalidRequest);
    }
}
