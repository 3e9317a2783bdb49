//! Session transitions and quota arithmetic
//!
//! Everything here is pure: callers read a session, apply one of these
//! functions to a copy, and commit the copy with a version check.

use chrono::{DateTime, Utc};
use tollgate_api::{
    Account, AccountSummary, Plan, Session, SessionDetail, TerminatedBy, TerminationReason,
    UsageReport,
};
use tollgate_config::UsageRegression;
use tollgate_util::minutes_until;

use crate::{SessionError, SessionResult};

/// First limit the session has crossed, in priority order: plan window,
/// then data, then time.
pub fn expiry_reason(session: &Session, now: DateTime<Utc>) -> Option<TerminationReason> {
    if let Some(expiry) = session.plan_expiry_time
        && now > expiry
    {
        return Some(TerminationReason::Expired);
    }

    if let Some(limit) = session.snapshot.data_limit_mb
        && session.usage.data_used_mb >= limit as f64
    {
        return Some(TerminationReason::DataExceeded);
    }

    if let Some(limit) = session.snapshot.time_limit_minutes
        && session.usage.time_used_minutes >= limit as f64
    {
        return Some(TerminationReason::TimeExceeded);
    }

    None
}

/// Fold a cumulative usage report into the session's counters
pub fn apply_usage(
    session: &mut Session,
    report: &UsageReport,
    regression: UsageRegression,
) -> SessionResult<()> {
    if let Some(data) = report.data_used_mb {
        session.usage.data_used_mb =
            monotonic("data_used_mb", session.usage.data_used_mb, data, regression)?;
    }
    if let Some(time) = report.time_used_minutes {
        session.usage.time_used_minutes = monotonic(
            "time_used_minutes",
            session.usage.time_used_minutes,
            time,
            regression,
        )?;
    }

    // Telemetry only
    if let Some(v) = report.bytes_uploaded {
        session.usage.bytes_uploaded = v;
    }
    if let Some(v) = report.bytes_downloaded {
        session.usage.bytes_downloaded = v;
    }
    if let Some(v) = report.packets_uploaded {
        session.usage.packets_uploaded = v;
    }
    if let Some(v) = report.packets_downloaded {
        session.usage.packets_downloaded = v;
    }

    Ok(())
}

fn monotonic(
    field: &str,
    stored: f64,
    reported: f64,
    regression: UsageRegression,
) -> SessionResult<f64> {
    if reported >= stored {
        return Ok(reported);
    }
    match regression {
        UsageRegression::Reject => Err(SessionError::invalid(format!(
            "{} went backwards: reported {} below recorded {}",
            field, reported, stored
        ))),
        UsageRegression::Clamp => Ok(stored),
    }
}

/// Flip a session to inactive
pub fn end_session(
    session: &mut Session,
    reason: TerminationReason,
    by: TerminatedBy,
    expired: bool,
    now: DateTime<Utc>,
) {
    session.is_active = false;
    session.is_expired = expired;
    session.termination_reason = Some(reason);
    session.terminated_by = Some(by);
    session.session_end_time = Some(now);
    session.last_activity_time = now;
}

/// MB left under the data limit; None when unlimited
pub fn remaining_data_mb(session: &Session) -> Option<f64> {
    session
        .snapshot
        .data_limit_mb
        .map(|limit| (limit as f64 - session.usage.data_used_mb).max(0.0))
}

/// Minutes left in the plan window, or under the time quota when there is
/// no window; None when unlimited
pub fn remaining_minutes(session: &Session, now: DateTime<Utc>) -> Option<u64> {
    if let Some(expiry) = session.plan_expiry_time {
        return Some(minutes_until(expiry, now));
    }
    session
        .snapshot
        .time_limit_minutes
        .map(|limit| (limit as f64 - session.usage.time_used_minutes).max(0.0) as u64)
}

/// Expand a session for display
pub fn session_detail(
    session: Session,
    account: Option<&Account>,
    plan: Option<Plan>,
    now: DateTime<Utc>,
) -> SessionDetail {
    SessionDetail {
        remaining_data_mb: remaining_data_mb(&session),
        remaining_minutes: remaining_minutes(&session, now),
        account: account.map(AccountSummary::from),
        plan,
        session,
    }
}
