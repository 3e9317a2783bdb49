//! Text and JSON rendering of service replies

use serde::Serialize;
use tollgate_api::{ErrorInfo, Event, EventPayload, ResponsePayload, SessionDetail};
use tollgate_util::format_datetime_full;

/// Output format selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Short human-readable summary
    #[default]
    Text,
    /// Pretty-printed JSON
    Json,
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to render JSON: {}", e),
    }
}

fn session_line(detail: &SessionDetail) -> String {
    let s = &detail.session;
    let status = if s.is_active {
        "active".to_string()
    } else {
        format!(
            "ended ({})",
            s.termination_reason.map(|r| r.as_str()).unwrap_or("unknown")
        )
    };
    let remaining = match (detail.remaining_data_mb, detail.remaining_minutes) {
        (Some(mb), Some(min)) => format!("{:.1} MB / {} min left", mb, min),
        (Some(mb), None) => format!("{:.1} MB left", mb),
        (None, Some(min)) => format!("{} min left", min),
        (None, None) => "unlimited".into(),
    };
    format!(
        "{}  {}  account={} plan={}  {}  used {:.1} MB / {:.1} min  {}",
        s.key,
        s.session_id,
        s.account_id,
        s.plan_id,
        status,
        s.usage.data_used_mb,
        s.usage.time_used_minutes,
        remaining
    )
}

pub fn print_payload(payload: &ResponsePayload, format: OutputFormat) {
    if format == OutputFormat::Json {
        print_json(payload);
        return;
    }

    match payload {
        ResponsePayload::Session(detail) => println!("{}", session_line(detail)),
        ResponsePayload::Sessions(page) => {
            if page.items.is_empty() {
                println!("No sessions.");
            }
            for detail in &page.items {
                println!("{}", session_line(detail));
            }
            println!(
                "page {}/{} ({} total, {} per page)",
                page.page, page.pages, page.total, page.limit
            );
        }
        ResponsePayload::Swept(summary) => println!(
            "Swept: {} session(s) expired, {} account(s) repaired",
            summary.reconciled, summary.accounts_repaired
        ),
        ResponsePayload::Stats(stats) => {
            println!("Sessions:   {} ({} active)", stats.total_sessions, stats.active_sessions);
            println!("Data used:  {:.1} MB", stats.total_data_used_mb);
            println!("Time used:  {:.1} min", stats.total_time_used_minutes);
            println!(
                "Bytes:      {} up / {} down",
                stats.total_bytes_uploaded, stats.total_bytes_downloaded
            );
        }
        ResponsePayload::Account(account) => {
            println!("{}  {}", account.account_id, account.name);
            if account.is_blocked {
                println!(
                    "  blocked: {}",
                    account.block_reason.as_deref().unwrap_or("no reason given")
                );
            }
            match (account.mirror.is_session_active, &account.mirror.session_id) {
                (true, Some(id)) => println!("  active session: {}", id),
                _ => println!("  no active session"),
            }
        }
        ResponsePayload::PlanSaved { plan_id } => println!("Plan '{}' saved", plan_id),
        ResponsePayload::AccountSaved { account_id } => {
            println!("Account '{}' saved", account_id)
        }
        ResponsePayload::Subscribed { client_id } => println!("Subscribed as {}", client_id),
        ResponsePayload::Unsubscribed => println!("Unsubscribed"),
        ResponsePayload::Health(health) => {
            println!("live:       {}", health.live);
            println!("ready:      {}", health.ready);
            println!("store:      {}", if health.store_ok { "ok" } else { "failing" });
            match health.last_sweep {
                Some(at) => println!("last sweep: {}", format_datetime_full(&at)),
                None => println!("last sweep: never"),
            }
        }
        ResponsePayload::Pong => println!("pong"),
    }
}

pub fn print_error(error: &ErrorInfo, format: OutputFormat) {
    if format == OutputFormat::Json {
        print_json(error);
        return;
    }

    eprintln!("{:?}: {}", error.code, error.message);
    if error.code.is_retryable() {
        eprintln!("  (temporary; the same request may be retried)");
    }
    if let Some(detail) = &error.session {
        eprintln!("  {}", session_line(detail));
    }
}

pub fn print_event(event: &Event, format: OutputFormat) {
    if format == OutputFormat::Json {
        match serde_json::to_string(event) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to render event: {}", e),
        }
        return;
    }

    let at = event.timestamp.format("%H:%M:%S");
    match &event.payload {
        EventPayload::SessionAdmitted {
            key,
            session_id,
            account_id,
            plan_id,
            plan_expiry_time,
        } => println!(
            "{} admitted {} ({}) account={} plan={} expires={}",
            at,
            session_id,
            key,
            account_id,
            plan_id,
            plan_expiry_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".into())
        ),
        EventPayload::SessionEnded {
            key,
            session_id,
            account_id,
            reason,
            terminated_by,
            ..
        } => println!(
            "{} ended {} ({}) account={} reason={} by={}",
            at, session_id, key, account_id, reason, terminated_by
        ),
        EventPayload::SweepCompleted(summary) => println!(
            "{} sweep: {} expired, {} repaired",
            at, summary.reconciled, summary.accounts_repaired
        ),
        EventPayload::Shutdown => println!("{} service shutting down", at),
    }
}
