//! SQLite-based store implementation

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tollgate_api::{
    Account, AccountMirror, AccountProfile, AccountStats, Plan, PlanSnapshot, Session,
    TerminatedBy, TerminationReason, UsageCounters,
};
use tollgate_util::{AccountId, PlanId, SessionId, SessionKey};
use tracing::{debug, warn};

use crate::{AdmitOutcome, AuditEvent, Store, StoreError, StoreResult, SweepCommit};

/// How long a writer waits on a locked database file before reporting busy
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SESSION_COLUMNS: &str = "key, session_id, account_id, plan_id, \
    data_limit_mb, time_limit_minutes, device_json, network_json, free_allowance_json, \
    session_start_time, session_end_time, plan_start_time, plan_expiry_time, \
    data_used_mb, time_used_minutes, bytes_uploaded, bytes_downloaded, \
    packets_uploaded, packets_downloaded, is_active, is_expired, \
    termination_reason, terminated_by, last_activity_time, last_data_update_time, version";

const ACCOUNT_COLUMNS: &str = "account_id, name, phone, is_blocked, block_reason, device_json, \
    is_session_active, session_id, plan_id, plan_start_time, plan_expiry_time, \
    ap_mac_address, gateway_ip, last_connection_time";

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %journal_mode, "Opened store");

        Self::with_connection(conn)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- Audit log (append-only)
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_json TEXT NOT NULL
            );

            -- Plan catalog
            CREATE TABLE IF NOT EXISTS plans (
                plan_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                data_limit_mb INTEGER,
                time_limit_minutes INTEGER,
                price INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            -- Account directory, with the mirror of the latest session
            CREATE TABLE IF NOT EXISTS accounts (
                account_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                phone TEXT,
                is_blocked INTEGER NOT NULL DEFAULT 0,
                block_reason TEXT,
                device_json TEXT NOT NULL,
                is_session_active INTEGER NOT NULL DEFAULT 0,
                session_key TEXT,
                session_id TEXT,
                plan_id TEXT,
                plan_start_time TEXT,
                plan_expiry_time TEXT,
                ap_mac_address TEXT,
                gateway_ip TEXT,
                last_connection_time TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Sessions
            CREATE TABLE IF NOT EXISTS sessions (
                key TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                plan_id TEXT NOT NULL,
                data_limit_mb INTEGER,
                time_limit_minutes INTEGER,
                device_json TEXT NOT NULL,
                network_json TEXT NOT NULL,
                free_allowance_json TEXT NOT NULL,
                session_start_time TEXT NOT NULL,
                session_end_time TEXT,
                plan_start_time TEXT NOT NULL,
                plan_expiry_time TEXT,
                data_used_mb REAL NOT NULL DEFAULT 0,
                time_used_minutes REAL NOT NULL DEFAULT 0,
                bytes_uploaded INTEGER NOT NULL DEFAULT 0,
                bytes_downloaded INTEGER NOT NULL DEFAULT 0,
                packets_uploaded INTEGER NOT NULL DEFAULT 0,
                packets_downloaded INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL,
                is_expired INTEGER NOT NULL DEFAULT 0,
                termination_reason TEXT,
                terminated_by TEXT,
                last_activity_time TEXT NOT NULL,
                last_data_update_time TEXT,
                version INTEGER NOT NULL DEFAULT 0
            );

            -- Indexes
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_active
                ON sessions(session_id) WHERE is_active = 1;
            CREATE INDEX IF NOT EXISTS idx_sessions_session_id
                ON sessions(session_id, session_start_time);
            CREATE INDEX IF NOT EXISTS idx_sessions_account
                ON sessions(account_id, session_start_time);
            CREATE INDEX IF NOT EXISTS idx_sessions_active
                ON sessions(is_active, session_start_time);
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }
}

fn fmt_time(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn fmt_opt_time(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(fmt_time)
}

fn parse_time(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_opt_time(s: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_time).transpose()
}

fn to_sql_int(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_sql_int(v: i64) -> u64 {
    v.max(0) as u64
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// A sessions row as stored, before decoding
struct SessionRow {
    key: String,
    session_id: String,
    account_id: String,
    plan_id: String,
    data_limit_mb: Option<i64>,
    time_limit_minutes: Option<i64>,
    device_json: String,
    network_json: String,
    free_allowance_json: String,
    session_start_time: String,
    session_end_time: Option<String>,
    plan_start_time: String,
    plan_expiry_time: Option<String>,
    data_used_mb: f64,
    time_used_minutes: f64,
    bytes_uploaded: i64,
    bytes_downloaded: i64,
    packets_uploaded: i64,
    packets_downloaded: i64,
    is_active: bool,
    is_expired: bool,
    termination_reason: Option<String>,
    terminated_by: Option<String>,
    last_activity_time: String,
    last_data_update_time: Option<String>,
    version: i64,
}

impl SessionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            session_id: row.get(1)?,
            account_id: row.get(2)?,
            plan_id: row.get(3)?,
            data_limit_mb: row.get(4)?,
            time_limit_minutes: row.get(5)?,
            device_json: row.get(6)?,
            network_json: row.get(7)?,
            free_allowance_json: row.get(8)?,
            session_start_time: row.get(9)?,
            session_end_time: row.get(10)?,
            plan_start_time: row.get(11)?,
            plan_expiry_time: row.get(12)?,
            data_used_mb: row.get(13)?,
            time_used_minutes: row.get(14)?,
            bytes_uploaded: row.get(15)?,
            bytes_downloaded: row.get(16)?,
            packets_uploaded: row.get(17)?,
            packets_downloaded: row.get(18)?,
            is_active: row.get(19)?,
            is_expired: row.get(20)?,
            termination_reason: row.get(21)?,
            terminated_by: row.get(22)?,
            last_activity_time: row.get(23)?,
            last_data_update_time: row.get(24)?,
            version: row.get(25)?,
        })
    }

    fn into_session(self) -> StoreResult<Session> {
        let key = SessionKey::parse(&self.key)
            .ok_or_else(|| StoreError::Serialization(format!("bad session key '{}'", self.key)))?;
        let termination_reason = self
            .termination_reason
            .map(|r| r.parse::<TerminationReason>())
            .transpose()
            .map_err(|e| StoreError::Serialization(format!("termination_reason: {}", e)))?;
        let terminated_by = self
            .terminated_by
            .map(|r| r.parse::<TerminatedBy>())
            .transpose()
            .map_err(|e| StoreError::Serialization(format!("terminated_by: {}", e)))?;

        Ok(Session {
            key,
            session_id: SessionId::new(self.session_id),
            account_id: AccountId::new(self.account_id),
            plan_id: PlanId::new(self.plan_id),
            snapshot: PlanSnapshot {
                data_limit_mb: self.data_limit_mb.map(from_sql_int),
                time_limit_minutes: self.time_limit_minutes.map(from_sql_int),
            },
            device: serde_json::from_str(&self.device_json)?,
            network: serde_json::from_str(&self.network_json)?,
            free_allowance: serde_json::from_str(&self.free_allowance_json)?,
            session_start_time: parse_time(&self.session_start_time)?,
            session_end_time: parse_opt_time(self.session_end_time)?,
            plan_start_time: parse_time(&self.plan_start_time)?,
            plan_expiry_time: parse_opt_time(self.plan_expiry_time)?,
            usage: UsageCounters {
                data_used_mb: self.data_used_mb,
                time_used_minutes: self.time_used_minutes,
                bytes_uploaded: from_sql_int(self.bytes_uploaded),
                bytes_downloaded: from_sql_int(self.bytes_downloaded),
                packets_uploaded: from_sql_int(self.packets_uploaded),
                packets_downloaded: from_sql_int(self.packets_downloaded),
            },
            is_active: self.is_active,
            is_expired: self.is_expired,
            termination_reason,
            terminated_by,
            last_activity_time: parse_time(&self.last_activity_time)?,
            last_data_update_time: parse_opt_time(self.last_data_update_time)?,
            version: from_sql_int(self.version),
        })
    }
}

/// An accounts row as stored, before decoding
struct AccountRow {
    account_id: String,
    name: String,
    phone: Option<String>,
    is_blocked: bool,
    block_reason: Option<String>,
    device_json: String,
    is_session_active: bool,
    session_id: Option<String>,
    plan_id: Option<String>,
    plan_start_time: Option<String>,
    plan_expiry_time: Option<String>,
    ap_mac_address: Option<String>,
    gateway_ip: Option<String>,
    last_connection_time: Option<String>,
}

impl AccountRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            account_id: row.get(0)?,
            name: row.get(1)?,
            phone: row.get(2)?,
            is_blocked: row.get(3)?,
            block_reason: row.get(4)?,
            device_json: row.get(5)?,
            is_session_active: row.get(6)?,
            session_id: row.get(7)?,
            plan_id: row.get(8)?,
            plan_start_time: row.get(9)?,
            plan_expiry_time: row.get(10)?,
            ap_mac_address: row.get(11)?,
            gateway_ip: row.get(12)?,
            last_connection_time: row.get(13)?,
        })
    }

    fn into_account(self) -> StoreResult<Account> {
        Ok(Account {
            account_id: AccountId::new(self.account_id),
            name: self.name,
            phone: self.phone,
            is_blocked: self.is_blocked,
            block_reason: self.block_reason,
            device: serde_json::from_str(&self.device_json)?,
            mirror: AccountMirror {
                is_session_active: self.is_session_active,
                session_id: self.session_id.map(SessionId::new),
                plan_id: self.plan_id.map(PlanId::new),
                plan_start_time: parse_opt_time(self.plan_start_time)?,
                plan_expiry_time: parse_opt_time(self.plan_expiry_time)?,
                ap_mac_address: self.ap_mac_address,
                gateway_ip: self.gateway_ip,
                last_connection_time: parse_opt_time(self.last_connection_time)?,
            },
        })
    }
}

fn query_session(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> StoreResult<Option<Session>> {
    conn.query_row(sql, params, SessionRow::read)
        .optional()?
        .map(SessionRow::into_session)
        .transpose()
}

fn query_sessions(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> StoreResult<Vec<Session>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, SessionRow::read)?;

    let mut sessions = Vec::new();
    for row in rows {
        sessions.push(row?.into_session()?);
    }
    Ok(sessions)
}

fn active_by_session_id(conn: &Connection, session_id: &SessionId) -> StoreResult<Option<Session>> {
    query_session(
        conn,
        &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1 AND is_active = 1"),
        [session_id.as_str()],
    )
}

/// Compare-and-swap write of a session's mutable columns
fn update_session(conn: &Connection, session: &Session, expected_version: u64) -> StoreResult<bool> {
    let changed = conn.execute(
        r#"
        UPDATE sessions SET
            session_end_time = ?1,
            data_used_mb = ?2,
            time_used_minutes = ?3,
            bytes_uploaded = ?4,
            bytes_downloaded = ?5,
            packets_uploaded = ?6,
            packets_downloaded = ?7,
            is_active = ?8,
            is_expired = ?9,
            termination_reason = ?10,
            terminated_by = ?11,
            last_activity_time = ?12,
            last_data_update_time = ?13,
            version = ?14
        WHERE key = ?15 AND version = ?16
        "#,
        params![
            fmt_opt_time(&session.session_end_time),
            session.usage.data_used_mb,
            session.usage.time_used_minutes,
            to_sql_int(session.usage.bytes_uploaded),
            to_sql_int(session.usage.bytes_downloaded),
            to_sql_int(session.usage.packets_uploaded),
            to_sql_int(session.usage.packets_downloaded),
            session.is_active,
            session.is_expired,
            session.termination_reason.map(|r| r.as_str()),
            session.terminated_by.map(|b| b.as_str()),
            fmt_time(&session.last_activity_time),
            fmt_opt_time(&session.last_data_update_time),
            to_sql_int(session.version),
            session.key.to_string(),
            to_sql_int(expected_version),
        ],
    )?;
    Ok(changed == 1)
}

/// Clear the account's active flag if its mirror still points at `key`
fn release_account(conn: &Connection, account_id: &AccountId, key: SessionKey) -> StoreResult<()> {
    conn.execute(
        r#"
        UPDATE accounts SET is_session_active = 0, updated_at = ?1
        WHERE account_id = ?2 AND session_key = ?3 AND is_session_active = 1
        "#,
        params![
            fmt_time(&tollgate_util::now()),
            account_id.as_str(),
            key.to_string()
        ],
    )?;
    Ok(())
}

fn write_mirror(
    conn: &Connection,
    account_id: &AccountId,
    key: Option<SessionKey>,
    mirror: &AccountMirror,
) -> StoreResult<bool> {
    let changed = conn.execute(
        r#"
        UPDATE accounts SET
            is_session_active = ?1,
            session_key = ?2,
            session_id = ?3,
            plan_id = ?4,
            plan_start_time = ?5,
            plan_expiry_time = ?6,
            ap_mac_address = ?7,
            gateway_ip = ?8,
            last_connection_time = ?9,
            updated_at = ?10
        WHERE account_id = ?11
        "#,
        params![
            mirror.is_session_active,
            key.map(|k| k.to_string()),
            mirror.session_id.as_ref().map(|s| s.as_str()),
            mirror.plan_id.as_ref().map(|p| p.as_str()),
            fmt_opt_time(&mirror.plan_start_time),
            fmt_opt_time(&mirror.plan_expiry_time),
            mirror.ap_mac_address,
            mirror.gateway_ip,
            fmt_opt_time(&mirror.last_connection_time),
            fmt_time(&tollgate_util::now()),
            account_id.as_str(),
        ],
    )?;
    Ok(changed == 1)
}

impl Store for SqliteStore {
    fn append_audit(&self, mut event: AuditEvent) -> StoreResult<()> {
        let conn = self.conn()?;
        let event_json = serde_json::to_string(&event.event)?;

        conn.execute(
            "INSERT INTO audit_log (timestamp, event_json) VALUES (?, ?)",
            params![fmt_time(&event.timestamp), event_json],
        )?;

        event.id = conn.last_insert_rowid();
        debug!(event_id = event.id, "Audit event appended");

        Ok(())
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_json FROM audit_log ORDER BY id DESC LIMIT ?",
        )?;

        let rows = stmt.query_map([to_sql_int(limit as u64)], |row| {
            let id: i64 = row.get(0)?;
            let timestamp: String = row.get(1)?;
            let event_json: String = row.get(2)?;
            Ok((id, timestamp, event_json))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, timestamp, event_json) = row?;
            events.push(AuditEvent {
                id,
                timestamp: parse_time(&timestamp)?,
                event: serde_json::from_str(&event_json)?,
            });
        }

        Ok(events)
    }

    fn get_plan(&self, plan_id: &PlanId) -> StoreResult<Option<Plan>> {
        let conn = self.conn()?;

        let plan = conn
            .query_row(
                r#"
                SELECT plan_id, name, data_limit_mb, time_limit_minutes, price, is_active
                FROM plans WHERE plan_id = ?
                "#,
                [plan_id.as_str()],
                |row| {
                    Ok(Plan {
                        plan_id: PlanId::new(row.get::<_, String>(0)?),
                        name: row.get(1)?,
                        data_limit_mb: row.get::<_, Option<i64>>(2)?.map(from_sql_int),
                        time_limit_minutes: row.get::<_, Option<i64>>(3)?.map(from_sql_int),
                        price: from_sql_int(row.get(4)?),
                        is_active: row.get(5)?,
                    })
                },
            )
            .optional()?;

        Ok(plan)
    }

    fn upsert_plan(&self, plan: &Plan) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO plans (plan_id, name, data_limit_mb, time_limit_minutes, price, is_active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(plan_id) DO UPDATE SET
                name = excluded.name,
                data_limit_mb = excluded.data_limit_mb,
                time_limit_minutes = excluded.time_limit_minutes,
                price = excluded.price,
                is_active = excluded.is_active
            "#,
            params![
                plan.plan_id.as_str(),
                plan.name,
                plan.data_limit_mb.map(to_sql_int),
                plan.time_limit_minutes.map(to_sql_int),
                to_sql_int(plan.price),
                plan.is_active,
            ],
        )?;

        debug!(plan_id = %plan.plan_id, "Plan saved");
        Ok(())
    }

    fn get_account(&self, account_id: &AccountId) -> StoreResult<Option<Account>> {
        let conn = self.conn()?;

        conn.query_row(
            &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_id = ?1"),
            [account_id.as_str()],
            AccountRow::read,
        )
        .optional()?
        .map(AccountRow::into_account)
        .transpose()
    }

    fn upsert_account(&self, profile: &AccountProfile) -> StoreResult<()> {
        let conn = self.conn()?;
        let device_json = serde_json::to_string(&profile.device)?;

        conn.execute(
            r#"
            INSERT INTO accounts (account_id, name, phone, device_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(account_id) DO UPDATE SET
                name = excluded.name,
                phone = excluded.phone,
                device_json = excluded.device_json,
                updated_at = excluded.updated_at
            "#,
            params![
                profile.account_id.as_str(),
                profile.name,
                profile.phone,
                device_json,
                fmt_time(&tollgate_util::now()),
            ],
        )?;

        debug!(account_id = %profile.account_id, "Account saved");
        Ok(())
    }

    fn set_account_blocked(
        &self,
        account_id: &AccountId,
        blocked: bool,
        reason: Option<&str>,
    ) -> StoreResult<bool> {
        let conn = self.conn()?;
        let reason = if blocked { reason } else { None };

        let changed = conn.execute(
            "UPDATE accounts SET is_blocked = ?1, block_reason = ?2, updated_at = ?3 WHERE account_id = ?4",
            params![
                blocked,
                reason,
                fmt_time(&tollgate_util::now()),
                account_id.as_str()
            ],
        )?;

        Ok(changed == 1)
    }

    fn set_session_pointer(
        &self,
        account_id: &AccountId,
        key: Option<SessionKey>,
        mirror: &AccountMirror,
    ) -> StoreResult<bool> {
        let conn = self.conn()?;
        write_mirror(&conn, account_id, key, mirror)
    }

    fn insert_session(
        &self,
        session: &Session,
        mirror: &AccountMirror,
    ) -> StoreResult<AdmitOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = active_by_session_id(&tx, &session.session_id)? {
            return Ok(AdmitOutcome::ActiveExists(Box::new(existing)));
        }

        let inserted = tx.execute(
            &format!(
                "INSERT INTO sessions ({SESSION_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, \
                  ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)"
            ),
            params![
                session.key.to_string(),
                session.session_id.as_str(),
                session.account_id.as_str(),
                session.plan_id.as_str(),
                session.snapshot.data_limit_mb.map(to_sql_int),
                session.snapshot.time_limit_minutes.map(to_sql_int),
                serde_json::to_string(&session.device)?,
                serde_json::to_string(&session.network)?,
                serde_json::to_string(&session.free_allowance)?,
                fmt_time(&session.session_start_time),
                fmt_opt_time(&session.session_end_time),
                fmt_time(&session.plan_start_time),
                fmt_opt_time(&session.plan_expiry_time),
                session.usage.data_used_mb,
                session.usage.time_used_minutes,
                to_sql_int(session.usage.bytes_uploaded),
                to_sql_int(session.usage.bytes_downloaded),
                to_sql_int(session.usage.packets_uploaded),
                to_sql_int(session.usage.packets_downloaded),
                session.is_active,
                session.is_expired,
                session.termination_reason.map(|r| r.as_str()),
                session.terminated_by.map(|b| b.as_str()),
                fmt_time(&session.last_activity_time),
                fmt_opt_time(&session.last_data_update_time),
                to_sql_int(session.version),
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                // Another writer won the race for this session id
                warn!(session_id = %session.session_id, "Active session inserted concurrently");
                let existing = active_by_session_id(&tx, &session.session_id)?
                    .ok_or_else(|| StoreError::Database(e.to_string()))?;
                return Ok(AdmitOutcome::ActiveExists(Box::new(existing)));
            }
            Err(e) => return Err(e.into()),
        }

        if !write_mirror(&tx, &session.account_id, Some(session.key), mirror)? {
            warn!(account_id = %session.account_id, "No account row for new session, rolling back");
            return Err(StoreError::MissingAccount(session.account_id.to_string()));
        }
        tx.commit()?;

        debug!(key = %session.key, session_id = %session.session_id, "Session inserted");
        Ok(AdmitOutcome::Inserted)
    }

    fn commit_session(&self, session: &Session) -> StoreResult<bool> {
        let expected = session
            .version
            .checked_sub(1)
            .ok_or_else(|| StoreError::Database("session version must advance".into()))?;

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let applied = update_session(&tx, session, expected)?;
        if applied && !session.is_active {
            release_account(&tx, &session.account_id, session.key)?;
        }
        tx.commit()?;

        debug!(
            key = %session.key,
            version = session.version,
            applied,
            "Session commit"
        );
        Ok(applied)
    }

    fn get_session(&self, key: SessionKey) -> StoreResult<Option<Session>> {
        let conn = self.conn()?;
        query_session(
            &conn,
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE key = ?1"),
            [key.to_string()],
        )
    }

    fn find_session(&self, session_id: &SessionId) -> StoreResult<Option<Session>> {
        let conn = self.conn()?;
        query_session(
            &conn,
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1 \
                 ORDER BY session_start_time DESC, rowid DESC LIMIT 1"
            ),
            [session_id.as_str()],
        )
    }

    fn list_active_sessions(&self, offset: u64, limit: u32) -> StoreResult<Vec<Session>> {
        let conn = self.conn()?;
        query_sessions(
            &conn,
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE is_active = 1 \
                 ORDER BY session_start_time DESC, rowid DESC LIMIT ?1 OFFSET ?2"
            ),
            params![limit, to_sql_int(offset)],
        )
    }

    fn count_active_sessions(&self) -> StoreResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE is_active = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(from_sql_int(count))
    }

    fn all_active_sessions(&self) -> StoreResult<Vec<Session>> {
        let conn = self.conn()?;
        query_sessions(
            &conn,
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE is_active = 1"),
            [],
        )
    }

    fn list_account_sessions(
        &self,
        account_id: &AccountId,
        active: Option<bool>,
        offset: u64,
        limit: u32,
    ) -> StoreResult<Vec<Session>> {
        let conn = self.conn()?;
        query_sessions(
            &conn,
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions \
                 WHERE account_id = ?1 AND (?2 IS NULL OR is_active = ?2) \
                 ORDER BY session_start_time DESC, rowid DESC LIMIT ?3 OFFSET ?4"
            ),
            params![account_id.as_str(), active, limit, to_sql_int(offset)],
        )
    }

    fn count_account_sessions(
        &self,
        account_id: &AccountId,
        active: Option<bool>,
    ) -> StoreResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE account_id = ?1 AND (?2 IS NULL OR is_active = ?2)",
            params![account_id.as_str(), active],
            |row| row.get(0),
        )?;
        Ok(from_sql_int(count))
    }

    fn commit_sweep(&self, ended: &[Session]) -> StoreResult<SweepCommit> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut commit = SweepCommit::default();

        for session in ended {
            let Some(expected) = session.version.checked_sub(1) else {
                continue;
            };
            if update_session(&tx, session, expected)? {
                release_account(&tx, &session.account_id, session.key)?;
                commit.ended.push(session.key);
            } else {
                debug!(key = %session.key, "Swept session changed concurrently, skipping");
            }
        }

        commit.accounts_repaired = tx.execute(
            r#"
            UPDATE accounts SET is_session_active = 0, updated_at = ?1
            WHERE is_session_active = 1
              AND (session_key IS NULL
                   OR session_key NOT IN (SELECT key FROM sessions WHERE is_active = 1))
            "#,
            [fmt_time(&tollgate_util::now())],
        )?;

        tx.commit()?;
        Ok(commit)
    }

    fn account_stats(&self, account_id: &AccountId) -> StoreResult<AccountStats> {
        let conn = self.conn()?;

        let stats = conn.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(is_active), 0),
                   COALESCE(SUM(data_used_mb), 0.0),
                   COALESCE(SUM(time_used_minutes), 0.0),
                   COALESCE(SUM(bytes_uploaded), 0),
                   COALESCE(SUM(bytes_downloaded), 0)
            FROM sessions WHERE account_id = ?1
            "#,
            [account_id.as_str()],
            |row| {
                Ok(AccountStats {
                    total_sessions: from_sql_int(row.get(0)?),
                    active_sessions: from_sql_int(row.get(1)?),
                    total_data_used_mb: row.get(2)?,
                    total_time_used_minutes: row.get(3)?,
                    total_bytes_uploaded: from_sql_int(row.get(4)?),
                    total_bytes_downloaded: from_sql_int(row.get(5)?),
                })
            },
        )?;

        Ok(stats)
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}
