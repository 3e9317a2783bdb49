//! Shared types for the tollgated API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tollgate_util::{AccountId, PlanId, SessionId, SessionKey};

/// Quota template from the plan catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: PlanId,
    pub name: String,
    /// Data allowance in MB. None (or 0) means unlimited.
    pub data_limit_mb: Option<u64>,
    /// Time allowance in minutes. None (or 0) means unlimited.
    pub time_limit_minutes: Option<u64>,
    /// Price in the smallest currency unit; display only
    #[serde(default)]
    pub price: u64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Quota values copied into a session at admission.
///
/// Later edits to the plan template never touch an existing snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub data_limit_mb: Option<u64>,
    pub time_limit_minutes: Option<u64>,
}

impl PlanSnapshot {
    /// Snapshot a plan's limits, treating a zero limit as unlimited
    pub fn of(plan: &Plan) -> Self {
        Self {
            data_limit_mb: plan.data_limit_mb.filter(|l| *l > 0),
            time_limit_minutes: plan.time_limit_minutes.filter(|l| *l > 0),
        }
    }
}

/// Why a session stopped being active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Plan window (absolute expiry time) passed
    Expired,
    /// Data quota reached
    DataExceeded,
    /// Time quota reached
    TimeExceeded,
    /// Stopped on request
    Manual,
    /// Stopped by the operator for a system reason
    System,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::DataExceeded => "data_exceeded",
            Self::TimeExceeded => "time_exceeded",
            Self::Manual => "manual",
            Self::System => "system",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TerminationReason {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "expired" => Ok(Self::Expired),
            "data_exceeded" => Ok(Self::DataExceeded),
            "time_exceeded" => Ok(Self::TimeExceeded),
            "manual" => Ok(Self::Manual),
            "system" => Ok(Self::System),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Who ended a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminatedBy {
    System,
    Admin,
    User,
}

impl TerminatedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Admin => "admin",
            Self::User => "user",
        }
    }
}

impl fmt::Display for TerminatedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TerminatedBy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "admin" => Ok(Self::Admin),
            "user" => Ok(Self::User),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Unrecognized enum text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown value '{}'", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

/// Device descriptors reported at admission (opaque to the engine)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: Option<String>,
    pub mac_address: String,
    pub ip: String,
    pub device_type: Option<String>,
    pub model: Option<String>,
    pub os: Option<String>,
    pub browser: Option<String>,
}

impl DeviceInfo {
    /// Fill descriptors the caller left out from the account's registered device
    pub fn with_defaults(mut self, profile: &DeviceProfile) -> Self {
        fn fill(slot: &mut Option<String>, fallback: &Option<String>) {
            if slot.is_none() {
                slot.clone_from(fallback);
            }
        }
        fill(&mut self.device_id, &profile.device_id);
        fill(&mut self.device_type, &profile.device_type);
        fill(&mut self.model, &profile.model);
        fill(&mut self.os, &profile.os);
        fill(&mut self.browser, &profile.browser);
        self
    }
}

/// Device registered on an account, used to default admission descriptors
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub device_id: Option<String>,
    pub device_type: Option<String>,
    pub model: Option<String>,
    pub os: Option<String>,
    pub browser: Option<String>,
}

/// Network attachment point (opaque to the engine)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub ap_mac_address: Option<String>,
    pub gateway_ip: Option<String>,
}

/// Free-tier allowance carried on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FreeAllowance {
    pub minutes_allowed: u64,
    pub data_allowed_mb: u64,
    #[serde(default)]
    pub minutes_used: u64,
    #[serde(default)]
    pub data_used_mb: u64,
}

/// Cumulative usage counters of a session
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageCounters {
    pub data_used_mb: f64,
    pub time_used_minutes: f64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub packets_uploaded: u64,
    pub packets_downloaded: u64,
}

/// Usage report from a gateway. Every field is a new cumulative total.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageReport {
    pub data_used_mb: Option<f64>,
    pub time_used_minutes: Option<f64>,
    pub bytes_uploaded: Option<u64>,
    pub bytes_downloaded: Option<u64>,
    pub packets_uploaded: Option<u64>,
    pub packets_downloaded: Option<u64>,
}

impl UsageReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A metered network-access session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub key: SessionKey,
    pub session_id: SessionId,
    pub account_id: AccountId,
    pub plan_id: PlanId,
    pub snapshot: PlanSnapshot,

    pub device: DeviceInfo,
    pub network: NetworkInfo,
    pub free_allowance: FreeAllowance,

    pub session_start_time: DateTime<Utc>,
    pub session_end_time: Option<DateTime<Utc>>,
    pub plan_start_time: DateTime<Utc>,
    pub plan_expiry_time: Option<DateTime<Utc>>,

    pub usage: UsageCounters,

    pub is_active: bool,
    pub is_expired: bool,
    pub termination_reason: Option<TerminationReason>,
    pub terminated_by: Option<TerminatedBy>,

    pub last_activity_time: DateTime<Utc>,
    pub last_data_update_time: Option<DateTime<Utc>>,

    /// Optimistic concurrency counter, bumped on every committed change
    pub version: u64,
}

/// Denormalized session status kept on an account
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountMirror {
    pub is_session_active: bool,
    pub session_id: Option<SessionId>,
    pub plan_id: Option<PlanId>,
    pub plan_start_time: Option<DateTime<Utc>>,
    pub plan_expiry_time: Option<DateTime<Utc>>,
    pub ap_mac_address: Option<String>,
    pub gateway_ip: Option<String>,
    pub last_connection_time: Option<DateTime<Utc>>,
}

/// Account as held by the account directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: AccountId,
    pub name: String,
    pub phone: Option<String>,
    pub is_blocked: bool,
    pub block_reason: Option<String>,
    #[serde(default)]
    pub device: DeviceProfile,
    #[serde(default)]
    pub mirror: AccountMirror,
}

/// Identity fields for creating or updating an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    pub account_id: AccountId,
    pub name: String,
    pub phone: Option<String>,
    #[serde(default)]
    pub device: DeviceProfile,
}

/// Account fields shown alongside a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub account_id: AccountId,
    pub name: String,
    pub phone: Option<String>,
}

impl From<&Account> for AccountSummary {
    fn from(account: &Account) -> Self {
        Self {
            account_id: account.account_id.clone(),
            name: account.name.clone(),
            phone: account.phone.clone(),
        }
    }
}

/// Session with account and plan expanded for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDetail {
    pub session: Session,
    pub account: Option<AccountSummary>,
    pub plan: Option<Plan>,
    /// MB left under the snapshot's data limit, None when unlimited
    pub remaining_data_mb: Option<f64>,
    /// Minutes left in the plan window (or time quota), None when unlimited
    pub remaining_minutes: Option<u64>,
}

/// Per-account usage totals
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AccountStats {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub total_data_used_mb: f64,
    pub total_time_used_minutes: f64,
    pub total_bytes_uploaded: u64,
    pub total_bytes_downloaded: u64,
}

/// One page of a listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub pages: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, page: u32, limit: u32, total: u64) -> Self {
        let pages = if limit == 0 {
            0
        } else {
            total.div_ceil(u64::from(limit))
        };
        Self {
            items,
            page,
            limit,
            total,
            pages,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            page: self.page,
            limit: self.limit,
            total: self.total,
            pages: self.pages,
        }
    }
}

/// Result of a sweep pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SweepSummary {
    /// Sessions terminated as expired
    pub reconciled: usize,
    /// Accounts whose mirror claimed an active session that was not
    pub accounts_repaired: usize,
}

/// Role for authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// Captive-portal gateway: admits, reports usage, terminates, reads
    Gateway,
    /// Local operator: also manages plans/accounts and triggers sweeps
    Admin,
    /// Read-only observer
    Observer,
}

impl ClientRole {
    pub fn can_operate_sessions(&self) -> bool {
        matches!(self, ClientRole::Gateway | ClientRole::Admin)
    }

    pub fn can_administer(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub live: bool,
    pub ready: bool,
    pub store_ok: bool,
    pub last_sweep: Option<DateTime<Utc>>,
}
