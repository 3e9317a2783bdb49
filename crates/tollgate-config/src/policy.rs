//! Validated configuration types

use crate::schema::{RawConfig, RawEngineConfig, RawPlan, RawServiceConfig};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tollgate_api::Plan;
use tollgate_util::{PlanId, default_data_dir, default_socket_path};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 30;
pub const DEFAULT_STORE_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_REPORT_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_MAX_PAGE_LIMIT: u32 = 200;

/// Validated configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub service: ServiceConfig,
    pub engine: EngineConfig,
    /// Plans upserted into the catalog at startup
    pub plans: Vec<Plan>,
}

impl Config {
    pub(crate) fn from_raw(raw: RawConfig) -> Self {
        Self {
            service: ServiceConfig::from_raw(raw.service),
            engine: EngineConfig::from_raw(raw.engine),
            plans: raw.plans.into_iter().map(convert_plan).collect(),
        }
    }

    pub fn get_plan(&self, id: &PlanId) -> Option<&Plan> {
        self.plans.iter().find(|p| &p.plan_id == id)
    }
}

/// Daemon process settings
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    pub sweep_interval: Duration,
    pub request_timeout: Duration,
    pub requests_per_second: u32,
}

impl ServiceConfig {
    fn from_raw(raw: RawServiceConfig) -> Self {
        Self {
            socket_path: raw.socket_path.unwrap_or_else(default_socket_path),
            data_dir: raw.data_dir.unwrap_or_else(default_data_dir),
            sweep_interval: raw
                .sweep_interval_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_SWEEP_INTERVAL),
            request_timeout: raw
                .request_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            requests_per_second: raw
                .requests_per_second
                .unwrap_or(DEFAULT_REQUESTS_PER_SECOND),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_raw(RawServiceConfig::default())
    }
}

/// Session engine settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub store_retry_attempts: u32,
    pub report_retry_attempts: u32,
    pub usage_regression: UsageRegression,
    pub max_page_limit: u32,
}

impl EngineConfig {
    fn from_raw(raw: RawEngineConfig) -> Self {
        Self {
            store_retry_attempts: raw
                .store_retry_attempts
                .unwrap_or(DEFAULT_STORE_RETRY_ATTEMPTS),
            report_retry_attempts: raw
                .report_retry_attempts
                .unwrap_or(DEFAULT_REPORT_RETRY_ATTEMPTS),
            // Validation already rejected unknown modes
            usage_regression: raw
                .usage_regression
                .and_then(|m| m.parse().ok())
                .unwrap_or_default(),
            max_page_limit: raw.max_page_limit.unwrap_or(DEFAULT_MAX_PAGE_LIMIT),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_raw(RawEngineConfig::default())
    }
}

/// What to do with a usage report whose cumulative value went down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UsageRegression {
    /// Refuse the report as invalid input
    #[default]
    Reject,
    /// Keep the stored (higher) value
    Clamp,
}

impl FromStr for UsageRegression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(Self::Reject),
            "clamp" => Ok(Self::Clamp),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for UsageRegression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reject => f.write_str("reject"),
            Self::Clamp => f.write_str("clamp"),
        }
    }
}

fn convert_plan(raw: RawPlan) -> Plan {
    Plan {
        plan_id: PlanId::new(raw.id),
        name: raw.name,
        data_limit_mb: raw.data_limit_mb,
        time_limit_minutes: raw.time_limit_minutes,
        price: raw.price,
        is_active: raw.active,
    }
}
