//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Daemon process settings
    #[serde(default)]
    pub service: RawServiceConfig,

    /// Session engine settings
    #[serde(default)]
    pub engine: RawEngineConfig,

    /// Plans seeded into the catalog at startup
    #[serde(default)]
    pub plans: Vec<RawPlan>,
}

/// Daemon-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    /// IPC socket path (default: $XDG_RUNTIME_DIR/tollgated/tollgated.sock)
    pub socket_path: Option<PathBuf>,

    /// Data directory holding the SQLite database
    pub data_dir: Option<PathBuf>,

    /// Seconds between background sweeps
    pub sweep_interval_seconds: Option<u64>,

    /// Upper bound on a single request, store retries included
    pub request_timeout_ms: Option<u64>,

    /// Per-client request budget
    pub requests_per_second: Option<u32>,
}

/// Engine settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawEngineConfig {
    /// Attempts for reads and sweeps when the store is busy
    pub store_retry_attempts: Option<u32>,

    /// Re-read/re-evaluate attempts when a usage report loses a race
    pub report_retry_attempts: Option<u32>,

    /// "reject" or "clamp"
    pub usage_regression: Option<String>,

    /// Largest page size a listing may request
    pub max_page_limit: Option<u32>,
}

/// Raw plan definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawPlan {
    /// Unique stable ID
    pub id: String,

    /// Display name
    pub name: String,

    /// Data allowance; absent or 0 means unlimited
    pub data_limit_mb: Option<u64>,

    /// Time allowance; absent or 0 means unlimited
    pub time_limit_minutes: Option<u64>,

    #[serde(default)]
    pub price: u64,

    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}
