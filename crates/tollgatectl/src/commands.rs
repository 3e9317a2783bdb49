//! Command-line definitions and their mapping onto IPC commands

use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tollgate_api::{
    AccountProfile, AdmitRequest, Command, DeviceInfo, FreeAllowance, NetworkInfo, Plan,
    TerminatedBy, TerminationReason, UsageReport,
};
use tollgate_util::{AccountId, PlanId, SessionId, SessionKey, default_socket_path};

use crate::output::OutputFormat;

/// tollgatectl - talk to a running tollgated
#[derive(Debug, Parser)]
#[command(name = "tollgatectl", version, about, long_about = None)]
pub struct Cli {
    /// Socket path (or set TOLLGATE_SOCKET env var)
    #[arg(short, long, env = "TOLLGATE_SOCKET", default_value_os_t = default_socket_path())]
    pub socket: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: CtlCommand,
}

#[derive(Debug, Subcommand)]
pub enum CtlCommand {
    /// Admit a new session against a plan
    Admit {
        #[arg(long)]
        account: String,
        #[arg(long)]
        plan: String,
        /// Router/RADIUS session identifier
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        mac: String,
        #[arg(long)]
        ip: String,
        #[arg(long)]
        device_id: Option<String>,
        #[arg(long)]
        device_type: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        os: Option<String>,
        #[arg(long)]
        browser: Option<String>,
        /// Access point MAC address
        #[arg(long)]
        ap_mac: Option<String>,
        #[arg(long)]
        gateway_ip: Option<String>,
        /// Free-tier minutes granted with this session
        #[arg(long, default_value_t = 0)]
        free_minutes: u64,
        /// Free-tier data (MB) granted with this session
        #[arg(long, default_value_t = 0)]
        free_data_mb: u64,
    },

    /// Report cumulative usage for a session
    Report {
        key: String,
        #[arg(long)]
        data_mb: Option<f64>,
        #[arg(long)]
        time_minutes: Option<f64>,
        #[arg(long)]
        bytes_up: Option<u64>,
        #[arg(long)]
        bytes_down: Option<u64>,
        #[arg(long)]
        packets_up: Option<u64>,
        #[arg(long)]
        packets_down: Option<u64>,
    },

    /// End an active session
    Terminate {
        key: String,
        /// expired, data_exceeded, time_exceeded, manual or system
        #[arg(long)]
        reason: Option<String>,
        /// system, admin or user
        #[arg(long)]
        actor: Option<String>,
    },

    /// Expire every active session past a limit
    Sweep,

    /// Show a session by key
    Session { key: String },

    /// Show the latest session carrying a router session id
    Find { session_id: String },

    /// List active sessions
    Active {
        #[arg(long)]
        page: Option<u32>,
        #[arg(long)]
        limit: Option<u32>,
    },

    /// List an account's sessions
    Sessions {
        account: String,
        /// Only active (true) or ended (false) sessions
        #[arg(long)]
        active: Option<bool>,
        #[arg(long)]
        page: Option<u32>,
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Usage totals for an account
    Stats { account: String },

    /// Show an account
    Account { account: String },

    /// Create or replace a plan
    SetPlan {
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        data_limit_mb: Option<u64>,
        #[arg(long)]
        time_limit_minutes: Option<u64>,
        #[arg(long, default_value_t = 0)]
        price: u64,
        /// Hide the plan from new purchases
        #[arg(long)]
        inactive: bool,
    },

    /// Create an account or update its identity fields
    SetAccount {
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: Option<String>,
    },

    /// Block an account from new admissions
    Block {
        account: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Lift an account block
    Unblock { account: String },

    /// Service health
    Health,

    Ping,

    /// Stream events until the service goes away
    Watch,
}

fn parse_key(key: &str) -> Result<SessionKey> {
    SessionKey::parse(key).ok_or_else(|| anyhow!("'{}' is not a session key", key))
}

impl CtlCommand {
    pub fn into_command(self) -> Result<Command> {
        let command = match self {
            CtlCommand::Admit {
                account,
                plan,
                session_id,
                mac,
                ip,
                device_id,
                device_type,
                model,
                os,
                browser,
                ap_mac,
                gateway_ip,
                free_minutes,
                free_data_mb,
            } => {
                let free_allowance = (free_minutes > 0 || free_data_mb > 0).then(|| FreeAllowance {
                    minutes_allowed: free_minutes,
                    data_allowed_mb: free_data_mb,
                    ..Default::default()
                });
                Command::AdmitSession(AdmitRequest {
                    account_id: AccountId::new(account),
                    plan_id: PlanId::new(plan),
                    session_id: SessionId::new(session_id),
                    device: DeviceInfo {
                        device_id,
                        mac_address: mac,
                        ip,
                        device_type,
                        model,
                        os,
                        browser,
                    },
                    network: NetworkInfo {
                        ap_mac_address: ap_mac,
                        gateway_ip,
                    },
                    free_allowance,
                })
            }

            CtlCommand::Report {
                key,
                data_mb,
                time_minutes,
                bytes_up,
                bytes_down,
                packets_up,
                packets_down,
            } => {
                let report = UsageReport {
                    data_used_mb: data_mb,
                    time_used_minutes: time_minutes,
                    bytes_uploaded: bytes_up,
                    bytes_downloaded: bytes_down,
                    packets_uploaded: packets_up,
                    packets_downloaded: packets_down,
                };
                if report.is_empty() {
                    bail!("a report needs at least one counter");
                }
                Command::ReportUsage {
                    key: parse_key(&key)?,
                    report,
                }
            }

            CtlCommand::Terminate { key, reason, actor } => Command::TerminateSession {
                key: parse_key(&key)?,
                reason: reason
                    .map(|r| r.parse::<TerminationReason>())
                    .transpose()?,
                actor: actor.map(|a| a.parse::<TerminatedBy>()).transpose()?,
            },

            CtlCommand::Sweep => Command::Sweep,

            CtlCommand::Session { key } => Command::GetSession {
                key: parse_key(&key)?,
            },

            CtlCommand::Find { session_id } => Command::GetSessionBySessionId {
                session_id: SessionId::new(session_id),
            },

            CtlCommand::Active { page, limit } => Command::ListActiveSessions { page, limit },

            CtlCommand::Sessions {
                account,
                active,
                page,
                limit,
            } => Command::ListAccountSessions {
                account_id: AccountId::new(account),
                active,
                page,
                limit,
            },

            CtlCommand::Stats { account } => Command::GetAccountStats {
                account_id: AccountId::new(account),
            },

            CtlCommand::Account { account } => Command::GetAccount {
                account_id: AccountId::new(account),
            },

            CtlCommand::SetPlan {
                id,
                name,
                data_limit_mb,
                time_limit_minutes,
                price,
                inactive,
            } => Command::UpsertPlan {
                plan: Plan {
                    plan_id: PlanId::new(id),
                    name,
                    data_limit_mb,
                    time_limit_minutes,
                    price,
                    is_active: !inactive,
                },
            },

            CtlCommand::SetAccount { id, name, phone } => Command::UpsertAccount {
                profile: AccountProfile {
                    account_id: AccountId::new(id),
                    name,
                    phone,
                    device: Default::default(),
                },
            },

            CtlCommand::Block { account, reason } => Command::SetAccountBlocked {
                account_id: AccountId::new(account),
                blocked: true,
                reason,
            },

            CtlCommand::Unblock { account } => Command::SetAccountBlocked {
                account_id: AccountId::new(account),
                blocked: false,
                reason: None,
            },

            CtlCommand::Health => Command::GetHealth,
            CtlCommand::Ping => Command::Ping,
            CtlCommand::Watch => Command::SubscribeEvents,
        };
        Ok(command)
    }
}
