//! Shared utilities for tollgated
//!
//! This crate provides:
//! - ID types (AccountId, PlanId, SessionId, SessionKey, ClientId)
//! - Clock helpers (UTC now with a debug-only mock offset)
//! - Rate limiting helpers
//! - Default paths for socket, config, and data directories

mod ids;
mod paths;
mod rate_limit;
mod time;

pub use ids::*;
pub use paths::*;
pub use rate_limit::*;
pub use time::*;
