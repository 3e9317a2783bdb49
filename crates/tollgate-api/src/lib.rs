//! Protocol and domain types for tollgated
//!
//! This crate defines the stable API between tollgated and its clients:
//! - Session, plan, and account records
//! - Commands (requests from clients) and responses
//! - Events (service -> clients)
//! - Versioning

mod commands;
mod events;
mod types;

pub use commands::*;
pub use events::*;
pub use types::*;

/// Current API version
pub const API_VERSION: u32 = 1;
