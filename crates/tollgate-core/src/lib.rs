//! Session lifecycle and quota enforcement engine for tollgated
//!
//! This crate is the heart of tollgated, containing:
//! - Admission against a plan, with the quota frozen into a snapshot
//! - Usage reports and expiry evaluation (window, data, time)
//! - Manual termination and the background sweep
//! - Queries, pagination and per-account statistics
//!
//! Every session write is a version-checked store transaction, so
//! concurrent reports on one session never both win.

mod engine;
mod error;
mod events;
mod session;
mod validate;

pub use engine::*;
pub use error::*;
pub use events::*;
pub use session::*;
pub use validate::*;
