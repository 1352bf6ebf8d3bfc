//! Ackflow: acknowledgement tracking and credit-based flow control for the
//! outbound side of a multi-protocol message broker.
//!
//! Every subscription owns a credit window, a ledger of messages delivered
//! but not yet acknowledged, and (for protocols that need pacing) a delivery
//! pipeline. All three are mutated only from the subscription's own serial
//! executor, so none of them carries a lock.
//!
//! # Modules
//!
//! - [`ack`]: Outstanding ledgers and the `auto`/`client` controllers
//! - [`config`]: CLI and environment configuration
//! - [`executor`]: Serial task executors
//! - [`flow`]: Credit window and credit-release notifications
//! - [`message`]: Messages and quality-of-service levels
//! - [`observability`]: Metrics and tracing setup
//! - [`pipeline`]: Per-subscriber outbound pacing
//! - [`soak`]: Load driver used by the `ackflow` binary
//! - [`subscription`]: Subscription state, tasks and registry

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions, // ack::AckController is fine
    clippy::must_use_candidate,      // Not all functions need #[must_use]
    clippy::missing_errors_doc,      // Error docs can be verbose
    clippy::missing_panics_doc,      // Panic docs can be verbose
    clippy::struct_excessive_bools,  // Config and stats structs carry flags
    clippy::too_many_lines           // Some functions are inherently long
)]

pub mod ack;
pub mod config;
pub mod executor;
pub mod flow;
pub mod message;
pub mod observability;
pub mod pipeline;
pub mod soak;
pub mod subscription;

use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable) session ID.
///
/// # Example
///
/// ```
/// let id = ackflow::generate_session_id();
/// assert!(id.len() == 36); // UUID string format
/// ```
#[must_use]
pub fn generate_session_id() -> String {
    Uuid::now_v7().to_string()
}

/// Get the current Unix timestamp in milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
