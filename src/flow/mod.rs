//! Flow control primitives.
//!
//! Provides:
//! - Credit windows for subscriptions
//! - Credit-release notifications for shared subscription groups

pub mod credit;
pub mod notify;

pub use credit::CreditWindow;
pub use notify::{CreditBus, CreditReleased};
