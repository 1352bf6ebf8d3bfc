//! Acknowledgement controllers.
//!
//! A controller owns the credit window and the outstanding-message ledger of
//! one subscription and decides when more sends are permitted. Two strategies
//! exist, chosen once at subscribe time:
//!
//! - [`AckStrategy::Auto`]: fire and forget. The oldest record is retired as
//!   soon as the transport confirms the write ([`AckController::message_sent`]).
//! - [`AckStrategy::Client`]: the peer acknowledges explicitly and
//!   cumulatively ([`AckController::ack`]).
//!
//! Callers check [`AckController::can_send`] before every
//! [`AckController::sent`]; the controller does not enforce it. Every
//! operation is total: unknown ids are ignored and nothing returns an error.

pub mod auto;
pub mod client;
pub mod outstanding;

pub use auto::AutoAck;
pub use client::ClientAck;
pub use outstanding::OutstandingRecord;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::flow::CreditWindow;
use crate::message::Message;

/// Which acknowledgement semantics a subscription uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStrategy {
    Auto,
    Client,
}

impl AckStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Client => "client",
        }
    }
}

impl fmt::Display for AckStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AckStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "client" => Ok(Self::Client),
            _ => Err(format!("unknown acknowledgement strategy: {}", s)),
        }
    }
}

/// Create a controller for a fresh subscription.
pub fn create_controller(strategy: AckStrategy, initial_credit: u32) -> AckController {
    AckController::with_window(strategy, CreditWindow::new(initial_credit))
}

/// Ledger and credit window of one subscription.
#[derive(Debug, Clone)]
pub enum AckController {
    Auto(AutoAck),
    Client(ClientAck),
}

impl AckController {
    /// Wrap an existing window, e.g. one carried over from a resumed session.
    pub fn with_window(strategy: AckStrategy, window: CreditWindow) -> Self {
        match strategy {
            AckStrategy::Auto => Self::Auto(AutoAck::new(window)),
            AckStrategy::Client => Self::Client(ClientAck::new(window)),
        }
    }

    pub fn strategy(&self) -> AckStrategy {
        match self {
            Self::Auto(_) => AckStrategy::Auto,
            Self::Client(_) => AckStrategy::Client,
        }
    }

    /// Record `message` as outstanding and consume one credit.
    pub fn sent(&mut self, message: &Message) {
        match self {
            Self::Auto(c) => c.sent(message),
            Self::Client(c) => c.sent(message),
        }
    }

    /// Acknowledge `id`. Returns the number of records retired.
    pub fn ack(&mut self, id: i64) -> usize {
        match self {
            Self::Auto(c) => c.ack(id),
            Self::Client(c) => c.ack(id),
        }
    }

    /// Roll back `id`: the transport will not retry it. Returns the number of
    /// records retired.
    pub fn rollback(&mut self, id: i64) -> usize {
        match self {
            Self::Auto(c) => c.rollback(id),
            Self::Client(c) => c.rollback(id),
        }
    }

    /// `size() < current_credit`.
    pub fn can_send(&self) -> bool {
        match self {
            Self::Auto(c) => c.can_send(),
            Self::Client(c) => c.can_send(),
        }
    }

    /// Transport write completed. Returns the retired id, or `-1`.
    pub fn message_sent(&mut self) -> i64 {
        match self {
            Self::Auto(c) => c.message_sent(),
            Self::Client(c) => c.message_sent(),
        }
    }

    /// Snapshot of the ledger in retirement order.
    pub fn outstanding(&self) -> Vec<OutstandingRecord> {
        match self {
            Self::Auto(c) => c.outstanding(),
            Self::Client(c) => c.outstanding(),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Self::Auto(c) => c.size(),
            Self::Client(c) => c.size(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn window(&self) -> &CreditWindow {
        match self {
            Self::Auto(c) => c.window(),
            Self::Client(c) => c.window(),
        }
    }

    pub fn max_outstanding(&self) -> u32 {
        self.window().current_credit()
    }

    /// Resize the window. Returns true if more sends may now be possible.
    pub fn set_max_outstanding(&mut self, credit: u32) -> bool {
        let window = match self {
            Self::Auto(c) => c.window_mut(),
            Self::Client(c) => c.window_mut(),
        };
        window.set_current_credit(credit)
    }

    /// Drop the ledger without acknowledging anything.
    pub fn clear(&mut self) {
        match self {
            Self::Auto(c) => c.clear(),
            Self::Client(c) => c.clear(),
        }
    }

    /// Teardown on unsubscribe or session close.
    pub fn close(&mut self) {
        tracing::debug!(
            strategy = %self.strategy(),
            outstanding = self.size(),
            "Closing acknowledgement controller"
        );
        self.clear();
    }
}
