//! Credit-release bus for shared subscriptions.
//!
//! When a consumer of a shared subscription acknowledges messages it frees
//! credit; the group coordinator listens here so it can offer backlog to that
//! consumer instead of waiting for the next publish.

use tokio::sync::broadcast::{self, Receiver, Sender};

/// Notification sent when a member of a shared group freed credit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditReleased {
    /// The shared group the member belongs to
    pub group: String,
    /// Session of the member that freed credit
    pub session_id: String,
    /// Number of ledger entries removed
    pub released: usize,
}

/// Broadcast bus carrying [`CreditReleased`] notifications.
#[derive(Clone)]
pub struct CreditBus {
    sender: Sender<CreditReleased>,
}

impl CreditBus {
    /// Create a new bus with the given capacity.
    ///
    /// Older notifications are dropped if listeners fall behind; a lagging
    /// coordinator simply rescans its members.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to notifications.
    pub fn subscribe(&self) -> Receiver<CreditReleased> {
        self.sender.subscribe()
    }

    /// Announce that `session_id` in `group` released `released` credits.
    ///
    /// Returns the number of listeners that received the notification.
    pub fn notify(&self, group: &str, session_id: &str, released: usize) -> usize {
        // send() errors when nobody listens, which is fine
        self.sender
            .send(CreditReleased {
                group: group.to_string(),
                session_id: session_id.to_string(),
                released,
            })
            .unwrap_or(0)
    }

    /// Get the number of active listeners.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for CreditBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
