//! Count of unsubscribe tasks submitted but not yet run.
//!
//! Session teardown waits on this before it reports the session closed, so a
//! late acknowledgement can never land on a half-closed subscription.

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct UnsubscribeTracker {
    pending: AtomicUsize,
    idle: Notify,
}

impl UnsubscribeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// An unsubscribe task was submitted.
    pub fn begin(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// An unsubscribe task ran, whether or not it closed the subscription.
    pub fn finish(&self) {
        let previous = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous == 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Resolve once no unsubscribe task is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            // Register before checking so a concurrent finish() is not missed
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}
