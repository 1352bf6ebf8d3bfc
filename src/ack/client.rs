//! Explicit client acknowledgement.
//!
//! Acknowledgement is cumulative: acknowledging id `N` retires every
//! outstanding record with id `<= N`. The ledger is ordered by id so the
//! retirement walks from the bottom and stops at the first larger id.

use std::collections::BTreeMap;

use super::OutstandingRecord;
use crate::flow::CreditWindow;
use crate::message::Message;

/// Id-ordered ledger released by protocol acknowledgements.
#[derive(Debug, Clone)]
pub struct ClientAck {
    window: CreditWindow,
    ledger: BTreeMap<i64, OutstandingRecord>,
}

impl ClientAck {
    pub fn new(window: CreditWindow) -> Self {
        Self {
            window,
            ledger: BTreeMap::new(),
        }
    }

    pub fn sent(&mut self, message: &Message) {
        let record = OutstandingRecord::from(message);
        // Re-sending an id already outstanding replaces it without taking more credit.
        if self.ledger.insert(record.id, record).is_none() {
            self.window.decrement();
        }
    }

    pub fn ack(&mut self, id: i64) -> usize {
        self.release_through(id)
    }

    /// Rollback retires like an ack; redelivery belongs to the adapter.
    pub fn rollback(&mut self, id: i64) -> usize {
        self.release_through(id)
    }

    /// Nothing is retired on transport completion.
    pub fn message_sent(&mut self) -> i64 {
        -1
    }

    fn release_through(&mut self, id: i64) -> usize {
        let mut released = 0;
        while let Some(entry) = self.ledger.first_entry() {
            if *entry.key() > id {
                break;
            }
            entry.remove();
            self.window.increment();
            released += 1;
        }
        released
    }

    pub fn can_send(&self) -> bool {
        self.ledger.len() < self.window.current_credit() as usize
    }

    pub fn outstanding(&self) -> Vec<OutstandingRecord> {
        self.ledger.values().copied().collect()
    }

    pub fn size(&self) -> usize {
        self.ledger.len()
    }

    pub fn window(&self) -> &CreditWindow {
        &self.window
    }

    pub fn window_mut(&mut self) -> &mut CreditWindow {
        &mut self.window
    }

    /// Teardown path: drop the ledger, do not release credit as if acknowledged.
    pub fn clear(&mut self) {
        self.ledger.clear();
        self.window.reset();
    }
}
