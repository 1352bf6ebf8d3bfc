//! Fire-and-forget acknowledgement.
//!
//! Records are retired in send order. Nothing downstream acknowledges
//! selectively, so `ack`/`rollback` ignore the id they are given and always
//! retire the oldest record; the adapter calls them in send order.

use std::collections::VecDeque;

use super::OutstandingRecord;
use crate::flow::CreditWindow;
use crate::message::Message;

/// FIFO ledger released on transport write completion.
#[derive(Debug, Clone)]
pub struct AutoAck {
    window: CreditWindow,
    ledger: VecDeque<OutstandingRecord>,
}

impl AutoAck {
    pub fn new(window: CreditWindow) -> Self {
        Self {
            window,
            ledger: VecDeque::new(),
        }
    }

    pub fn sent(&mut self, message: &Message) {
        self.ledger.push_back(OutstandingRecord::from(message));
        self.window.decrement();
    }

    /// Retire the head record; `_id` is accepted for symmetry only.
    pub fn ack(&mut self, _id: i64) -> usize {
        self.pop_head().map_or(0, |_| 1)
    }

    /// Same as [`ack`](Self::ack): the transport will not retry.
    pub fn rollback(&mut self, _id: i64) -> usize {
        self.pop_head().map_or(0, |_| 1)
    }

    /// The transport finished writing; retire the oldest record.
    ///
    /// Returns its id or `-1` when nothing is outstanding.
    pub fn message_sent(&mut self) -> i64 {
        self.pop_head().map_or(-1, |record| record.id)
    }

    fn pop_head(&mut self) -> Option<OutstandingRecord> {
        let record = self.ledger.pop_front()?;
        self.window.increment();
        Some(record)
    }

    pub fn can_send(&self) -> bool {
        self.ledger.len() < self.window.current_credit() as usize
    }

    pub fn outstanding(&self) -> Vec<OutstandingRecord> {
        self.ledger.iter().copied().collect()
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

    pub fn clear(&mut self) {
        self.ledger.clear();
        self.window.reset();
    }
}
