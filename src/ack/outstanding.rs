//! Outstanding-message record.

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// One message handed to the transport and not yet confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutstandingRecord {
    pub id: i64,
    pub priority: u8,
}

impl OutstandingRecord {
    pub fn new(id: i64, priority: u8) -> Self {
        Self { id, priority }
    }
}

impl From<&Message> for OutstandingRecord {
    fn from(message: &Message) -> Self {
        Self::new(message.id, message.priority)
    }
}
