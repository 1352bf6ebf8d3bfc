//! Message value handed to the core by protocol adapters.
//!
//! The core never looks inside the payload; it only needs the identifier,
//! priority, quality of service, destination name and creation time.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::now_millis;

/// Delivery guarantee requested for a message or granted to a subscription.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QualityOfService {
    /// Fire and forget, no acknowledgement from the peer.
    #[default]
    AtMostOnce,
    /// Acknowledged delivery, duplicates possible.
    AtLeastOnce,
    /// Acknowledged delivery with a completion handshake.
    ExactlyOnce,
}

impl QualityOfService {
    /// Numeric level as used on the MQTT family of wires.
    pub fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }

    /// Map a numeric level; anything above 2 is clamped to `ExactlyOnce`.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::AtMostOnce,
            1 => Self::AtLeastOnce,
            _ => Self::ExactlyOnce,
        }
    }

    /// Whether the peer is expected to confirm delivery.
    pub fn requires_ack(self) -> bool {
        !matches!(self, Self::AtMostOnce)
    }
}

/// A message ready for delivery to one subscription.
#[derive(Debug, Clone)]
pub struct Message {
    /// Identifier, monotonically increasing per destination.
    pub id: i64,
    pub priority: u8,
    pub qos: QualityOfService,
    /// Fully qualified destination (topic / queue) name.
    pub destination: String,
    /// Creation time in Unix milliseconds; used for staleness eviction.
    pub creation: i64,
    pub payload: Arc<[u8]>,
}

impl Message {
    /// Create a message stamped with the current time, default priority and QoS 0.
    pub fn new(id: i64, destination: impl Into<String>) -> Self {
        Self {
            id,
            priority: 4,
            qos: QualityOfService::AtMostOnce,
            destination: destination.into(),
            creation: now_millis(),
            payload: Arc::from(Vec::<u8>::new()),
        }
    }

    #[must_use]
    pub fn with_qos(mut self, qos: QualityOfService) -> Self {
        self.qos = qos;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_creation(mut self, creation: i64) -> Self {
        self.creation = creation;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Arc::from(payload.into());
        self
    }

    /// Age of the message relative to `now` (Unix millis), never negative.
    pub fn age_millis(&self, now: i64) -> i64 {
        (now - self.creation).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_levels() {
        assert_eq!(QualityOfService::from_level(0), QualityOfService::AtMostOnce);
        assert_eq!(QualityOfService::from_level(1), QualityOfService::AtLeastOnce);
        assert_eq!(QualityOfService::from_level(7), QualityOfService::ExactlyOnce);
        assert!(!QualityOfService::AtMostOnce.requires_ack());
        assert!(QualityOfService::ExactlyOnce.requires_ack());
        assert_eq!(QualityOfService::ExactlyOnce.level(), 2);
    }

    #[test]
    fn test_message_builder() {
        let msg = Message::new(7, "sensors/a")
            .with_qos(QualityOfService::AtLeastOnce)
            .with_priority(9)
            .with_payload(b"hi".to_vec());
        assert_eq!(msg.id, 7);
        assert_eq!(msg.priority, 9);
        assert_eq!(&msg.payload[..], b"hi");
        assert!(msg.creation > 0);
    }

    #[test]
    fn test_age_is_never_negative() {
        let msg = Message::new(1, "t").with_creation(1_000);
        assert_eq!(msg.age_millis(1_500), 500);
        assert_eq!(msg.age_millis(500), 0);
    }
}
