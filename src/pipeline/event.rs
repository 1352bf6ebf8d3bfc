//! Delivery events queued on a pipeline.

use std::fmt;

use crate::message::{Message, QualityOfService};

/// Why the pipeline retired an event on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// A no-acknowledgement event was written to the transport.
    Written,
    /// Dropped while paused under the low-priority backpressure policy.
    Dropped,
    /// Aged past the pipeline's event timeout before it could be sent.
    Expired,
    /// The pipeline was cleared (session closed or hibernated).
    Cancelled,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Written => "written",
            Self::Dropped => "dropped",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Callback run exactly once when the pipeline retires an event itself.
pub type Completion = Box<dyn FnOnce(DeliveryOutcome) + Send + 'static>;

/// A message on its way to one subscriber.
pub struct DeliveryEvent {
    pub message: Message,
    /// QoS granted to the subscription.
    pub granted_qos: QualityOfService,
    /// Messages held by the subscription (waiting plus outstanding) when
    /// the event was built.
    pub depth: usize,
    completion: Option<Completion>,
}

impl DeliveryEvent {
    pub fn new(message: Message, granted_qos: QualityOfService) -> Self {
        Self {
            message,
            granted_qos,
            depth: 1,
            completion: None,
        }
    }

    #[must_use]
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    #[must_use]
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(DeliveryOutcome) + Send + 'static,
    {
        self.completion = Some(Box::new(f));
        self
    }

    pub fn message_id(&self) -> i64 {
        self.message.id
    }

    pub fn destination(&self) -> &str {
        &self.message.destination
    }

    /// Effective QoS is the lower of what was published and what was granted.
    pub fn effective_qos(&self) -> QualityOfService {
        self.message.qos.min(self.granted_qos)
    }

    /// Whether the peer will confirm this event.
    pub fn requires_ack(&self) -> bool {
        self.effective_qos().requires_ack()
    }

    /// Published without any delivery guarantee.
    pub fn is_drop_eligible(&self) -> bool {
        self.message.qos == QualityOfService::AtMostOnce
    }

    /// Run the completion callback, if any.
    pub fn complete(mut self, outcome: DeliveryOutcome) {
        if let Some(f) = self.completion.take() {
            f(outcome);
        }
    }
}

impl fmt::Debug for DeliveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryEvent")
            .field("message_id", &self.message.id)
            .field("destination", &self.message.destination)
            .field("granted_qos", &self.granted_qos)
            .field("depth", &self.depth)
            .field("has_completion", &self.completion.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_effective_qos_is_minimum() {
        let msg = Message::new(1, "a").with_qos(QualityOfService::ExactlyOnce);
        let event = DeliveryEvent::new(msg, QualityOfService::AtMostOnce);
        assert_eq!(event.effective_qos(), QualityOfService::AtMostOnce);
        assert!(!event.requires_ack());
        assert!(!event.is_drop_eligible());
    }

    #[test]
    fn test_complete_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let event = DeliveryEvent::new(Message::new(1, "a"), QualityOfService::AtLeastOnce)
            .on_complete(move |outcome| {
                assert_eq!(outcome, DeliveryOutcome::Expired);
                counter.fetch_add(1, Ordering::SeqCst);
            });
        event.complete(DeliveryOutcome::Expired);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
