//! Work items run on a subscription's serial executor.

use tokio::sync::oneshot;

use super::{Subscription, SubscriptionStats};
use crate::message::Message;
use crate::pipeline::{DeliveryOutcome, DeliveryTransport};

/// Everything that touches a subscription's ledger, window or pipeline
/// arrives as one of these.
#[derive(Debug)]
pub enum SubscriptionTask {
    /// A message routed to this subscription by the destination.
    Deliver(Message),
    /// Offer from a shared group; refused unless credit is free right now.
    Offer(Message),
    /// The pipeline retired an event on its own.
    DeliveryConfirmed(DeliveryOutcome),
    /// The peer acknowledged (`is_ack`) or rolled back a message.
    Acknowledge { message_id: i64, is_ack: bool },
    /// The peer advertised a new receive maximum / prefetch.
    CreditUpdate(u32),
    /// A protocol acknowledgement unrelated to a queued event.
    AckReceived,
    Pause,
    Resume,
    Hibernate,
    Wake,
    /// Flush up to `quota` pipeline events (all when zero).
    Drain { quota: usize },
    /// Another session context attached to the subscription.
    AddContext(String),
    /// A session context detached; the subscription closes with the last.
    Unsubscribe { context: String },
    Stats,
}

impl SubscriptionTask {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Deliver(_) => "deliver",
            Self::Offer(_) => "offer",
            Self::DeliveryConfirmed(_) => "delivery_confirmed",
            Self::Acknowledge { .. } => "acknowledge",
            Self::CreditUpdate(_) => "credit_update",
            Self::AckReceived => "ack_received",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Hibernate => "hibernate",
            Self::Wake => "wake",
            Self::Drain { .. } => "drain",
            Self::AddContext(_) => "add_context",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Stats => "stats",
        }
    }

    /// Apply the task. Must only be called from the subscription's executor.
    pub fn run<T: DeliveryTransport>(self, sub: &mut Subscription<T>) -> TaskOutcome {
        tracing::trace!(subscription = %sub.key(), task = self.name(), "Running task");
        match self {
            Self::Deliver(message) => TaskOutcome::Delivered(sub.register(message)),
            Self::Offer(message) => TaskOutcome::Offered(sub.offer(message)),
            Self::DeliveryConfirmed(outcome) => {
                TaskOutcome::Confirmed(sub.delivery_confirmed(outcome))
            }
            Self::Acknowledge { message_id, is_ack } => {
                TaskOutcome::Released(sub.acknowledge(message_id, is_ack))
            }
            Self::CreditUpdate(credit) => TaskOutcome::CreditChanged(sub.update_credit(credit)),
            Self::AckReceived => {
                sub.ack_received();
                TaskOutcome::Done
            }
            Self::Pause => {
                sub.pause();
                TaskOutcome::Done
            }
            Self::Resume => {
                sub.resume();
                TaskOutcome::Done
            }
            Self::Hibernate => {
                sub.hibernate();
                TaskOutcome::Done
            }
            Self::Wake => {
                sub.wake();
                TaskOutcome::Done
            }
            Self::Drain { quota } => {
                let (tx, rx) = oneshot::channel();
                sub.drain(quota, move || {
                    let _ = tx.send(());
                });
                TaskOutcome::Draining(rx)
            }
            Self::AddContext(context) => {
                sub.add_context(context);
                TaskOutcome::Done
            }
            Self::Unsubscribe { context } => TaskOutcome::Unsubscribed {
                closed: sub.remove_context(&context),
            },
            Self::Stats => TaskOutcome::Stats(Box::new(sub.stats())),
        }
    }
}

/// Result of a [`SubscriptionTask`].
#[derive(Debug)]
pub enum TaskOutcome {
    Done,
    /// Whether the delivered message was sent immediately.
    Delivered(bool),
    /// `Err` hands a refused offer back to the group.
    Offered(Result<(), Message>),
    /// Id retired from the ledger, if any.
    Confirmed(Option<i64>),
    /// Records removed by an acknowledgement or rollback.
    Released(usize),
    /// Whether a credit update opened the window.
    CreditChanged(bool),
    /// Resolves once the pipeline is empty.
    Draining(oneshot::Receiver<()>),
    Unsubscribed { closed: bool },
    Stats(Box<SubscriptionStats>),
}

impl TaskOutcome {
    pub fn released(&self) -> Option<usize> {
        match self {
            Self::Released(n) => Some(*n),
            _ => None,
        }
    }

    pub fn into_stats(self) -> Option<SubscriptionStats> {
        match self {
            Self::Stats(stats) => Some(*stats),
            _ => None,
        }
    }
}
