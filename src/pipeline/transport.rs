//! The seam between a pipeline and the protocol adapter's writer.

use tokio::sync::mpsc::{self, error::TrySendError};

use super::DeliveryEvent;
use crate::message::{Message, QualityOfService};

/// Writes delivery events to the peer.
///
/// Implementations must not block: they run on the subscription's serial
/// executor.
pub trait DeliveryTransport: Send + 'static {
    /// Write `event`. Returning false leaves the event queued and unsent; the
    /// pipeline retries on the next `ack_received`, `completed` or `resume`.
    fn send(&mut self, event: &DeliveryEvent) -> bool;

    /// Forget per-session side state such as topic alias caches. Called when a
    /// paused pipeline has fully drained.
    fn clear_side_state(&mut self) {}
}

/// A message handed to the connection writer.
#[derive(Debug, Clone)]
pub struct OutboundDelivery {
    pub message: Message,
    pub qos: QualityOfService,
}

/// Transport backed by a bounded channel to a connection writer task.
///
/// A full channel refuses the event, which is how a slow socket pushes back
/// on the pipeline.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<OutboundDelivery>,
}

impl ChannelTransport {
    /// Create a transport and the receiver the writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundDelivery>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl DeliveryTransport for ChannelTransport {
    fn send(&mut self, event: &DeliveryEvent) -> bool {
        let delivery = OutboundDelivery {
            message: event.message.clone(),
            qos: event.effective_qos(),
        };
        match self.tx.try_send(delivery) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::trace!(message_id = event.message_id(), "Writer channel full");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(message_id = event.message_id(), "Writer channel closed");
                false
            }
        }
    }
}
