//! Per-subscriber outbound pacing.
//!
//! A pipeline sits between a subscription and its transport for protocols
//! that need explicit pacing:
//! - cap the number of events in flight (sent, awaiting confirmation)
//! - pause while the peer cannot take more, optionally dropping QoS 0 traffic
//! - evict events that went stale while queued
//! - drain a quota of events on demand (session replay) and report when empty
//!
//! Queue layout: events that were sent and await confirmation always form a
//! prefix of the queue; everything behind them is unsent backlog. Staleness is
//! checked lazily when an event reaches the front of the backlog, never by a
//! timer.

mod event;
pub mod transport;

pub use event::{Completion, DeliveryEvent, DeliveryOutcome};
pub use transport::{ChannelTransport, DeliveryTransport, OutboundDelivery};

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use crate::now_millis;
use crate::observability::metrics;

/// Pipeline tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Maximum events sent and not yet confirmed.
    pub max_in_flight_events: usize,
    /// Age after which a queued event is discarded; zero disables eviction.
    pub event_timeout: Duration,
    /// Drop QoS 0 events arriving while paused if the subscription is backed up.
    pub drop_qos0: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_in_flight_events: 8,
            event_timeout: Duration::from_secs(30),
            drop_qos0: false,
        }
    }
}

impl PipelineConfig {
    fn timeout_millis(&self) -> Option<i64> {
        if self.event_timeout.is_zero() {
            None
        } else {
            Some(i64::try_from(self.event_timeout.as_millis()).unwrap_or(i64::MAX))
        }
    }
}

#[derive(Debug)]
struct Entry {
    event: DeliveryEvent,
    in_flight: bool,
}

/// Outbound queue for one subscriber.
pub struct DeliveryPipeline<T> {
    name: String,
    transport: T,
    entries: VecDeque<Entry>,
    in_flight: usize,
    paused: bool,
    drain_quota: usize,
    on_drained: Option<Box<dyn FnOnce() + Send + 'static>>,
    config: PipelineConfig,
}

impl<T: DeliveryTransport> DeliveryPipeline<T> {
    pub fn new(name: impl Into<String>, transport: T, mut config: PipelineConfig) -> Self {
        let name = name.into();
        if config.max_in_flight_events == 0 {
            tracing::warn!(pipeline = %name, "max_in_flight_events is 0, using 1");
            config.max_in_flight_events = 1;
        }
        tracing::debug!(
            pipeline = %name,
            max_in_flight = config.max_in_flight_events,
            event_timeout_ms = config.event_timeout.as_millis() as u64,
            drop_qos0 = config.drop_qos0,
            "Delivery pipeline created"
        );
        Self {
            name,
            transport,
            entries: VecDeque::new(),
            in_flight: 0,
            paused: false,
            drain_quota: 0,
            on_drained: None,
            config,
        }
    }

    /// Accept an event for delivery.
    pub fn queue(&mut self, event: DeliveryEvent) {
        if self.paused {
            if self.config.drop_qos0 && event.is_drop_eligible() && event.depth > 1 {
                tracing::debug!(
                    pipeline = %self.name,
                    destination = event.destination(),
                    message_id = event.message_id(),
                    "Paused, dropping QoS 0 event"
                );
                metrics::record_discard(DeliveryOutcome::Dropped);
                event.complete(DeliveryOutcome::Dropped);
                return;
            }
            self.push_backlog(event);
            return;
        }

        let backlog_empty = self.in_flight == self.entries.len();
        if !backlog_empty || self.entries.len() + 1 > self.config.max_in_flight_events {
            self.push_backlog(event);
            return;
        }

        if !self.transport.send(&event) {
            self.push_backlog(event);
            return;
        }
        tracing::trace!(pipeline = %self.name, message_id = event.message_id(), "Event sent");
        if event.requires_ack() {
            self.entries.push_back(Entry {
                event,
                in_flight: true,
            });
            self.in_flight += 1;
        } else {
            event.complete(DeliveryOutcome::Written);
        }
    }

    fn push_backlog(&mut self, event: DeliveryEvent) {
        tracing::trace!(
            pipeline = %self.name,
            message_id = event.message_id(),
            queued = self.entries.len() + 1,
            "Event queued"
        );
        self.entries.push_back(Entry {
            event,
            in_flight: false,
        });
    }

    /// The peer confirmed the oldest in-flight event.
    ///
    /// Returns false when nothing was in flight; the confirmation is ignored.
    pub fn completed(&mut self, message_id: i64) -> bool {
        if !self.entries.front().is_some_and(|entry| entry.in_flight) {
            tracing::debug!(pipeline = %self.name, message_id, "No in-flight event to complete");
            return false;
        }
        if let Some(entry) = self.entries.pop_front() {
            self.in_flight -= 1;
            tracing::trace!(
                pipeline = %self.name,
                message_id,
                head = entry.event.message_id(),
                "Event completed"
            );
        }
        self.send_next();
        true
    }

    /// Confirm the oldest in-flight event only if its message id is at most
    /// `message_id`. Returns false, and changes nothing, otherwise.
    pub fn completed_through(&mut self, message_id: i64) -> bool {
        let confirmable = self
            .entries
            .front()
            .is_some_and(|entry| entry.in_flight && entry.event.message_id() <= message_id);
        confirmable && self.completed(message_id)
    }

    /// A protocol-level acknowledgement unrelated to a queued event arrived
    /// (for example an alias registration); try sending again.
    pub fn ack_received(&mut self) {
        self.send_next();
    }

    /// Send backlog while the in-flight cap and the pause quota allow.
    pub fn send_next(&mut self) {
        let timeout = self.config.timeout_millis();
        loop {
            if self.in_flight >= self.config.max_in_flight_events {
                break;
            }
            if self.paused && self.drain_quota == 0 {
                break;
            }
            let index = self.in_flight;
            let Some(entry) = self.entries.get(index) else {
                break;
            };

            if let Some(limit) = timeout {
                if entry.event.message.age_millis(now_millis()) >= limit {
                    if let Some(expired) = self.entries.remove(index) {
                        tracing::debug!(
                            pipeline = %self.name,
                            destination = expired.event.destination(),
                            message_id = expired.event.message_id(),
                            qos = expired.event.effective_qos().level(),
                            "Queued event timed out"
                        );
                        metrics::record_discard(DeliveryOutcome::Expired);
                        expired.event.complete(DeliveryOutcome::Expired);
                    }
                    continue;
                }
            }

            if !self.transport.send(&self.entries[index].event) {
                tracing::trace!(pipeline = %self.name, "Transport refused event, waiting");
                break;
            }
            if self.paused {
                self.drain_quota -= 1;
            }

            if self.entries[index].event.requires_ack() {
                self.entries[index].in_flight = true;
                self.in_flight += 1;
            } else if let Some(written) = self.entries.remove(index) {
                written.event.complete(DeliveryOutcome::Written);
            }
        }

        if self.entries.is_empty() {
            self.drained();
        }
    }

    fn drained(&mut self) {
        if self.paused {
            self.drain_quota = 0;
            self.transport.clear_side_state();
        }
        if let Some(on_drained) = self.on_drained.take() {
            tracing::debug!(pipeline = %self.name, "Pipeline drained");
            on_drained();
        }
    }

    pub fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            tracing::debug!(pipeline = %self.name, queued = self.entries.len(), "Pipeline paused");
        }
    }

    pub fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            tracing::debug!(pipeline = %self.name, queued = self.entries.len(), "Pipeline resumed");
        }
        self.send_next();
    }

    /// Flush up to `quota` events (all of them when `quota` is zero) and run
    /// `on_drained` once the queue is empty.
    ///
    /// Runs `on_drained` immediately if there is nothing queued.
    pub fn empty_queue<F>(&mut self, quota: usize, on_drained: F)
    where
        F: FnOnce() + Send + 'static,
    {
        tracing::debug!(
            pipeline = %self.name,
            quota,
            pending = self.size(),
            "Draining pipeline"
        );
        if self.entries.is_empty() {
            on_drained();
            return;
        }
        self.on_drained = Some(Box::new(on_drained));
        self.drain_quota = if quota == 0 { usize::MAX } else { quota };
        self.send_next();
    }

    /// Undelivered logical events: each distinct destination counts once,
    /// weighted by the subscription depth captured on its first queued event.
    pub fn size(&self) -> usize {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|entry| seen.insert(entry.event.destination()))
            .map(|entry| entry.event.depth)
            .sum()
    }

    /// Raw number of queued entries, in flight included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Cancel everything queued; used on session close.
    pub fn clear(&mut self) {
        let cancelled = self.entries.len();
        for entry in self.entries.drain(..) {
            entry.event.complete(DeliveryOutcome::Cancelled);
        }
        self.in_flight = 0;
        self.drain_quota = 0;
        self.on_drained = None;
        if cancelled > 0 {
            tracing::debug!(pipeline = %self.name, cancelled, "Pipeline cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, QualityOfService};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingTransport {
        sent: Vec<i64>,
        refuse: bool,
        side_state_cleared: usize,
    }

    impl DeliveryTransport for RecordingTransport {
        fn send(&mut self, event: &DeliveryEvent) -> bool {
            if self.refuse {
                return false;
            }
            self.sent.push(event.message_id());
            true
        }

        fn clear_side_state(&mut self) {
            self.side_state_cleared += 1;
        }
    }

    type Outcomes = Arc<Mutex<Vec<(i64, DeliveryOutcome)>>>;

    fn pipeline(config: PipelineConfig) -> DeliveryPipeline<RecordingTransport> {
        DeliveryPipeline::new("test", RecordingTransport::default(), config)
    }

    fn config(max_in_flight_events: usize) -> PipelineConfig {
        PipelineConfig {
            max_in_flight_events,
            event_timeout: Duration::from_secs(60),
            drop_qos0: true,
        }
    }

    fn event(id: i64, qos: QualityOfService, outcomes: &Outcomes) -> DeliveryEvent {
        let outcomes = outcomes.clone();
        DeliveryEvent::new(Message::new(id, "dest/a").with_qos(qos), qos)
            .on_complete(move |outcome| outcomes.lock().unwrap().push((id, outcome)))
    }

    fn qos1(id: i64, outcomes: &Outcomes) -> DeliveryEvent {
        event(id, QualityOfService::AtLeastOnce, outcomes)
    }

    fn qos0(id: i64, outcomes: &Outcomes) -> DeliveryEvent {
        event(id, QualityOfService::AtMostOnce, outcomes)
    }

    #[test]
    fn test_acknowledged_event_is_sent_and_tracked() {
        let outcomes = Outcomes::default();
        let mut p = pipeline(config(2));
        p.queue(qos1(1, &outcomes));

        assert_eq!(p.transport().sent, vec![1]);
        assert_eq!(p.len(), 1);
        assert_eq!(p.in_flight(), 1);
        assert!(outcomes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unacknowledged_event_completes_immediately() {
        let outcomes = Outcomes::default();
        let mut p = pipeline(config(2));
        p.queue(qos0(1, &outcomes));

        assert_eq!(p.transport().sent, vec![1]);
        assert!(p.is_empty());
        assert_eq!(*outcomes.lock().unwrap(), vec![(1, DeliveryOutcome::Written)]);
    }

    #[test]
    fn test_backlog_waits_for_completion() {
        let outcomes = Outcomes::default();
        let mut p = pipeline(config(1));
        p.queue(qos1(1, &outcomes));
        p.queue(qos1(2, &outcomes));
        p.queue(qos1(3, &outcomes));
        assert_eq!(p.transport().sent, vec![1]);
        assert_eq!(p.len(), 3);

        assert!(p.completed(1));
        assert_eq!(p.transport().sent, vec![1, 2]);
        assert!(p.completed(2));
        assert!(p.completed(3));
        assert_eq!(p.transport().sent, vec![1, 2, 3]);
        assert!(p.is_empty());
        assert!(!p.completed(4));
    }

    #[test]
    fn test_in_flight_never_exceeds_cap() {
        let outcomes = Outcomes::default();
        let mut p = pipeline(config(3));
        for id in 1..=20 {
            p.queue(qos1(id, &outcomes));
            assert!(p.in_flight() <= 3);
            if id % 4 == 0 {
                p.completed(id);
                assert!(p.in_flight() <= 3);
            }
        }
        while p.completed(0) {
            assert!(p.in_flight() <= 3);
        }
        assert_eq!(p.transport().sent, (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn test_completed_never_pops_unsent_backlog() {
        let outcomes = Outcomes::default();
        let mut p = pipeline(config(1));
        p.pause();
        p.queue(qos1(1, &outcomes));
        assert!(!p.completed(1));
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn test_paused_drops_qos0_when_backed_up() {
        let outcomes = Outcomes::default();
        let mut p = pipeline(config(1));
        p.pause();
        p.queue(qos1(1, &outcomes));
        assert_eq!(p.len(), 1);

        p.queue(qos0(2, &outcomes).with_depth(2));
        assert_eq!(p.len(), 1);
        assert_eq!(*outcomes.lock().unwrap(), vec![(2, DeliveryOutcome::Dropped)]);
        assert!(p.transport().sent.is_empty());
    }

    #[test]
    fn test_paused_keeps_qos0_for_shallow_subscription() {
        let outcomes = Outcomes::default();
        let mut p = pipeline(config(1));
        p.pause();
        p.queue(qos0(1, &outcomes).with_depth(1));
        assert_eq!(p.len(), 1);
        assert!(outcomes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_paused_keeps_qos0_when_drop_disabled() {
        let outcomes = Outcomes::default();
        let mut p = pipeline(PipelineConfig {
            drop_qos0: false,
            ..config(1)
        });
        p.pause();
        p.queue(qos0(1, &outcomes).with_depth(5));
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn test_stale_event_is_evicted() {
        let outcomes = Outcomes::default();
        let mut p = pipeline(PipelineConfig {
            event_timeout: Duration::from_millis(100),
            ..config(1)
        });
        p.queue(qos1(1, &outcomes));
        let stale = Message::new(2, "dest/a")
            .with_qos(QualityOfService::AtLeastOnce)
            .with_creation(now_millis() - 10_000);
        let recorder = outcomes.clone();
        p.queue(
            DeliveryEvent::new(stale, QualityOfService::AtLeastOnce)
                .on_complete(move |o| recorder.lock().unwrap().push((2, o))),
        );
        p.queue(qos1(3, &outcomes));

        p.completed(1);
        assert_eq!(p.transport().sent, vec![1, 3]);
        assert_eq!(*outcomes.lock().unwrap(), vec![(2, DeliveryOutcome::Expired)]);
        assert_eq!(p.in_flight(), 1);
    }

    #[test]
    fn test_stale_last_event_drains_paused_pipeline() {
        let mut p = pipeline(PipelineConfig {
            event_timeout: Duration::from_millis(100),
            ..config(1)
        });
        p.pause();
        let stale = Message::new(9, "dest/a")
            .with_qos(QualityOfService::AtLeastOnce)
            .with_creation(now_millis() - 10_000);
        p.queue(DeliveryEvent::new(stale, QualityOfService::AtLeastOnce));

        let drained = Arc::new(AtomicBool::new(false));
        let flag = drained.clone();
        p.empty_queue(0, move || flag.store(true, Ordering::SeqCst));

        assert!(p.is_empty());
        assert!(drained.load(Ordering::SeqCst));
        assert_eq!(p.transport().side_state_cleared, 1);
        assert!(p.transport().sent.is_empty());
    }

    #[test]
    fn test_event_expires_at_exact_timeout() {
        let outcomes = Outcomes::default();
        let mut p = pipeline(PipelineConfig {
            event_timeout: Duration::from_millis(100),
            ..config(1)
        });
        p.pause();
        let edge = Message::new(4, "dest/a")
            .with_qos(QualityOfService::AtLeastOnce)
            .with_creation(now_millis() - 100);
        let recorder = outcomes.clone();
        p.queue(
            DeliveryEvent::new(edge, QualityOfService::AtLeastOnce)
                .on_complete(move |o| recorder.lock().unwrap().push((4, o))),
        );
        p.resume();

        assert!(p.transport().sent.is_empty());
        assert_eq!(*outcomes.lock().unwrap(), vec![(4, DeliveryOutcome::Expired)]);
        assert!(p.is_empty());
    }

    #[test]
    fn test_completed_through_respects_head_id() {
        let outcomes = Outcomes::default();
        let mut p = pipeline(config(1));
        p.queue(qos1(5, &outcomes));
        p.queue(qos1(6, &outcomes));

        assert!(!p.completed_through(4));
        assert_eq!(p.in_flight(), 1);
        assert_eq!(p.transport().sent, vec![5]);

        assert!(p.completed_through(5));
        assert_eq!(p.transport().sent, vec![5, 6]);
        assert_eq!(p.in_flight(), 1);
    }

    #[test]
    fn test_zero_timeout_never_expires() {
        let mut p = pipeline(PipelineConfig {
            event_timeout: Duration::ZERO,
            ..config(1)
        });
        p.pause();
        let ancient = Message::new(1, "dest/a").with_creation(0);
        p.queue(DeliveryEvent::new(ancient, QualityOfService::AtMostOnce));
        p.resume();
        assert_eq!(p.transport().sent, vec![1]);
    }

    #[test]
    fn test_resume_drains_backlog() {
        let outcomes = Outcomes::default();
        let mut p = pipeline(config(4));
        p.pause();
        p.pause();
        for id in 1..=3 {
            p.queue(qos1(id, &outcomes));
        }
        assert!(p.transport().sent.is_empty());

        p.resume();
        assert!(!p.is_paused());
        assert_eq!(p.transport().sent, vec![1, 2, 3]);
        assert_eq!(p.in_flight(), 3);
    }

    #[test]
    fn test_empty_queue_respects_quota() {
        let outcomes = Outcomes::default();
        let mut p = pipeline(config(10));
        p.pause();
        for id in 1..=5 {
            p.queue(qos0(id, &outcomes).with_depth(1));
        }

        let drained = Arc::new(AtomicBool::new(false));
        let flag = drained.clone();
        p.empty_queue(2, move || flag.store(true, Ordering::SeqCst));
        assert_eq!(p.transport().sent, vec![1, 2]);
        assert!(!drained.load(Ordering::SeqCst));

        p.empty_queue(0, {
            let flag = drained.clone();
            move || flag.store(true, Ordering::SeqCst)
        });
        assert_eq!(p.transport().sent, vec![1, 2, 3, 4, 5]);
        assert!(drained.load(Ordering::SeqCst));
        assert!(p.is_paused());
    }

    #[test]
    fn test_empty_queue_on_empty_pipeline_runs_callback_now() {
        let mut p = pipeline(config(1));
        let drained = Arc::new(AtomicBool::new(false));
        let flag = drained.clone();
        p.empty_queue(3, move || flag.store(true, Ordering::SeqCst));
        assert!(drained.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drain_waits_for_in_flight_confirmation() {
        let outcomes = Outcomes::default();
        let mut p = pipeline(config(2));
        p.pause();
        p.queue(qos1(1, &outcomes));

        let drained = Arc::new(AtomicBool::new(false));
        let flag = drained.clone();
        p.empty_queue(0, move || flag.store(true, Ordering::SeqCst));
        assert_eq!(p.transport().sent, vec![1]);
        assert!(!drained.load(Ordering::SeqCst));

        p.completed(1);
        assert!(drained.load(Ordering::SeqCst));
    }

    #[test]
    fn test_size_counts_each_destination_once() {
        let mut p = pipeline(config(1));
        p.pause();
        let make = |id, dest: &str, depth| {
            DeliveryEvent::new(Message::new(id, dest), QualityOfService::AtLeastOnce)
                .with_depth(depth)
        };
        p.queue(make(1, "a", 3));
        p.queue(make(2, "a", 7));
        p.queue(make(3, "b", 2));
        p.queue(make(4, "c", 1));
        p.queue(make(5, "b", 9));

        assert_eq!(p.len(), 5);
        assert_eq!(p.size(), 3 + 2 + 1);
    }

    #[test]
    fn test_refused_event_retried_on_ack_received() {
        let outcomes = Outcomes::default();
        let mut p = pipeline(config(2));
        p.transport_mut().refuse = true;
        p.queue(qos1(1, &outcomes));
        assert_eq!(p.len(), 1);
        assert_eq!(p.in_flight(), 0);

        p.transport_mut().refuse = false;
        p.ack_received();
        assert_eq!(p.transport().sent, vec![1]);
        assert_eq!(p.in_flight(), 1);
    }

    #[test]
    fn test_new_event_waits_behind_unsent_backlog() {
        let outcomes = Outcomes::default();
        let mut p = pipeline(config(4));
        p.transport_mut().refuse = true;
        p.queue(qos1(1, &outcomes));
        p.transport_mut().refuse = false;
        p.queue(qos1(2, &outcomes));
        assert!(p.transport().sent.is_empty());

        p.ack_received();
        assert_eq!(p.transport().sent, vec![1, 2]);
    }

    #[test]
    fn test_clear_cancels_everything() {
        let outcomes = Outcomes::default();
        let mut p = pipeline(config(1));
        p.queue(qos1(1, &outcomes));
        p.queue(qos1(2, &outcomes));
        p.clear();

        assert!(p.is_empty());
        assert_eq!(p.in_flight(), 0);
        assert_eq!(
            *outcomes.lock().unwrap(),
            vec![(1, DeliveryOutcome::Cancelled), (2, DeliveryOutcome::Cancelled)]
        );
    }
}
