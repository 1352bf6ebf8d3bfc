//! Subscription state and its serial executor.
//!
//! A [`Subscription`] joins a destination to a session: the messages routed
//! to it but not yet sent (the at-rest queue), the acknowledgement controller
//! and the delivery pipeline. It lives inside a [`SerialExecutor`] and is only
//! ever touched through [`SubscriptionTask`]s, so scheduling, acknowledgement
//! handling and credit updates never race.

pub mod registry;
pub mod shared;
pub mod task;
pub mod tracker;

pub use registry::{RegistryError, SubscriptionRegistry};
pub use shared::{GroupStats, SharedGroup};
pub use task::{SubscriptionTask, TaskOutcome};
pub use tracker::UnsubscribeTracker;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use crate::ack::{create_controller, AckController, AckStrategy};
use crate::executor::{ExecutorError, ExecutorSnapshot, SerialExecutor, TaskHandle, WeakExecutor};
use crate::flow::CreditBus;
use crate::message::{Message, QualityOfService};
use crate::observability::metrics;
use crate::pipeline::{DeliveryEvent, DeliveryOutcome, DeliveryPipeline, DeliveryTransport, PipelineConfig};

/// Identity of a subscription: one destination seen from one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub destination: String,
    pub session_id: String,
}

impl SubscriptionKey {
    pub fn new(destination: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.destination, self.session_id)
    }
}

/// Per-subscription settings fixed at subscribe time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    pub strategy: AckStrategy,
    /// Initial credit (receive maximum / prefetch).
    pub credit: u32,
    /// Highest QoS the peer was granted.
    pub granted_qos: QualityOfService,
    pub pipeline: PipelineConfig,
    /// Shared-subscription group this member belongs to.
    pub shared_group: Option<String>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            strategy: AckStrategy::Client,
            credit: 32,
            granted_qos: QualityOfService::AtLeastOnce,
            pipeline: PipelineConfig::default(),
            shared_group: None,
        }
    }
}

/// Point-in-time view of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    pub destination: String,
    pub session_id: String,
    pub strategy: AckStrategy,
    /// Messages routed to the subscription
    pub registered: u64,
    /// Messages handed to the pipeline
    pub sent: u64,
    /// Ledger records released by acknowledgement or write completion
    pub acked: u64,
    /// Ledger records released by rollback
    pub rolled_back: u64,
    pub dropped: u64,
    pub expired: u64,
    /// At-rest messages not yet handed to the pipeline
    pub pending: usize,
    /// Ledger size
    pub outstanding: usize,
    /// Pipeline entries, in flight included
    pub queued: usize,
    pub in_flight: usize,
    pub credit: u32,
    pub contexts: usize,
    pub paused: bool,
    pub hibernating: bool,
    pub closed: bool,
}

impl SubscriptionStats {
    /// Nothing waiting, nothing in the pipeline, nothing unacknowledged.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.queued == 0 && self.outstanding == 0
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    registered: u64,
    sent: u64,
    acked: u64,
    rolled_back: u64,
    dropped: u64,
    expired: u64,
}

struct SharedLink {
    group: String,
    bus: CreditBus,
}

/// State of one subscription. Owned by its executor.
pub struct Subscription<T> {
    key: SubscriptionKey,
    granted_qos: QualityOfService,
    controller: AckController,
    pipeline: DeliveryPipeline<T>,
    contexts: BTreeSet<String>,
    pending: VecDeque<Message>,
    paused: bool,
    hibernating: bool,
    closed: bool,
    counters: Counters,
    shared: Option<SharedLink>,
    executor: WeakExecutor<Subscription<T>>,
}

impl<T: DeliveryTransport> Subscription<T> {
    fn new(
        key: SubscriptionKey,
        context: String,
        config: SubscriptionConfig,
        transport: T,
        credit_bus: Option<CreditBus>,
        executor: WeakExecutor<Self>,
    ) -> Self {
        let shared = match (config.shared_group, credit_bus) {
            (Some(group), Some(bus)) => Some(SharedLink { group, bus }),
            (Some(group), None) => {
                tracing::warn!(subscription = %key, group, "Shared group without a credit bus");
                None
            }
            _ => None,
        };
        tracing::debug!(
            subscription = %key,
            strategy = %config.strategy,
            credit = config.credit,
            granted_qos = config.granted_qos.level(),
            "Subscription created"
        );
        Self {
            pipeline: DeliveryPipeline::new(key.to_string(), transport, config.pipeline),
            controller: create_controller(config.strategy, config.credit),
            granted_qos: config.granted_qos,
            contexts: BTreeSet::from([context]),
            pending: VecDeque::new(),
            paused: false,
            hibernating: false,
            closed: false,
            counters: Counters::default(),
            shared,
            executor,
            key,
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn controller(&self) -> &AckController {
        &self.controller
    }

    pub fn pipeline(&self) -> &DeliveryPipeline<T> {
        &self.pipeline
    }

    /// Take a message routed to this subscription and send what the window
    /// allows. Returns true if this message went out immediately.
    pub fn register(&mut self, message: Message) -> bool {
        if self.closed {
            tracing::debug!(subscription = %self.key, message_id = message.id, "Closed, ignoring message");
            return false;
        }
        self.counters.registered += 1;
        self.pending.push_back(message);
        self.schedule();
        // Pending is FIFO: the new message is at the back, so it went out
        // only if nothing is left
        self.pending.is_empty()
    }

    /// Accept a shared-group offer only when it can be sent right away.
    pub fn offer(&mut self, message: Message) -> Result<(), Message> {
        if !self.pending.is_empty() || !self.accepting() || !self.controller.can_send() {
            return Err(message);
        }
        self.register(message);
        Ok(())
    }

    fn accepting(&self) -> bool {
        !self.closed && !self.paused && !self.hibernating && !self.contexts.is_empty()
    }

    /// Whether the head of the at-rest queue may be sent now.
    pub fn is_ready(&self) -> bool {
        self.accepting() && !self.pending.is_empty() && self.controller.can_send()
    }

    /// Move messages from the at-rest queue to the pipeline while the window
    /// allows. Returns the number sent.
    pub fn schedule(&mut self) -> usize {
        let mut sent = 0;
        while self.is_ready() {
            let Some(message) = self.pending.pop_front() else {
                break;
            };
            self.send_message(message);
            sent += 1;
        }
        sent
    }

    fn send_message(&mut self, message: Message) {
        self.controller.sent(&message);
        self.counters.sent += 1;
        metrics::record_delivery(self.controller.strategy());

        let depth = self.pending.len() + self.controller.size();
        let executor = self.executor.clone();
        let event = DeliveryEvent::new(message, self.granted_qos)
            .with_depth(depth)
            .on_complete(move |outcome| {
                if let Some(executor) = executor.upgrade() {
                    let _ = executor.execute(move |sub: &mut Subscription<T>| {
                        sub.delivery_confirmed(outcome);
                    });
                }
            });
        self.pipeline.queue(event);
    }

    /// The pipeline retired an event itself. Under the `auto` strategy this
    /// retires the oldest ledger record and frees its credit.
    pub fn delivery_confirmed(&mut self, outcome: DeliveryOutcome) -> Option<i64> {
        match outcome {
            DeliveryOutcome::Dropped => self.counters.dropped += 1,
            DeliveryOutcome::Expired => self.counters.expired += 1,
            DeliveryOutcome::Written => {}
            // Teardown already cleared the ledger
            DeliveryOutcome::Cancelled => return None,
        }
        let id = self.controller.message_sent();
        if id < 0 {
            return None;
        }
        self.counters.acked += 1;
        self.credit_released(1);
        self.schedule();
        Some(id)
    }

    /// Apply a peer acknowledgement (`is_ack`) or rollback. Returns the
    /// number of ledger records removed.
    pub fn acknowledge(&mut self, message_id: i64, is_ack: bool) -> usize {
        let released = if is_ack {
            self.controller.ack(message_id)
        } else {
            self.controller.rollback(message_id)
        };
        if is_ack {
            self.counters.acked += released as u64;
        } else {
            self.counters.rolled_back += released as u64;
        }
        metrics::record_ack(is_ack, released);
        metrics::record_outstanding(&self.key.destination, self.controller.size());

        // Confirm one in-flight event per released record. Client acks are
        // cumulative, so only events up to the acked id qualify; auto acks
        // are positional.
        let through = match self.controller.strategy() {
            AckStrategy::Client => message_id,
            AckStrategy::Auto => i64::MAX,
        };
        let mut confirmed = 0;
        while confirmed < released && self.pipeline.completed_through(through) {
            confirmed += 1;
        }
        if confirmed == 0 {
            // Nothing was in flight (QoS 0 traffic); still retry refused sends
            self.pipeline.ack_received();
        }
        if released > 0 {
            self.credit_released(released);
        }
        self.schedule();
        released
    }

    fn credit_released(&self, released: usize) {
        if let Some(link) = &self.shared {
            link.bus.notify(&link.group, &self.key.session_id, released);
        }
    }

    /// Apply a new receive maximum. Returns true if the window grew.
    pub fn update_credit(&mut self, credit: u32) -> bool {
        let grew = self.controller.set_max_outstanding(credit);
        tracing::debug!(subscription = %self.key, credit, grew, "Credit updated");
        if grew {
            self.schedule();
        }
        grew
    }

    pub fn ack_received(&mut self) {
        self.pipeline.ack_received();
    }

    pub fn pause(&mut self) {
        self.paused = true;
        self.pipeline.pause();
    }

    pub fn resume(&mut self) {
        self.paused = false;
        self.pipeline.resume();
        self.schedule();
    }

    /// Drop everything in flight and keep only the at-rest queue.
    pub fn hibernate(&mut self) {
        if self.hibernating {
            return;
        }
        self.hibernating = true;
        tracing::debug!(
            subscription = %self.key,
            outstanding = self.controller.size(),
            pending = self.pending.len(),
            "Subscription hibernating"
        );
        self.controller.clear();
        self.pipeline.clear();
    }

    pub fn wake(&mut self) {
        if self.hibernating {
            self.hibernating = false;
            tracing::debug!(subscription = %self.key, "Subscription woken");
        }
        self.schedule();
    }

    pub fn drain<F>(&mut self, quota: usize, on_drained: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pipeline.empty_queue(quota, on_drained);
    }

    pub fn add_context(&mut self, context: String) {
        if self.contexts.insert(context) {
            tracing::debug!(subscription = %self.key, contexts = self.contexts.len(), "Context added");
        }
        self.schedule();
    }

    /// Detach `context`. Returns true if this closed the subscription.
    pub fn remove_context(&mut self, context: &str) -> bool {
        if !self.contexts.remove(context) {
            tracing::debug!(subscription = %self.key, context, "Unknown context");
        }
        if self.contexts.is_empty() && !self.closed {
            self.close();
            return true;
        }
        false
    }

    /// Tear down; outstanding records are dropped without acknowledgement.
    pub fn close(&mut self) {
        self.closed = true;
        self.controller.close();
        self.pipeline.clear();
        self.pending.clear();
        metrics::record_outstanding(&self.key.destination, 0);
        tracing::debug!(subscription = %self.key, "Subscription closed");
    }

    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            destination: self.key.destination.clone(),
            session_id: self.key.session_id.clone(),
            strategy: self.controller.strategy(),
            registered: self.counters.registered,
            sent: self.counters.sent,
            acked: self.counters.acked,
            rolled_back: self.counters.rolled_back,
            dropped: self.counters.dropped,
            expired: self.counters.expired,
            pending: self.pending.len(),
            outstanding: self.controller.size(),
            queued: self.pipeline.len(),
            in_flight: self.pipeline.in_flight(),
            credit: self.controller.max_outstanding(),
            contexts: self.contexts.len(),
            paused: self.paused,
            hibernating: self.hibernating,
            closed: self.closed,
        }
    }
}

/// Cloneable handle to a running subscription.
pub struct SubscriptionHandle<T> {
    key: SubscriptionKey,
    executor: SerialExecutor<Subscription<T>>,
}

impl<T> Clone for SubscriptionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            executor: self.executor.clone(),
        }
    }
}

impl<T: DeliveryTransport> SubscriptionHandle<T> {
    /// Start a subscription on its own executor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        key: SubscriptionKey,
        context: impl Into<String>,
        config: SubscriptionConfig,
        transport: T,
        credit_bus: Option<CreditBus>,
    ) -> Self {
        let context = context.into();
        let state_key = key.clone();
        let (executor, _join) = SerialExecutor::spawn_with(key.to_string(), move |weak| {
            Subscription::new(state_key, context, config, transport, credit_bus, weak)
        });
        Self { key, executor }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn submit(&self, task: SubscriptionTask) -> Result<TaskHandle<TaskOutcome>, ExecutorError> {
        self.executor.submit(move |sub: &mut Subscription<T>| task.run(sub))
    }

    /// Run an arbitrary closure on the subscription's executor.
    pub fn with<R, F>(&self, f: F) -> Result<TaskHandle<R>, ExecutorError>
    where
        F: FnOnce(&mut Subscription<T>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.executor.submit(f)
    }

    /// Route a message without waiting for the outcome.
    pub fn deliver(&self, message: Message) -> Result<(), ExecutorError> {
        self.executor.execute(move |sub: &mut Subscription<T>| {
            sub.register(message);
        })
    }

    pub async fn ack(&self, message_id: i64) -> Result<usize, ExecutorError> {
        self.executor
            .submit(move |sub: &mut Subscription<T>| sub.acknowledge(message_id, true))?
            .await
    }

    pub async fn rollback(&self, message_id: i64) -> Result<usize, ExecutorError> {
        self.executor
            .submit(move |sub: &mut Subscription<T>| sub.acknowledge(message_id, false))?
            .await
    }

    pub async fn update_credit(&self, credit: u32) -> Result<bool, ExecutorError> {
        self.executor
            .submit(move |sub: &mut Subscription<T>| sub.update_credit(credit))?
            .await
    }

    pub async fn stats(&self) -> Result<SubscriptionStats, ExecutorError> {
        self.executor
            .submit(|sub: &mut Subscription<T>| sub.stats())?
            .await
    }

    pub fn executor_stats(&self) -> ExecutorSnapshot {
        let snapshot = self.executor.stats();
        metrics::record_executor_backlog(self.executor.name(), snapshot.outstanding);
        snapshot
    }
}
