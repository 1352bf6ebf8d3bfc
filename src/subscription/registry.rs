//! Registry of live subscriptions.
//!
//! Maps each (destination, session) pair to the executor owning its
//! subscription. Protocol adapters look subscriptions up here and submit
//! tasks; they never touch subscription state directly.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::task::{SubscriptionTask, TaskOutcome};
use super::tracker::UnsubscribeTracker;
use super::{Subscription, SubscriptionConfig, SubscriptionHandle, SubscriptionKey};
use crate::executor::{ExecutorError, TaskHandle};
use crate::flow::CreditBus;
use crate::pipeline::DeliveryTransport;

/// Error type for registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no subscription for {0}")]
    UnknownSubscription(SubscriptionKey),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// A live subscription and the contexts the registry has attached to it.
struct Entry<T> {
    handle: SubscriptionHandle<T>,
    contexts: HashSet<String>,
}

/// Registry tracking active subscriptions.
///
/// Context bookkeeping happens under the registry lock, so a key leaves the
/// map the moment its last context is detached. A subscribe racing with
/// that unsubscribe gets a fresh subscription rather than the closing one.
pub struct SubscriptionRegistry<T> {
    active: Mutex<HashMap<SubscriptionKey, Entry<T>>>,
    unsubscribes: Arc<UnsubscribeTracker>,
    credit_bus: CreditBus,
}

impl<T: DeliveryTransport> Default for SubscriptionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeliveryTransport> SubscriptionRegistry<T> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::with_credit_bus(CreditBus::default())
    }

    /// Create a registry whose shared-group members announce on `credit_bus`.
    pub fn with_credit_bus(credit_bus: CreditBus) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            unsubscribes: Arc::new(UnsubscribeTracker::new()),
            credit_bus,
        }
    }

    /// Attach `context` to the subscription for `key`, creating it (and its
    /// executor) if this is the first context.
    ///
    /// An existing subscription keeps its original config and transport;
    /// `config` and `transport` are only used on creation.
    pub fn subscribe(
        &self,
        key: SubscriptionKey,
        context: impl Into<String>,
        config: SubscriptionConfig,
        transport: T,
    ) -> SubscriptionHandle<T> {
        let context = context.into();
        let mut active = self.active.lock().unwrap();

        if let Some(entry) = active.get_mut(&key) {
            if entry
                .handle
                .submit(SubscriptionTask::AddContext(context.clone()))
                .is_ok()
            {
                entry.contexts.insert(context);
                return entry.handle.clone();
            }
            tracing::debug!(subscription = %key, "Replacing stopped subscription");
        }

        let credit_bus = config
            .shared_group
            .as_ref()
            .map(|_| self.credit_bus.clone());
        let handle =
            SubscriptionHandle::spawn(key.clone(), context.clone(), config, transport, credit_bus);
        tracing::info!(subscription = %key, "Subscription registered");
        active.insert(
            key,
            Entry {
                handle: handle.clone(),
                contexts: HashSet::from([context]),
            },
        );
        handle
    }

    pub fn get(&self, key: &SubscriptionKey) -> Option<SubscriptionHandle<T>> {
        self.active
            .lock()
            .unwrap()
            .get(key)
            .map(|entry| entry.handle.clone())
    }

    /// Queue `task` on the subscription for `key`.
    pub fn submit(
        &self,
        key: &SubscriptionKey,
        task: SubscriptionTask,
    ) -> Result<TaskHandle<TaskOutcome>, RegistryError> {
        let handle = self
            .get(key)
            .ok_or_else(|| RegistryError::UnknownSubscription(key.clone()))?;
        Ok(handle.submit(task)?)
    }

    /// Detach `context`. The subscription closes and leaves the registry when
    /// its last context goes.
    pub fn unsubscribe(
        &self,
        key: &SubscriptionKey,
        context: impl Into<String>,
    ) -> Result<TaskHandle<TaskOutcome>, RegistryError> {
        let context = context.into();
        // Held until the task is queued so executor order matches registry order
        let mut active = self.active.lock().unwrap();
        let entry = active
            .get_mut(key)
            .ok_or_else(|| RegistryError::UnknownSubscription(key.clone()))?;
        let handle = entry.handle.clone();
        entry.contexts.remove(&context);
        if entry.contexts.is_empty() {
            active.remove(key);
            tracing::info!(subscription = %key, "Subscription removed");
        }

        let tracker = self.unsubscribes.clone();
        tracker.begin();
        let submitted = handle.with(move |sub: &mut Subscription<T>| {
            let outcome = SubscriptionTask::Unsubscribe { context }.run(sub);
            tracker.finish();
            outcome
        });
        drop(active);
        if submitted.is_err() {
            self.unsubscribes.finish();
        }
        Ok(submitted?)
    }

    /// Unsubscribe tasks submitted and not yet run.
    pub fn unsubscribes_pending(&self) -> usize {
        self.unsubscribes.pending()
    }

    /// Resolve once every submitted unsubscribe task has run.
    pub async fn wait_for_unsubscribes(&self) {
        self.unsubscribes.wait_idle().await;
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = self.active.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn credit_bus(&self) -> &CreditBus {
        &self.credit_bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, QualityOfService};
    use crate::pipeline::ChannelTransport;

    fn key(session: &str) -> SubscriptionKey {
        SubscriptionKey::new("orders", session)
    }

    fn transport() -> ChannelTransport {
        ChannelTransport::channel(64).0
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe() {
        let registry = SubscriptionRegistry::new();
        let _handle = registry.subscribe(key("s1"), "ctx", SubscriptionConfig::default(), transport());
        assert_eq!(registry.len(), 1);

        let outcome = registry.unsubscribe(&key("s1"), "ctx").unwrap().await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Unsubscribed { closed: true }));
        assert!(registry.is_empty());
        assert_eq!(registry.unsubscribes_pending(), 0);
    }

    #[tokio::test]
    async fn test_second_context_shares_subscription() {
        let registry = SubscriptionRegistry::new();
        let first = registry.subscribe(key("s1"), "a", SubscriptionConfig::default(), transport());
        let _second = registry.subscribe(key("s1"), "b", SubscriptionConfig::default(), transport());
        assert_eq!(registry.len(), 1);
        assert_eq!(first.stats().await.unwrap().contexts, 2);

        let outcome = registry.unsubscribe(&key("s1"), "a").unwrap().await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Unsubscribed { closed: false }));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_subscription() {
        let registry = SubscriptionRegistry::<ChannelTransport>::new();
        let err = registry
            .submit(&key("missing"), SubscriptionTask::Stats)
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownSubscription(_)));
        assert!(registry.unsubscribe(&key("missing"), "ctx").is_err());
    }

    #[tokio::test]
    async fn test_submit_routes_to_subscription() {
        let registry = SubscriptionRegistry::new();
        let (transport, mut rx) = ChannelTransport::channel(8);
        registry.subscribe(key("s1"), "ctx", SubscriptionConfig::default(), transport);

        let message = Message::new(7, "orders").with_qos(QualityOfService::AtLeastOnce);
        let outcome = registry
            .submit(&key("s1"), SubscriptionTask::Deliver(message))
            .unwrap()
            .await
            .unwrap();
        assert!(matches!(outcome, TaskOutcome::Delivered(true)));
        assert_eq!(rx.recv().await.unwrap().message.id, 7);
    }

    #[tokio::test]
    async fn test_resubscribe_while_unsubscribe_queued() {
        let registry = SubscriptionRegistry::new();
        let (old_transport, mut old_rx) = ChannelTransport::channel(8);
        let old = registry.subscribe(key("s1"), "ctx", SubscriptionConfig::default(), old_transport);

        // Last context leaves, then a new one arrives before the task runs
        let pending = registry.unsubscribe(&key("s1"), "ctx").unwrap();
        let (new_transport, mut new_rx) = ChannelTransport::channel(8);
        let fresh = registry.subscribe(key("s1"), "ctx2", SubscriptionConfig::default(), new_transport);

        let message = Message::new(3, "orders").with_qos(QualityOfService::AtLeastOnce);
        fresh.deliver(message).unwrap();

        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Unsubscribed { closed: true }));
        assert!(old.stats().await.unwrap().closed);

        let stats = fresh.stats().await.unwrap();
        assert!(!stats.closed);
        assert_eq!(stats.contexts, 1);
        assert_eq!(new_rx.recv().await.unwrap().message.id, 3);
        assert!(old_rx.try_recv().is_err());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.keys(), vec![key("s1")]);
    }

    #[tokio::test]
    async fn test_wait_for_unsubscribes() {
        let registry = SubscriptionRegistry::new();
        for session in ["s1", "s2", "s3"] {
            registry.subscribe(key(session), "ctx", SubscriptionConfig::default(), transport());
        }
        for session in ["s1", "s2", "s3"] {
            // Handles dropped; the tracker alone signals completion
            drop(registry.unsubscribe(&key(session), "ctx").unwrap());
        }
        registry.wait_for_unsubscribes().await;
        assert_eq!(registry.unsubscribes_pending(), 0);
        assert!(registry.is_empty());
    }
}
