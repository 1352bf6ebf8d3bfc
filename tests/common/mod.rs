//! Test utilities for ackflow integration tests.
//!
//! Provides:
//! - Message builders
//! - A registry fixture wired to channel transports
//! - Polling helpers

#![allow(dead_code)]

use ackflow::message::{Message, QualityOfService};
use ackflow::pipeline::{ChannelTransport, OutboundDelivery, PipelineConfig};
use ackflow::subscription::{
    SubscriptionConfig, SubscriptionHandle, SubscriptionKey, SubscriptionRegistry,
    SubscriptionStats,
};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

pub const CONTEXT: &str = "test-context";

/// QoS 1 message on `destination`.
pub fn qos1(id: i64, destination: &str) -> Message {
    Message::new(id, destination).with_qos(QualityOfService::AtLeastOnce)
}

/// Client-acknowledged subscription settings with a roomy pipeline.
pub fn client_config(credit: u32) -> SubscriptionConfig {
    SubscriptionConfig {
        credit,
        pipeline: PipelineConfig {
            max_in_flight_events: 64,
            ..PipelineConfig::default()
        },
        ..SubscriptionConfig::default()
    }
}

/// Registry whose subscriptions write to channels the test reads.
pub struct Fixture {
    pub registry: SubscriptionRegistry<ChannelTransport>,
}

impl Fixture {
    pub fn new() -> Self {
        ackflow::observability::tracing::init_test_tracing();
        Self {
            registry: SubscriptionRegistry::new(),
        }
    }

    pub fn subscribe(
        &self,
        destination: &str,
        session: &str,
        config: SubscriptionConfig,
    ) -> (
        SubscriptionHandle<ChannelTransport>,
        mpsc::Receiver<OutboundDelivery>,
    ) {
        let (transport, rx) = ChannelTransport::channel(256);
        let handle = self.registry.subscribe(
            SubscriptionKey::new(destination, session),
            CONTEXT,
            config,
            transport,
        );
        (handle, rx)
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive the next delivered id, failing the test after one second.
pub async fn next_id(rx: &mut mpsc::Receiver<OutboundDelivery>) -> i64 {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("transport closed")
        .message
        .id
}

/// Ids currently buffered in the transport, without waiting.
pub fn drain_ids(rx: &mut mpsc::Receiver<OutboundDelivery>) -> Vec<i64> {
    let mut ids = Vec::new();
    while let Ok(delivery) = rx.try_recv() {
        ids.push(delivery.message.id);
    }
    ids
}

/// Poll subscription stats until `condition` holds.
///
/// Returns the last stats seen; callers assert on them.
pub async fn wait_for_stats<F>(
    handle: &SubscriptionHandle<ChannelTransport>,
    timeout: Duration,
    condition: F,
) -> SubscriptionStats
where
    F: Fn(&SubscriptionStats) -> bool,
{
    let start = std::time::Instant::now();
    loop {
        let stats = handle.stats().await.expect("subscription stopped");
        if condition(&stats) || start.elapsed() >= timeout {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for an async condition to become true with timeout.
///
/// # Returns
///
/// `true` if condition was met, `false` if timeout expired
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
