//! Soak driver: publish through real subscriptions and simulated peers.
//!
//! Each subscription gets a [`ChannelTransport`] and a peer task that drains
//! it and acknowledges what the protocol requires. The run ends when every
//! subscription has settled, on shutdown, or at the deadline.

use futures::future::try_join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::ack::AckStrategy;
use crate::config::Config;
use crate::executor::ExecutorSnapshot;
use crate::generate_session_id;
use crate::message::{Message, QualityOfService};
use crate::pipeline::{ChannelTransport, OutboundDelivery};
use crate::subscription::{
    GroupStats, SharedGroup, SubscriptionHandle, SubscriptionKey, SubscriptionRegistry,
    SubscriptionStats, SubscriptionTask,
};

const CONTEXT: &str = "soak";
const SHARED_GROUP: &str = "soak-workers";
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Per-subscription result.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionReport {
    pub subscription: String,
    pub received: u64,
    pub stats: SubscriptionStats,
    pub executor: ExecutorSnapshot,
}

/// Result of a soak run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub strategy: AckStrategy,
    pub qos: QualityOfService,
    pub credit: u32,
    pub shared: bool,
    pub published: u64,
    pub received: u64,
    pub acked: u64,
    pub dropped: u64,
    pub expired: u64,
    /// Every subscription settled before the deadline or shutdown
    pub completed: bool,
    pub elapsed_ms: u64,
    pub messages_per_sec: f64,
    pub group: Option<GroupStats>,
    pub subscriptions: Vec<SubscriptionReport>,
}

impl Report {
    /// Render a human-readable summary.
    pub fn to_text(&self) -> String {
        let mut out = format!(
            "strategy={} qos={} credit={} shared={}\n\
             published={} received={} acked={} dropped={} expired={}\n\
             completed={} elapsed={}ms rate={:.0} msg/s\n",
            self.strategy,
            self.qos.level(),
            self.credit,
            self.shared,
            self.published,
            self.received,
            self.acked,
            self.dropped,
            self.expired,
            self.completed,
            self.elapsed_ms,
            self.messages_per_sec,
        );
        if let Some(group) = &self.group {
            out.push_str(&format!(
                "group {}: members={} dispatched={} refused={} backlog={}\n",
                group.name, group.members, group.dispatched, group.refused, group.backlog
            ));
        }
        for sub in &self.subscriptions {
            out.push_str(&format!(
                "  {:<48} received={:<6} outstanding={:<4} pending={:<4} tasks={} (max backlog {})\n",
                sub.subscription,
                sub.received,
                sub.stats.outstanding,
                sub.stats.pending,
                sub.executor.completed,
                sub.executor.max_outstanding,
            ));
        }
        out
    }
}

struct Peer {
    handle: SubscriptionHandle<ChannelTransport>,
    received: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

/// Run a soak with the settings in `config`.
pub async fn run(config: &Config, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<Report> {
    anyhow::ensure!(config.subscriptions > 0, "at least one subscription is required");

    let registry = SubscriptionRegistry::<ChannelTransport>::new();
    let started = Instant::now();
    let qos = config.qos();

    let group = if config.shared {
        let (group, _join) = SharedGroup::spawn(SHARED_GROUP, registry.credit_bus());
        Some(group)
    } else {
        None
    };

    let mut peers = Vec::with_capacity(config.subscriptions);
    for index in 0..config.subscriptions {
        let destination = if config.shared {
            "soak/shared".to_string()
        } else {
            format!("soak/{index}")
        };
        let key = SubscriptionKey::new(destination, generate_session_id());
        let (transport, rx) = ChannelTransport::channel(config.max_in_flight_events.max(1) * 2);
        let handle = registry.subscribe(
            key,
            CONTEXT,
            config.subscription_config(group.as_ref().map(|g| g.name().to_string())),
            transport,
        );
        if let Some(group) = &group {
            group.join(handle.clone())?;
        }

        let received = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(simulate_peer(
            rx,
            handle.clone(),
            config.strategy,
            received.clone(),
        ));
        peers.push(Peer {
            handle,
            received,
            task,
        });
    }
    tracing::info!(
        subscriptions = peers.len(),
        messages = config.messages,
        shared = config.shared,
        "Soak started"
    );

    let mut published = 0u64;
    let mut next_id = 1i64;
    if let Some(group) = &group {
        for _ in 0..config.messages {
            group.publish(Message::new(next_id, "soak/shared").with_qos(qos))?;
            next_id += 1;
            published += 1;
        }
    } else {
        for peer in &peers {
            for _ in 0..config.messages {
                let message = Message::new(next_id, peer.handle.key().destination.clone()).with_qos(qos);
                peer.handle.deliver(message)?;
                next_id += 1;
                published += 1;
            }
        }
    }

    let deadline = tokio::time::Instant::now() + config.timeout();
    let completed = loop {
        if settled(&peers, group.as_ref(), published).await? {
            break true;
        }
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = shutdown.changed() => {
                tracing::info!("Shutdown requested, stopping soak");
                break false;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(timeout_secs = config.timeout_secs, "Soak did not settle before the deadline");
            break false;
        }
    };
    let elapsed = started.elapsed();

    let mut subscriptions = Vec::with_capacity(peers.len());
    for peer in &peers {
        subscriptions.push(SubscriptionReport {
            subscription: peer.handle.key().to_string(),
            received: peer.received.load(Ordering::Relaxed),
            stats: peer.handle.stats().await?,
            executor: peer.handle.executor_stats(),
        });
    }
    let group_stats = match &group {
        Some(group) => Some(group.stats().await?),
        None => None,
    };

    for peer in &peers {
        registry.unsubscribe(peer.handle.key(), CONTEXT)?;
    }
    registry.wait_for_unsubscribes().await;
    for peer in peers {
        peer.task.abort();
    }

    let received: u64 = subscriptions.iter().map(|s| s.received).sum();
    let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    let report = Report {
        strategy: config.strategy,
        qos,
        credit: config.credit,
        shared: config.shared,
        published,
        received,
        acked: subscriptions.iter().map(|s| s.stats.acked).sum(),
        dropped: subscriptions.iter().map(|s| s.stats.dropped).sum(),
        expired: subscriptions.iter().map(|s| s.stats.expired).sum(),
        completed,
        elapsed_ms,
        messages_per_sec: received as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        group: group_stats,
        subscriptions,
    };
    tracing::info!(
        received = report.received,
        completed = report.completed,
        elapsed_ms = report.elapsed_ms,
        "Soak finished"
    );
    Ok(report)
}

async fn settled(
    peers: &[Peer],
    group: Option<&SharedGroup<ChannelTransport>>,
    published: u64,
) -> anyhow::Result<bool> {
    if let Some(group) = group {
        if group.stats().await?.backlog > 0 {
            return Ok(false);
        }
    }
    let stats = try_join_all(peers.iter().map(|peer| peer.handle.stats())).await?;
    let registered: u64 = stats.iter().map(|s| s.registered).sum();
    Ok(stats.iter().all(SubscriptionStats::is_settled) && registered == published)
}

/// Drain deliveries like a connected client: every message counts as
/// received; acknowledgements are sent whenever the strategy expects them.
async fn simulate_peer(
    mut rx: mpsc::Receiver<OutboundDelivery>,
    handle: SubscriptionHandle<ChannelTransport>,
    strategy: AckStrategy,
    received: Arc<AtomicU64>,
) {
    while let Some(delivery) = rx.recv().await {
        received.fetch_add(1, Ordering::Relaxed);
        if strategy == AckStrategy::Client || delivery.qos.requires_ack() {
            if let Err(e) = handle.ack(delivery.message.id).await {
                tracing::debug!(error = %e, "Peer stopped acknowledging");
                break;
            }
        } else if handle.submit(SubscriptionTask::AckReceived).is_err() {
            // Writer drained a slot; lets the pipeline retry a refused send
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn soak(config: Config) -> Report {
        let (_tx, rx) = watch::channel(false);
        run(&config, rx).await.unwrap()
    }

    #[tokio::test]
    async fn test_client_soak_completes() {
        let report = soak(Config::test_config()).await;
        assert!(report.completed);
        assert_eq!(report.published, 100);
        assert_eq!(report.received, 100);
        assert_eq!(report.acked, 100);
        assert_eq!(report.subscriptions.len(), 2);
    }

    #[tokio::test]
    async fn test_auto_qos0_soak_completes() {
        let report = soak(Config {
            strategy: AckStrategy::Auto,
            qos: 0,
            ..Config::test_config()
        })
        .await;
        assert!(report.completed);
        assert_eq!(report.received, 100);
        assert_eq!(report.acked, 100);
    }

    #[tokio::test]
    async fn test_shared_soak_completes() {
        let report = soak(Config {
            shared: true,
            subscriptions: 3,
            messages: 60,
            ..Config::test_config()
        })
        .await;
        assert!(report.completed);
        assert_eq!(report.received, 60);
        let group = report.group.unwrap();
        assert_eq!(group.dispatched, 60);
        assert_eq!(group.backlog, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let config = Config {
            credit: 0,
            ..Config::test_config()
        };
        // Zero credit never settles; only the shutdown signal ends the run
        let report = run(&config, rx).await.unwrap();
        assert!(!report.completed);
        assert_eq!(report.received, 0);
    }

    #[test]
    fn test_report_text() {
        let report = Report {
            strategy: AckStrategy::Client,
            qos: QualityOfService::AtLeastOnce,
            credit: 4,
            shared: false,
            published: 10,
            received: 10,
            acked: 10,
            dropped: 0,
            expired: 0,
            completed: true,
            elapsed_ms: 5,
            messages_per_sec: 2000.0,
            group: None,
            subscriptions: Vec::new(),
        };
        let text = report.to_text();
        assert!(text.contains("strategy=client"));
        assert!(text.contains("completed=true"));
    }
}
