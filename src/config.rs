//! Configuration parsing for the ackflow soak driver.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides
//! - Defaults matching a typical MQTT 5 session (receive maximum 32)

use clap::Parser;
use std::time::Duration;

use crate::ack::AckStrategy;
use crate::message::QualityOfService;
use crate::pipeline::PipelineConfig;
use crate::subscription::SubscriptionConfig;

/// Ackflow: drive subscriptions through the acknowledgement and credit engine.
#[derive(Parser, Debug, Clone)]
#[command(name = "ackflow")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Acknowledgement strategy (auto, client)
    #[arg(long, env = "ACKFLOW_STRATEGY", default_value = "client")]
    pub strategy: AckStrategy,

    /// Initial credit per subscription (receive maximum / prefetch)
    #[arg(long, env = "ACKFLOW_CREDIT", default_value_t = 32)]
    pub credit: u32,

    /// Maximum pipeline events sent and awaiting confirmation
    #[arg(long, env = "ACKFLOW_MAX_IN_FLIGHT_EVENTS", default_value_t = 8)]
    pub max_in_flight_events: usize,

    /// Age in milliseconds after which a queued event is discarded (0 = never)
    #[arg(long, env = "ACKFLOW_EVENT_TIMEOUT_MS", default_value_t = 30_000)]
    pub event_timeout_ms: u64,

    /// Drop QoS 0 events while a backed-up pipeline is paused
    #[arg(long, env = "ACKFLOW_DROP_QOS0")]
    pub drop_qos0: bool,

    /// QoS of published messages, also granted to subscriptions (0, 1, 2)
    #[arg(long, env = "ACKFLOW_QOS", default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    pub qos: u8,

    /// Number of subscriptions to drive
    #[arg(long, env = "ACKFLOW_SUBSCRIPTIONS", default_value_t = 4)]
    pub subscriptions: usize,

    /// Messages published per subscription (or in total when shared)
    #[arg(long, env = "ACKFLOW_MESSAGES", default_value_t = 1000)]
    pub messages: usize,

    /// Put all subscriptions in one shared group on a single destination
    #[arg(long, env = "ACKFLOW_SHARED")]
    pub shared: bool,

    /// Give up waiting for the run to settle after this many seconds
    #[arg(long, env = "ACKFLOW_TIMEOUT_SECS", default_value_t = 60)]
    pub timeout_secs: u64,

    /// Output format (text, json)
    #[arg(short, long, env = "ACKFLOW_OUTPUT", default_value = "text")]
    pub output: OutputFormat,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// OpenTelemetry collector endpoint for metrics export (optional)
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown output format: {}", s)),
        }
    }
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn qos(&self) -> QualityOfService {
        QualityOfService::from_level(self.qos)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_in_flight_events: self.max_in_flight_events,
            event_timeout: Duration::from_millis(self.event_timeout_ms),
            drop_qos0: self.drop_qos0,
        }
    }

    /// Settings for every subscription the driver creates.
    pub fn subscription_config(&self, shared_group: Option<String>) -> SubscriptionConfig {
        SubscriptionConfig {
            strategy: self.strategy,
            credit: self.credit,
            granted_qos: self.qos(),
            pipeline: self.pipeline_config(),
            shared_group,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Create a small configuration for testing.
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            subscriptions: 2,
            messages: 50,
            credit: 4,
            max_in_flight_events: 2,
            timeout_secs: 10,
            log_level: "debug".into(),
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strategy: AckStrategy::Client,
            credit: 32,
            max_in_flight_events: 8,
            event_timeout_ms: 30_000,
            drop_qos0: false,
            qos: 1,
            subscriptions: 4,
            messages: 1000,
            shared: false,
            timeout_secs: 60,
            output: OutputFormat::Text,
            log_level: "info".into(),
            otel_endpoint: None,
        }
    }
}
