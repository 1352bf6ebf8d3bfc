//! OpenTelemetry metrics.
//!
//! Key metrics:
//! - ackflow_deliveries_total: Counter of messages handed to a pipeline
//! - ackflow_acks_total: Counter of ledger records released, by kind
//! - ackflow_pipeline_discarded_total: Counter of events retired unsent
//! - ackflow_outstanding: Gauge of ledger size per subscription
//! - ackflow_executor_backlog: Gauge of tasks waiting on an executor

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use std::sync::OnceLock;

use crate::ack::AckStrategy;
use crate::pipeline::DeliveryOutcome;

/// Global metrics instance.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Ackflow metrics registry.
#[derive(Debug)]
pub struct Metrics {
    /// Messages handed to a delivery pipeline.
    pub deliveries_total: Counter<u64>,
    /// Ledger records released by acknowledgement or rollback.
    pub acks_total: Counter<u64>,
    /// Events retired without reaching the peer.
    pub pipeline_discarded_total: Counter<u64>,
    /// Outstanding (delivered, unacknowledged) messages per subscription.
    pub outstanding: Gauge<i64>,
    /// Tasks queued and not yet run per executor.
    pub executor_backlog: Gauge<i64>,
}

impl Metrics {
    fn new(meter: &Meter) -> Self {
        Self {
            deliveries_total: meter
                .u64_counter("ackflow_deliveries_total")
                .with_description("Messages handed to a delivery pipeline")
                .with_unit("1")
                .init(),
            acks_total: meter
                .u64_counter("ackflow_acks_total")
                .with_description("Outstanding records released, by ack or rollback")
                .with_unit("1")
                .init(),
            pipeline_discarded_total: meter
                .u64_counter("ackflow_pipeline_discarded_total")
                .with_description("Pipeline events dropped or expired before sending")
                .with_unit("1")
                .init(),
            outstanding: meter
                .i64_gauge("ackflow_outstanding")
                .with_description("Delivered messages awaiting acknowledgement")
                .with_unit("1")
                .init(),
            executor_backlog: meter
                .i64_gauge("ackflow_executor_backlog")
                .with_description("Tasks queued on a serial executor")
                .with_unit("1")
                .init(),
        }
    }
}

/// Initialize the metrics system.
///
/// This should be called once at startup. Subsequent calls are ignored.
///
/// # Arguments
///
/// * `otel_endpoint` - Optional OTLP endpoint for metrics export
pub fn init_metrics_with_endpoint(otel_endpoint: Option<&str>) {
    METRICS.get_or_init(|| {
        if let Some(endpoint) = otel_endpoint {
            use opentelemetry_otlp::{Protocol, WithExportConfig};

            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::Grpc);

            match opentelemetry_otlp::new_pipeline()
                .metrics(opentelemetry_sdk::runtime::Tokio)
                .with_exporter(exporter)
                .with_period(std::time::Duration::from_secs(10))
                .build()
            {
                Ok(provider) => {
                    global::set_meter_provider(provider);
                    tracing::info!(endpoint, "OTLP metrics exporter configured");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create OTLP exporter, metrics stay local");
                    install_local_provider();
                }
            }
        } else {
            install_local_provider();
        }

        let meter = global::meter("ackflow");
        Metrics::new(&meter)
    });
}

// Metrics are recorded but never exported.
fn install_local_provider() {
    let reader = ManualReader::builder().build();
    let provider = SdkMeterProvider::builder().with_reader(reader).build();
    global::set_meter_provider(provider);
}

/// Initialize the metrics system without OTLP export.
pub fn init_metrics() {
    init_metrics_with_endpoint(None);
}

/// Get the global metrics instance, if initialized.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Record a message handed to a pipeline.
pub fn record_delivery(strategy: AckStrategy) {
    if let Some(m) = METRICS.get() {
        m.deliveries_total
            .add(1, &[KeyValue::new("strategy", strategy.as_str())]);
    }
}

/// Record records released by an acknowledgement (`is_ack`) or rollback.
pub fn record_ack(is_ack: bool, released: usize) {
    if released == 0 {
        return;
    }
    if let Some(m) = METRICS.get() {
        let kind = if is_ack { "ack" } else { "rollback" };
        m.acks_total
            .add(released as u64, &[KeyValue::new("kind", kind)]);
    }
}

/// Record an event the pipeline retired without sending.
pub fn record_discard(outcome: DeliveryOutcome) {
    if let Some(m) = METRICS.get() {
        m.pipeline_discarded_total
            .add(1, &[KeyValue::new("reason", outcome.as_str())]);
    }
}

/// Record the ledger size of a subscription.
pub fn record_outstanding(destination: &str, outstanding: usize) {
    if let Some(m) = METRICS.get() {
        m.outstanding.record(
            i64::try_from(outstanding).unwrap_or(i64::MAX),
            &[KeyValue::new("destination", destination.to_string())],
        );
    }
}

/// Record the number of tasks waiting on an executor.
pub fn record_executor_backlog(executor: &str, backlog: u64) {
    if let Some(m) = METRICS.get() {
        m.executor_backlog.record(
            i64::try_from(backlog).unwrap_or(i64::MAX),
            &[KeyValue::new("executor", executor.to_string())],
        );
    }
}
