//! Observability infrastructure.
//!
//! Provides:
//! - Structured tracing via `tracing-subscriber`
//! - OpenTelemetry metrics for deliveries, acknowledgements and discards

pub mod metrics;
pub mod tracing;
