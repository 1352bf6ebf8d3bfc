//! Ackflow: soak-test the acknowledgement and credit engine.
//!
//! # Usage
//!
//! ```bash
//! ackflow --strategy client --credit 32 --subscriptions 4 --messages 1000
//! ```
//!
//! Environment variables can also be used:
//! - `ACKFLOW_STRATEGY`: Acknowledgement strategy (auto, client)
//! - `ACKFLOW_CREDIT`: Initial credit per subscription
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)

use ackflow::config::{Config, OutputFormat};
use ackflow::observability::metrics::init_metrics_with_endpoint;
use ackflow::observability::tracing::init_tracing;
use ackflow::soak;
use tokio::sync::watch;

/// Print startup banner with version and configuration.
fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        r#"
     _        _     __ _
    / \   ___| | __/ _| | _____      __
   / _ \ / __| |/ / |_| |/ _ \ \ /\ / /
  / ___ \ (__|   <|  _| | (_) \ V  V /
 /_/   \_\___|_|\_\_| |_|\___/ \_/\_/

  Ackflow v{} - acknowledgement and credit soak

  Configuration:
    Strategy:       {}
    Credit:         {}
    QoS:            {}
    Subscriptions:  {}{}
    Messages:       {}
    Log Level:      {}

  Press Ctrl+C to stop early.
"#,
        version,
        config.strategy,
        config.credit,
        config.qos,
        config.subscriptions,
        if config.shared { " (shared)" } else { "" },
        config.messages,
        config.log_level
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration from CLI arguments and environment
    let config = Config::parse_args();

    init_tracing(&config.log_level, config.output == OutputFormat::Json);
    init_metrics_with_endpoint(config.otel_endpoint.as_deref());

    if config.output == OutputFormat::Text {
        print_banner(&config);
    }

    // Create shutdown signal channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };

            tokio::select! {
                _ = ctrl_c => {
                    tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating shutdown...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if ctrl_c.await.is_ok() {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
        }

        let _ = shutdown_tx.send(true);
    });

    let report = soak::run(&config, shutdown_rx).await?;

    match config.output {
        OutputFormat::Text => print!("{}", report.to_text()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    if !report.completed {
        anyhow::bail!("soak did not settle: {} of {} messages received", report.received, report.published);
    }
    Ok(())
}
