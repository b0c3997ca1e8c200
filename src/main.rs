use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tracing::Level;

use siftstream_consumer::{http_consumer, load_config};
use siftstream_core::ConsumerEvent;
use siftstream_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Json,
    Pretty,
}

#[derive(Debug, Parser)]
#[command(name = "siftstream", about = "Consume a multiplexed stream of filtered records")]
struct Args {
    /// JSON config file merged over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stream hash to subscribe to. May be repeated.
    #[arg(long = "hash", required = true)]
    hashes: Vec<String>,

    #[arg(long, value_enum, default_value = "pretty")]
    log_format: Format,

    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: args.log_level,
        module_levels: Vec::new(),
        format: match args.log_format {
            Format::Json => LogFormat::Json,
            Format::Pretty => LogFormat::Pretty,
        },
    });

    tracing::debug!(filter = telemetry.filter(), "telemetry initialized");

    let config = load_config(args.config.as_deref()).context("failed to load config")?;
    tracing::info!(base_url = %config.base_url, hashes = args.hashes.len(), "starting consumer");

    let consumer = http_consumer(&config).context("failed to build transport")?;
    let mut events = consumer.events();

    consumer.start().await.context("failed to connect")?;
    for pending in consumer.reconcile(args.hashes.as_slice()) {
        tokio::spawn(async move {
            match pending.await {
                Ok(subscription) => {
                    tracing::info!(hash = %subscription.hash, state = ?subscription.state, "subscription settled");
                }
                Err(e) => tracing::warn!(error = %e, "subscription failed"),
            }
        });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ConsumerEvent::Interaction { record }) => println!("{record}"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event receiver lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    tracing::info!("shutting down");
    consumer.shutdown().await.context("shutdown failed")?;
    Ok(())
}
