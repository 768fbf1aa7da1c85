//! snowdrift: streams JSON messages from a Pub/Sub subscription into a
//! Snowflake table with at-least-once delivery.

use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use snowdrift::config::Config;
use snowdrift::error::{AddressParseSnafu, ConfigSnafu, MetricsSnafu, PipelineError};
use snowdrift::metrics;
use snowdrift::pipeline::{cancel_on_signal, run_pipeline};

/// Pub/Sub to Snowflake streaming loader.
#[derive(Parser, Debug)]
#[command(name = "snowdrift")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Dry run - validate configuration without processing.
    #[arg(long)]
    dry_run: bool,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("snowdrift starting");

    let config = Config::from_file(&args.config).context(ConfigSnafu)?;

    if args.dry_run {
        info!("Dry run mode - validating configuration");
        info!("Subscription: {}", config.source.subscription);
        info!("Table: {}", config.sink.qualified_table());
        info!("Staging: {}", config.sink.staging_url());
        match config.sink.qualified_pipe() {
            Some(pipe) if config.sink.continuous => info!("Loading continuously through {}", pipe),
            _ => info!("Loading with COPY INTO via {}", config.sink.storage_integration),
        }
        info!(
            "Flush after {} rows or {:?}",
            config.batching.max_rows,
            config.max_latency()
        );
        info!("Configuration is valid");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr, shutdown.clone()).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    let result = run_pipeline(config, shutdown.clone()).await;
    shutdown.cancel();
    let stats = result?;

    info!("Pipeline stopped cleanly");
    info!("  Messages received: {}", stats.messages_received);
    info!("  Messages rejected: {}", stats.messages_rejected);
    info!("  Batches committed: {}", stats.batches_committed);
    info!("  Rows loaded: {}", stats.rows_loaded);
    info!("  Messages acked: {}", stats.messages_acked);

    Ok(())
}
