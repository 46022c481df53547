//! Signal pipeline binary

use clap::Parser;
use signal_pipeline::{PipelineConfig, Result, SignalPipeline};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(version, about = "Capture, store and upload telemetry signals")]
struct Args {
    /// Upload endpoint base URL
    #[arg(long, env = "SIGNAL_ENDPOINT_URL")]
    endpoint: Option<String>,

    /// Application identifier
    #[arg(long, env = "SIGNAL_APP_ID")]
    app_id: Option<String>,

    /// SQLite database file for the record store
    #[arg(long, env = "SIGNAL_STORE_PATH")]
    store_path: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    initialize_tracing(&args.log_level);

    info!("Starting signal pipeline v{}", env!("CARGO_PKG_VERSION"));

    let mut config = PipelineConfig::from_env();
    if let Some(endpoint) = args.endpoint {
        config.endpoint_url = endpoint;
    }
    if let Some(app_id) = args.app_id {
        config.app_id = app_id;
    }
    if let Some(store_path) = args.store_path {
        config.store_path = Some(store_path);
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!(
        "Pipeline configuration - App: {}, Endpoint: {}, Batch size: {}, Store: {}",
        config.app_id,
        config.endpoint_url,
        config.max_logs_per_batch,
        config
            .store_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "memory".to_string())
    );

    let pipeline = SignalPipeline::new(config)?;

    if let Err(e) = pipeline.run().await {
        error!("Pipeline failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Initialize structured logging
fn initialize_tracing(log_level: &str) {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
