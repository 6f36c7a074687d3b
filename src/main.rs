//! rainwatch - rain-gauge telemetry and anomaly feedback service.
//!
//! Stores station readings, flags suspect values, tracks reviewer feedback
//! on each flag and serves grouped rainfall statistics over HTTP.

mod anomaly;
mod config;
mod db;
mod error;
mod stats;
mod web;

use config::ServerConfig;
use db::Store;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("rainwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting rainwatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);
    tracing::info!(
        "Classifier: ceiling {} mm, spike x{} over >= {} readings, stale run > {}, gap > {}s + {}s",
        cfg.classifier.max_rainfall_mm,
        cfg.classifier.spike_multiplier,
        cfg.classifier.spike_min_window,
        cfg.classifier.stale_repeat_run,
        cfg.classifier.sampling_interval_secs,
        cfg.classifier.gap_tolerance_secs
    );

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Start web server
    let server = Server::new(cfg, store);
    server.start().await?;

    Ok(())
}
