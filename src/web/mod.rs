//! Web server module.

mod handlers;

pub use handlers::*;

use crate::anomaly::Ledger;
use crate::config::ServerConfig;
use crate::db::Store;
use crate::stats::Aggregator;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub ledger: Arc<Ledger>,
    pub aggregator: Arc<Aggregator>,
}

impl AppState {
    /// Wire the ledger and aggregator onto a store using `config`.
    pub fn new(config: ServerConfig, store: Arc<Store>) -> Self {
        let ledger = Arc::new(Ledger::new(
            store.clone(),
            config.classifier.clone(),
            config.history_window,
        ));
        let aggregator = Arc::new(Aggregator::new(store.clone()));
        Self {
            config,
            store,
            ledger,
            aggregator,
        }
    }
}

/// Web server for rainwatch.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: ServerConfig, store: Arc<Store>) -> Self {
        Self {
            state: AppState::new(config, store),
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/api/health", get(handlers::handle_health))
            // Stations and readings
            .route(
                "/api/stations",
                get(handlers::handle_get_stations).post(handlers::handle_create_station),
            )
            .route("/api/stations/{code}", get(handlers::handle_get_station))
            .route("/api/stations/{code}/readings", get(handlers::handle_get_readings))
            .route("/api/regions", get(handlers::handle_get_regions))
            .route("/api/readings", post(handlers::handle_ingest_reading))
            .route("/api/readings/reclassify", post(handlers::handle_reclassify))
            // Anomalies
            .route("/api/anomalies", get(handlers::handle_list_anomalies))
            .route("/api/anomalies/lookup", get(handlers::handle_lookup_anomaly))
            .route("/api/anomalies/{id}", get(handlers::handle_get_anomaly))
            .route("/api/anomalies/{id}/feedback", post(handlers::handle_submit_feedback))
            // Statistics
            .route("/api/statistics", get(handlers::handle_statistics))
            .route("/api/statistics/summary", get(handlers::handle_summary))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
