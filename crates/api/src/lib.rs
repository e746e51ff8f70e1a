//! HTTP server for the read model catchup and the command scheduler.
//!
//! Serves catchup sensors and clock administration, with structured logging
//! (tracing) and Prometheus metrics. The catchup feeding the scheduler runs
//! in the background.

pub mod config;
pub mod error;
pub mod routes;
pub mod services;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use services::{AppState, ClockAdmin, InMemoryServices, Services, build_services, in_memory_services};

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/sensors/catchup", get(routes::sensors::catchup))
        .route("/clocks", post(routes::clocks::create))
        .route("/clocks/{name}", get(routes::clocks::get))
        .route("/clocks/{name}/advance", post(routes::clocks::advance))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
