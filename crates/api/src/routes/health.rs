//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::services::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// `ok`, `failing` once any read model has recorded a failure, or
    /// `unavailable` when progress could not be read. A recorded failure
    /// stays reported after later events succeed.
    pub catchup: &'static str,
}

/// GET /health — returns system health status.
pub async fn check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let catchup = match state.sensors.catchup_report().await {
        Ok(report) if report.is_healthy() => "ok",
        Ok(_) => "failing",
        Err(e) => {
            tracing::warn!(error = %e, "could not read catchup progress");
            "unavailable"
        }
    };
    Json(HealthResponse { status: "ok", catchup })
}
