//! Catchup sensor endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use projections::CatchupSensorReport;

use crate::error::ApiError;
use crate::services::AppState;

/// GET /sensors/catchup — where every read model stands relative to the log.
#[tracing::instrument(skip(state))]
pub async fn catchup(State(state): State<Arc<AppState>>) -> Result<Json<CatchupSensorReport>, ApiError> {
    let report = state.sensors.catchup_report().await?;
    for (name, sensor) in &report.read_models {
        metrics::gauge!("catchup_events_remaining", "read_model" => name.clone()).set(sensor.events_remaining as f64);
    }
    Ok(Json(report))
}
