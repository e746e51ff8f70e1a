//! Clock administration endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Duration, Utc};
use scheduler::{AdvanceTo, Clock, SchedulerAdvancedResult};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::services::AppState;

// -- Request types --

#[derive(Debug, Deserialize)]
pub struct CreateClockRequest {
    pub name: String,
    /// Defaults to the current time.
    pub start_time: Option<DateTime<Utc>>,
}

/// Exactly one of `to` and `by_seconds`.
#[derive(Debug, Deserialize)]
pub struct AdvanceClockRequest {
    pub to: Option<DateTime<Utc>>,
    pub by_seconds: Option<i64>,
}

impl AdvanceClockRequest {
    fn target(&self) -> Result<AdvanceTo, ApiError> {
        match (self.to, self.by_seconds) {
            (Some(to), None) => Ok(AdvanceTo::Time(to)),
            (None, Some(seconds)) if seconds < 0 => Err(ApiError::BadRequest(format!(
                "by_seconds must not be negative, got {seconds}"
            ))),
            (None, Some(seconds)) => Duration::try_seconds(seconds)
                .map(AdvanceTo::By)
                .ok_or_else(|| ApiError::BadRequest(format!("by_seconds is out of range, got {seconds}"))),
            _ => Err(ApiError::BadRequest(
                "exactly one of `to` and `by_seconds` is required".to_string(),
            )),
        }
    }
}

// -- Response types --

#[derive(Serialize)]
pub struct AdvanceClockResponse {
    pub clock: Clock,
    #[serde(flatten)]
    pub result: SchedulerAdvancedResult,
}

// -- Handlers --

/// POST /clocks — create a clock.
#[tracing::instrument(skip(state))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateClockRequest>,
) -> Result<(StatusCode, Json<Clock>), ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("clock name must not be empty".to_string()));
    }
    let start_time = req.start_time.unwrap_or_else(Utc::now);
    let clock = state.clocks.create_clock(&req.name, start_time).await?;
    Ok((StatusCode::CREATED, Json(clock)))
}

/// GET /clocks/{name} — a clock's current time.
#[tracing::instrument(skip(state))]
pub async fn get(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Result<Json<Clock>, ApiError> {
    state
        .clocks
        .clock(&name)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Clock {name} not found")))
}

/// POST /clocks/{name}/advance — move a clock forward and deliver what
/// became due.
#[tracing::instrument(skip(state))]
pub async fn advance(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<AdvanceClockRequest>,
) -> Result<Json<AdvanceClockResponse>, ApiError> {
    let target = req.target()?;
    let result = state.clocks.advance_clock(&name, target).await?;
    let clock = state
        .clocks
        .clock(&name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Clock {name} not found")))?;
    Ok(Json(AdvanceClockResponse { clock, result }))
}
