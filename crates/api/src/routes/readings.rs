//! Reading Routes

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    Json,
};
use ingestion::{Reading, RejectionRecord, SubmitOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::blocking;
use crate::error::ApiError;
use crate::AppState;

/// Submit a reading
pub async fn submit_reading(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Reading>, JsonRejection>,
) -> Result<Json<SubmitOutcome>, ApiError> {
    let Json(reading) = body.map_err(|e| ApiError::BadRequest {
        status: e.status(),
        message: e.body_text(),
    })?;
    debug!("Reading from {} for {}", reading.sensor_id, reading.subject_id);

    let service = state.ingestion.clone();
    let outcome = blocking(move || Ok(service.submit(reading)?)).await?;
    Ok(Json(outcome))
}

/// Query parameters for rejections endpoint
#[derive(Debug, Deserialize)]
pub struct RejectionParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
pub struct RejectionResponse {
    pub data: Vec<RejectionRecord>,
    pub count: usize,
}

/// Recently rejected readings, newest first
pub async fn get_rejections(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RejectionParams>,
) -> Json<RejectionResponse> {
    let data = state.ingestion.recent_rejections(params.limit.min(1000));
    Json(RejectionResponse {
        count: data.len(),
        data,
    })
}
