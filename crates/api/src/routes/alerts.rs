//! Alert Routes

use alerting::{AlertQuery, AlertRecord, Severity};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiError;
use crate::AppState;

/// Query parameters for alerts endpoint
#[derive(Debug, Deserialize)]
pub struct AlertParams {
    /// Filter by subject
    pub subject: Option<String>,
    /// Filter by severity
    pub severity: Option<Severity>,
    /// Filter by acknowledged status
    pub acknowledged: Option<bool>,
    /// Maximum number of records
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// Response for alerts endpoint
#[derive(Debug, Serialize)]
pub struct AlertResponse {
    pub data: Vec<AlertRecord>,
    pub count: usize,
    pub unacknowledged_count: usize,
}

/// Acknowledgment request body
#[derive(Debug, Default, Deserialize)]
pub struct AckRequest {
    pub by: Option<String>,
}

/// List alerts, newest first
pub async fn get_alerts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AlertParams>,
) -> Result<Json<AlertResponse>, ApiError> {
    let query = AlertQuery {
        subject_id: params.subject,
        severity: params.severity,
        acknowledged: params.acknowledged,
        limit: Some(params.limit.min(1000)),
    };
    let data = state.alerts.list(&query)?;

    Ok(Json(AlertResponse {
        count: data.len(),
        unacknowledged_count: state.alerts.pending_count(),
        data,
    }))
}

/// Acknowledge an alert
pub async fn acknowledge_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    body: Option<Json<AckRequest>>,
) -> Result<Json<AlertRecord>, ApiError> {
    let by = body.and_then(|Json(req)| req.by);
    let record = state.alerts.acknowledge(id, by.as_deref())?;
    Ok(Json(record))
}
