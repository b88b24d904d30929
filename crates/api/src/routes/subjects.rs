//! Subject, Chain and Verification Routes

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use ledger::{
    ApprovalDecided, ChainVerification, CustodyTransferred, EntryVerification, LedgerEntry,
    SubjectSummary, VerificationReport,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

use super::blocking;
use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct SubjectsResponse {
    pub data: Vec<SubjectSummary>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct ChainResponse {
    pub subject_id: String,
    pub entries: Vec<LedgerEntry>,
    pub count: usize,
}

fn json_body<T: DeserializeOwned>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(v)| v).map_err(|e| ApiError::BadRequest {
        status: e.status(),
        message: e.body_text(),
    })
}

/// All subjects with summaries
pub async fn list_subjects(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SubjectsResponse>, ApiError> {
    let data = blocking(move || Ok(state.explorer.list_subjects()?)).await?;
    Ok(Json(SubjectsResponse {
        count: data.len(),
        data,
    }))
}

/// Full chain of one subject
pub async fn get_chain(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
) -> Result<Json<ChainResponse>, ApiError> {
    let entries = {
        let subject_id = subject_id.clone();
        blocking(move || Ok(state.ledger.get_chain(&subject_id)?)).await?
    };
    if entries.is_empty() {
        return Err(ApiError::NotFound(format!("Subject {} not found", subject_id)));
    }
    Ok(Json(ChainResponse {
        subject_id,
        count: entries.len(),
        entries,
    }))
}

/// Verify one subject's chain
pub async fn verify_chain(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
) -> Result<Json<ChainVerification>, ApiError> {
    let result = blocking(move || Ok(state.ledger.verify_chain(&subject_id)?)).await?;
    Ok(Json(result))
}

/// Recompute one entry's hash
pub async fn verify_entry(
    State(state): State<Arc<AppState>>,
    Path((subject_id, index)): Path<(String, u64)>,
) -> Result<Json<EntryVerification>, ApiError> {
    let result = blocking(move || Ok(state.ledger.verify_entry(&subject_id, index)?)).await?;
    Ok(Json(result))
}

/// Verify every chain
pub async fn verify_all(
    State(state): State<Arc<AppState>>,
) -> Result<Json<VerificationReport>, ApiError> {
    let report = blocking(move || Ok(state.verifier.verify_all()?)).await?;
    Ok(Json(report))
}

/// Record a custody hand-off
pub async fn record_custody(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
    body: Result<Json<CustodyTransferred>, JsonRejection>,
) -> Result<(StatusCode, Json<LedgerEntry>), ApiError> {
    let transfer = json_body(body)?;
    let entry = blocking(move || {
        Ok(state
            .ingestion
            .record_custody_transfer(&subject_id, transfer)?)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// Record an approval decision
pub async fn record_approval(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
    body: Result<Json<ApprovalDecided>, JsonRejection>,
) -> Result<(StatusCode, Json<LedgerEntry>), ApiError> {
    let decision = json_body(body)?;
    let entry =
        blocking(move || Ok(state.ingestion.record_approval(&subject_id, decision)?)).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}
