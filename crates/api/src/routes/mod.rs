//! Route Handlers

pub mod alerts;
pub mod readings;
pub mod subjects;

use crate::error::ApiError;

/// Run ledger work off the async executor
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
}
