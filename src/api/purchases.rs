use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use super::AppState;
use crate::domain::{RawPurchase, SubmitResult};
use crate::error::AppError;
use crate::orchestration::ImportSummary;

/// Accepted and duplicate submissions answer 200; rejections answer 400 with
/// the same body so the reason code stays machine readable.
pub async fn submit_purchase(
    State(state): State<AppState>,
    Json(raw): Json<RawPurchase>,
) -> Result<(StatusCode, Json<SubmitResult>), AppError> {
    let result = state.ledger.submit_purchase(raw).await?;
    let status = match result {
        SubmitResult::Rejected { .. } => StatusCode::BAD_REQUEST,
        SubmitResult::Accepted { .. } | SubmitResult::Duplicate { .. } => StatusCode::OK,
    };
    Ok((status, Json(result)))
}

pub async fn import_purchases(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ImportSummary>, AppError> {
    if body.is_empty() {
        return Err(AppError::BadRequest("empty import body".into()));
    }
    let summary = state.ledger.import_purchases(&body).await?;
    Ok(Json(summary))
}
