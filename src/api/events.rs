use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use super::AppState;
use crate::domain::RollbackOutcome;
use crate::error::AppError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    #[serde(default)]
    pub reason: String,
}

pub async fn rollback_event(
    Path(event_id): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<RollbackRequest>,
) -> Result<Json<RollbackOutcome>, AppError> {
    let outcome = state.ledger.rollback_event(&event_id, &req.reason).await?;
    Ok(Json(outcome))
}
