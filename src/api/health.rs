use axum::extract::State;
use axum::Json;

use super::AppState;
use crate::error::AppError;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Ready once the store answers a trivial query.
pub async fn ready(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    sqlx::query("SELECT 1")
        .execute(state.ledger.repo().pool())
        .await
        .map_err(|e| AppError::Unavailable(format!("store not ready: {}", e)))?;
    Ok(Json(serde_json::json!({"status": "ready"})))
}
