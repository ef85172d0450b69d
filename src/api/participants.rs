use axum::extract::{Path, State};
use axum::Json;

use super::AppState;
use crate::domain::ParticipantId;
use crate::error::AppError;

pub async fn clear_referrer(
    Path(participant_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = ParticipantId::new(participant_id.trim());
    state.ledger.clear_referrer(&id).await?;
    Ok(Json(serde_json::json!({
        "participantId": id.as_str(),
        "referrerCleared": true,
    })))
}
