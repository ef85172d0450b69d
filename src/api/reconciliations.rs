use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use super::AppState;
use crate::domain::{ParticipantId, ReconcileScope, ReconcilerRun};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    pub scope: String,
    pub id: Option<String>,
}

impl ReconcileRequest {
    fn into_scope(self) -> Result<ReconcileScope, AppError> {
        let id = self.id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        match (self.scope.trim().to_ascii_lowercase().as_str(), id) {
            ("all", _) => Ok(ReconcileScope::All),
            ("beneficiary", Some(id)) => Ok(ReconcileScope::Beneficiary(ParticipantId::new(id))),
            ("event", Some(id)) => Ok(ReconcileScope::Event(id)),
            ("beneficiary" | "event", None) => {
                Err(AppError::BadRequest(format!("scope {} requires an id", self.scope)))
            }
            (other, _) => Err(AppError::BadRequest(format!("unknown scope: {}", other))),
        }
    }
}

pub async fn run_reconciliation(
    State(state): State<AppState>,
    Json(req): Json<ReconcileRequest>,
) -> Result<Json<ReconcilerRun>, AppError> {
    let scope = req.into_scope()?;
    let run = state.ledger.run_reconciliation(scope).await?;
    Ok(Json(run))
}
