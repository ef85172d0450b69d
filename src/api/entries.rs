use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::AppState;
use crate::db::EntryFilter;
use crate::domain::{CommissionEntry, EntryStatus, Generation, ParticipantId, TimeMs};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntriesQuery {
    pub beneficiary_id: String,
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
    pub generation: Option<u8>,
    pub status: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntriesResponse {
    pub entries: Vec<EntryDto>,
    pub page: u32,
    pub page_size: u32,
    pub total: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryDto {
    pub entry_id: String,
    pub event_id: String,
    pub generation: u8,
    pub beneficiary_id: String,
    pub referred_id: String,
    pub amount: String,
    pub currency: String,
    pub rate_applied: String,
    pub status: String,
    pub created_at_ms: i64,
}

impl From<CommissionEntry> for EntryDto {
    fn from(e: CommissionEntry) -> Self {
        Self {
            entry_id: e.entry_id,
            event_id: e.event_id,
            generation: e.generation.get(),
            beneficiary_id: e.beneficiary_id.to_string(),
            referred_id: e.referred_id.to_string(),
            amount: e.amount.to_canonical_string(),
            currency: e.currency.as_str().to_string(),
            rate_applied: e.rate_applied.to_canonical_string(),
            status: e.status.as_str().to_string(),
            created_at_ms: e.created_at.as_ms(),
        }
    }
}

pub async fn get_entries(
    Query(params): Query<EntriesQuery>,
    State(state): State<AppState>,
) -> Result<Json<EntriesResponse>, AppError> {
    let beneficiary = params.beneficiary_id.trim();
    if beneficiary.is_empty() {
        return Err(AppError::BadRequest("beneficiaryId is required".into()));
    }

    let generation = params
        .generation
        .map(|g| Generation::new(g).ok_or_else(|| AppError::BadRequest("generation must be 1..=3".into())))
        .transpose()?;
    let status = match params.status.as_deref() {
        Some("") | None => None,
        Some(s) => Some(EntryStatus::from_str(s).map_err(AppError::BadRequest)?),
    };

    let filter = EntryFilter {
        beneficiary_id: ParticipantId::new(beneficiary),
        since: params.since_ms.map(TimeMs::new),
        until: params.until_ms.map(TimeMs::new),
        generation,
        status,
    };

    let page = state
        .ledger
        .list_entries(&filter, params.page.unwrap_or(1), params.page_size.unwrap_or(50))
        .await?;

    Ok(Json(EntriesResponse {
        entries: page.items.into_iter().map(EntryDto::from).collect(),
        page: page.page,
        page_size: page.page_size,
        total: page.total,
    }))
}
