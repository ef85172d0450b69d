use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::AppState;
use crate::domain::{BeneficiaryAggregate, Currency, Generation, ParticipantId};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateQuery {
    pub currency: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResponse {
    pub beneficiary_id: String,
    pub currency: String,
    pub total_earnings: String,
    pub direct_referral_count: i64,
    pub per_generation: Vec<GenerationDto>,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at_ms: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationDto {
    pub generation: u8,
    pub count: i64,
    pub earnings: String,
}

impl From<BeneficiaryAggregate> for AggregateResponse {
    fn from(agg: BeneficiaryAggregate) -> Self {
        let per_generation = Generation::all()
            .into_iter()
            .map(|g| {
                let totals = agg.generation(g);
                GenerationDto {
                    generation: g.get(),
                    count: totals.count,
                    earnings: totals.earnings.to_canonical_string(),
                }
            })
            .collect();

        Self {
            beneficiary_id: agg.beneficiary_id.to_string(),
            currency: agg.currency.as_str().to_string(),
            total_earnings: agg.total_earnings.to_canonical_string(),
            direct_referral_count: agg.direct_referral_count,
            per_generation,
            version: agg.version,
            updated_at_ms: agg.updated_at.map(|t| t.as_ms()),
        }
    }
}

pub async fn get_aggregate(
    Path(beneficiary_id): Path<String>,
    Query(params): Query<AggregateQuery>,
    State(state): State<AppState>,
) -> Result<Json<AggregateResponse>, AppError> {
    let currency = Currency::from_str(&params.currency).map_err(AppError::BadRequest)?;
    if beneficiary_id.trim().is_empty() {
        return Err(AppError::BadRequest("beneficiary id is required".into()));
    }

    let agg = state
        .ledger
        .query_aggregate(&ParticipantId::new(beneficiary_id.trim()), currency)
        .await?;
    Ok(Json(agg.into()))
}
