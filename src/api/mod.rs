pub mod aggregates;
pub mod entries;
pub mod events;
pub mod health;
pub mod participants;
pub mod purchases;
pub mod reconciliations;

use crate::orchestration::Ledger;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
}

impl AppState {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/v1/purchases", post(purchases::submit_purchase))
        .route("/v1/purchases/import", post(purchases::import_purchases))
        .route(
            "/v1/aggregates/:beneficiary_id",
            get(aggregates::get_aggregate),
        )
        .route("/v1/entries", get(entries::get_entries))
        .route(
            "/v1/events/:event_id/rollback",
            post(events::rollback_event),
        )
        .route(
            "/v1/reconciliations",
            post(reconciliations::run_reconciliation),
        )
        .route(
            "/v1/participants/:participant_id/clear-referrer",
            post(participants::clear_referrer),
        )
        .layer(cors)
        .with_state(state)
}
