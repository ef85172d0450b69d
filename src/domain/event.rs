//! Completed-purchase events as received and as accepted.

use crate::domain::{Currency, Decimal, ParticipantId, ProductKind, TimeMs};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A purchase as delivered by the upstream producer, before validation.
///
/// Loosely typed so that malformed payloads can still be dead-lettered verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPurchase {
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub purchaser_id: String,
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub product_kind: String,
    pub occurred_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
}

/// Largest purchase amount accepted, in whole currency units.
///
/// Leaves room for about 10^10 such purchases at a 100% rate before an
/// aggregate total would leave the decimal range.
pub const MAX_PURCHASE_AMOUNT_UNITS: i64 = 1_000_000_000_000_000_000;

/// Why a raw purchase could not be accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("event id is empty")]
    MissingEventId,
    #[error("purchaser id is empty")]
    MissingPurchaser,
    #[error("amount is not a decimal: {0}")]
    MalformedAmount(String),
    #[error("amount is negative: {0}")]
    NegativeAmount(String),
    #[error("amount exceeds the purchase ceiling: {0}")]
    AmountTooLarge(String),
    #[error("unknown currency: {0}")]
    UnknownCurrency(String),
    #[error("unknown product kind: {0}")]
    UnknownProductKind(String),
    #[error("purchaser {0} does not exist")]
    UnknownPurchaser(String),
    #[error("no rate schedule in force at {0}")]
    NoScheduleInForce(i64),
}

/// A validated purchase. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseEvent {
    pub event_id: String,
    pub purchaser_id: ParticipantId,
    pub amount: Decimal,
    pub currency: Currency,
    pub product_kind: ProductKind,
    pub occurred_at: TimeMs,
    /// Stable external reference (payment id); defaults to the event id.
    pub source_ref: String,
}

impl PurchaseEvent {
    /// Normalize a raw purchase into its canonical form.
    ///
    /// Checks everything that does not need a store lookup; purchaser existence
    /// is checked by the intake.
    pub fn normalize(raw: &RawPurchase) -> Result<Self, RejectReason> {
        let event_id = raw.event_id.trim();
        if event_id.is_empty() {
            return Err(RejectReason::MissingEventId);
        }

        let purchaser_id = raw.purchaser_id.trim();
        if purchaser_id.is_empty() {
            return Err(RejectReason::MissingPurchaser);
        }

        let amount = Decimal::from_str_canonical(&raw.amount)
            .map_err(|_| RejectReason::MalformedAmount(raw.amount.clone()))?;
        if amount.is_negative() {
            return Err(RejectReason::NegativeAmount(raw.amount.clone()));
        }
        if amount > Decimal::from(MAX_PURCHASE_AMOUNT_UNITS) {
            return Err(RejectReason::AmountTooLarge(raw.amount.clone()));
        }

        let currency = raw
            .currency
            .parse::<Currency>()
            .map_err(|_| RejectReason::UnknownCurrency(raw.currency.clone()))?;
        let product_kind = raw
            .product_kind
            .parse::<ProductKind>()
            .map_err(|_| RejectReason::UnknownProductKind(raw.product_kind.clone()))?;

        let source_ref = raw
            .source_ref
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(event_id)
            .to_string();

        Ok(Self {
            event_id: event_id.to_string(),
            purchaser_id: ParticipantId::new(purchaser_id),
            amount,
            currency,
            product_kind,
            occurred_at: TimeMs::new(raw.occurred_at_ms),
            source_ref,
        })
    }
}

impl From<&PurchaseEvent> for RawPurchase {
    fn from(event: &PurchaseEvent) -> Self {
        Self {
            event_id: event.event_id.clone(),
            purchaser_id: event.purchaser_id.to_string(),
            amount: event.amount.to_canonical_string(),
            currency: event.currency.to_string(),
            product_kind: event.product_kind.to_string(),
            occurred_at_ms: event.occurred_at.as_ms(),
            source_ref: Some(event.source_ref.clone()),
        }
    }
}
