//! Pure derivation of the commission entries an event owes.

use crate::domain::{
    schedule_in_force, ChainLink, DerivedEntry, EntryKey, PurchaseEvent, RateSchedule,
    RoundingMode, TimeMs,
};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeriveError {
    #[error("no rate schedule in force at {0}")]
    NoScheduleInForce(TimeMs),
    #[error("chain yields key {0} twice")]
    DuplicateKey(EntryKey),
    #[error("amount overflow for {0}")]
    Overflow(EntryKey),
}

/// Turns an event and its resolved chain into entries.
///
/// Deterministic: the same event, chain and schedule always produce the same
/// entries in the same order. Suppressed links and zero rates yield nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommissionDeriver {
    rounding: RoundingMode,
}

impl CommissionDeriver {
    pub fn new(rounding: RoundingMode) -> Self {
        Self { rounding }
    }

    pub fn rounding(&self) -> RoundingMode {
        self.rounding
    }

    pub fn derive(
        &self,
        event: &PurchaseEvent,
        chain: &[ChainLink],
        schedule: &RateSchedule,
    ) -> Result<Vec<DerivedEntry>, DeriveError> {
        let scale = event.currency.scale();
        let mut keys = HashSet::with_capacity(chain.len());
        let mut entries = Vec::with_capacity(chain.len());

        for link in chain {
            let key = EntryKey {
                event_id: event.event_id.clone(),
                generation: link.generation,
                beneficiary_id: link.beneficiary_id.clone(),
            };
            if !keys.insert(key.clone()) {
                return Err(DeriveError::DuplicateKey(key));
            }
            if link.suppressed {
                continue;
            }

            let rate = schedule.rate(link.generation);
            if rate.is_zero() {
                continue;
            }

            let amount = event
                .amount
                .checked_mul(rate)
                .ok_or_else(|| DeriveError::Overflow(key.clone()))?
                .round_to(scale, self.rounding);

            entries.push(DerivedEntry {
                event_id: key.event_id,
                generation: link.generation,
                beneficiary_id: key.beneficiary_id,
                referred_id: event.purchaser_id.clone(),
                amount,
                currency: event.currency,
                rate_applied: rate,
            });
        }

        Ok(entries)
    }

    /// Like [`derive`](Self::derive), selecting the schedule in force at the event time.
    pub fn derive_with_history(
        &self,
        event: &PurchaseEvent,
        chain: &[ChainLink],
        schedules: &[RateSchedule],
    ) -> Result<Vec<DerivedEntry>, DeriveError> {
        let schedule = schedule_in_force(schedules, event.occurred_at)
            .ok_or(DeriveError::NoScheduleInForce(event.occurred_at))?;
        self.derive(event, chain, schedule)
    }
}
