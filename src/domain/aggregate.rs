//! Per-beneficiary aggregate balances, derived from active entries.

use crate::domain::{Currency, Decimal, Generation, ParticipantId, TimeMs};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An earnings total left the representable decimal range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("earnings of {beneficiary_id} in {currency} overflow generation {generation}")]
pub struct AggregateOverflow {
    pub beneficiary_id: ParticipantId,
    pub currency: Currency,
    pub generation: Generation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationTotals {
    /// Distinct referred participants with at least one active entry.
    pub count: i64,
    pub earnings: Decimal,
}

/// Cache-like summary of a beneficiary's active entries in one currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeneficiaryAggregate {
    pub beneficiary_id: ParticipantId,
    pub currency: Currency,
    pub total_earnings: Decimal,
    pub per_generation: [GenerationTotals; 3],
    pub direct_referral_count: i64,
    /// Bumped on every committed change; 0 means never written.
    pub version: i64,
    pub updated_at: Option<TimeMs>,
}

impl BeneficiaryAggregate {
    pub fn empty(beneficiary_id: ParticipantId, currency: Currency) -> Self {
        Self {
            beneficiary_id,
            currency,
            total_earnings: Decimal::zero(),
            per_generation: [GenerationTotals::default(); 3],
            direct_referral_count: 0,
            version: 0,
            updated_at: None,
        }
    }

    pub fn generation(&self, g: Generation) -> &GenerationTotals {
        &self.per_generation[g.index()]
    }

    /// Compare the balances only, ignoring version and timestamps.
    pub fn same_balances(&self, other: &BeneficiaryAggregate) -> bool {
        self.total_earnings == other.total_earnings
            && self.per_generation == other.per_generation
            && self.direct_referral_count == other.direct_referral_count
    }
}

/// Signed change to one aggregate produced by a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregateDelta {
    pub earnings: [Decimal; 3],
    pub counts: [i64; 3],
}

impl AggregateDelta {
    /// Accumulate `amount` into generation `g`; `None` on overflow.
    pub fn add_earnings(&mut self, g: Generation, amount: Decimal) -> Option<()> {
        let slot = &mut self.earnings[g.index()];
        *slot = slot.checked_add(amount)?;
        Some(())
    }

    pub fn add_count(&mut self, g: Generation, n: i64) {
        self.counts[g.index()] += n;
    }

    pub fn is_zero(&self) -> bool {
        self.earnings.iter().all(Decimal::is_zero) && self.counts.iter().all(|c| *c == 0)
    }

    /// Apply to `agg` in place; the caller bumps the version on commit.
    ///
    /// On overflow `agg` is left unchanged.
    pub fn apply_to(&self, agg: &mut BeneficiaryAggregate) -> Result<(), AggregateOverflow> {
        let overflow = |generation| AggregateOverflow {
            beneficiary_id: agg.beneficiary_id.clone(),
            currency: agg.currency,
            generation,
        };

        let mut per_generation = agg.per_generation;
        for g in Generation::all() {
            let totals = &mut per_generation[g.index()];
            totals.earnings = totals
                .earnings
                .checked_add(self.earnings[g.index()])
                .ok_or_else(|| overflow(g))?;
            totals.count += self.counts[g.index()];
        }
        let total = Decimal::checked_sum(per_generation.iter().map(|t| t.earnings))
            .ok_or_else(|| overflow(Generation::FIRST))?;

        agg.per_generation = per_generation;
        agg.total_earnings = total;
        agg.direct_referral_count = per_generation[Generation::FIRST.index()].count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn delta_keeps_total_and_direct_count_consistent() {
        let mut agg = BeneficiaryAggregate::empty(ParticipantId::new("a"), Currency::Ngn);
        let mut delta = AggregateDelta::default();
        delta.add_earnings(Generation::FIRST, Decimal::from_str("1500").unwrap()).unwrap();
        delta.add_count(Generation::FIRST, 1);
        delta.add_earnings(Generation::new(2).unwrap(), Decimal::from_str("300").unwrap()).unwrap();
        delta.apply_to(&mut agg).unwrap();

        assert_eq!(agg.total_earnings, Decimal::from_str("1800").unwrap());
        assert_eq!(agg.direct_referral_count, 1);
        assert_eq!(agg.generation(Generation::new(2).unwrap()).count, 0);
    }

    #[test]
    fn overflowing_delta_leaves_aggregate_untouched() {
        let big = Decimal::from_str("50000000000000000000000000000").unwrap();
        let mut agg = BeneficiaryAggregate::empty(ParticipantId::new("a"), Currency::Ngn);
        let mut delta = AggregateDelta::default();
        delta.add_earnings(Generation::FIRST, big).unwrap();
        delta.add_count(Generation::FIRST, 1);
        delta.apply_to(&mut agg).unwrap();

        let before = agg.clone();
        let err = delta.apply_to(&mut agg).unwrap_err();
        assert_eq!(err.generation, Generation::FIRST);
        assert_eq!(agg, before);

        assert!(delta.add_earnings(Generation::FIRST, big).is_none());
    }

    #[test]
    fn overflowing_total_is_reported() {
        let big = Decimal::from_str("50000000000000000000000000000").unwrap();
        let mut agg = BeneficiaryAggregate::empty(ParticipantId::new("a"), Currency::Ngn);
        let mut delta = AggregateDelta::default();
        delta.add_earnings(Generation::FIRST, big).unwrap();
        delta.add_earnings(Generation::new(2).unwrap(), big).unwrap();

        assert!(delta.apply_to(&mut agg).is_err());
        assert!(agg.total_earnings.is_zero());
    }

    #[test]
    fn same_balances_ignores_version() {
        let a = BeneficiaryAggregate::empty(ParticipantId::new("a"), Currency::Ngn);
        let mut b = a.clone();
        b.version = 7;
        assert!(a.same_balances(&b));
    }
}
