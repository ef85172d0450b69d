//! Rebuild aggregates from the entries that back them.

use crate::db::SeenIndex;
use crate::domain::{
    AggregateDelta, AggregateOverflow, BeneficiaryAggregate, CommissionEntry, Currency, EntryKey,
    ParticipantId,
};
use std::collections::{BTreeMap, HashSet};

/// Active entries of one aggregate split into the canonical entry per key and
/// the extra entries sharing a key with an earlier one.
#[derive(Debug, Clone, Default)]
pub struct DuplicateSplit {
    pub kept: Vec<CommissionEntry>,
    pub duplicates: BTreeMap<EntryKey, Vec<CommissionEntry>>,
}

impl DuplicateSplit {
    pub fn duplicate_count(&self) -> usize {
        self.duplicates.values().map(Vec::len).sum()
    }
}

/// Keep the first entry of each key in input order.
///
/// Callers pass entries ordered by `(createdAt, insertion order)` so the
/// earliest entry survives.
pub fn split_duplicates(entries: Vec<CommissionEntry>) -> DuplicateSplit {
    let mut seen = HashSet::with_capacity(entries.len());
    let mut split = DuplicateSplit::default();
    for entry in entries {
        let key = entry.key();
        if seen.insert(key.clone()) {
            split.kept.push(entry);
        } else {
            split.duplicates.entry(key).or_default().push(entry);
        }
    }
    split
}

/// Aggregate and seen index implied by `entries`, all active and of one
/// beneficiary and currency. Version and timestamp are left for the caller.
///
/// Fails if the earnings of any generation, or their total, overflow.
pub fn rebuild(
    beneficiary: &ParticipantId,
    currency: Currency,
    entries: &[CommissionEntry],
) -> Result<(BeneficiaryAggregate, SeenIndex), AggregateOverflow> {
    let mut seen = SeenIndex::new();
    let mut delta = AggregateDelta::default();

    for entry in entries
        .iter()
        .filter(|e| e.is_active() && &e.beneficiary_id == beneficiary && e.currency == currency)
    {
        delta
            .add_earnings(entry.generation, entry.amount)
            .ok_or_else(|| AggregateOverflow {
                beneficiary_id: beneficiary.clone(),
                currency,
                generation: entry.generation,
            })?;
        let refs = seen
            .entry((entry.generation, entry.referred_id.clone()))
            .or_insert(0);
        if *refs == 0 {
            delta.add_count(entry.generation, 1);
        }
        *refs += 1;
    }

    let mut agg = BeneficiaryAggregate::empty(beneficiary.clone(), currency);
    delta.apply_to(&mut agg)?;
    Ok((agg, seen))
}
