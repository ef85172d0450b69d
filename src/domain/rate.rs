//! Commission rate schedules.

use crate::domain::{Decimal, Generation, TimeMs};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateError {
    #[error("rate for generation {0} is negative")]
    Negative(u8),
    #[error("rate for generation {0} exceeds 100%")]
    AboveOne(u8),
}

/// Per-generation rates (fractions of the purchase amount) in force from `effective_from`.
///
/// Schedules are append-only; the one used for an event is the latest with
/// `effective_from <= occurred_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateSchedule {
    pub rates: [Decimal; 3],
    pub effective_from: TimeMs,
}

impl RateSchedule {
    /// Build a schedule from fractional rates, validating `0 <= r <= 1`.
    pub fn new(rates: [Decimal; 3], effective_from: TimeMs) -> Result<Self, RateError> {
        for (i, rate) in rates.iter().enumerate() {
            let g = (i + 1) as u8;
            if rate.is_negative() {
                return Err(RateError::Negative(g));
            }
            if *rate > Decimal::one() {
                return Err(RateError::AboveOne(g));
            }
        }
        Ok(Self {
            rates,
            effective_from,
        })
    }

    /// Build a schedule from percentages, e.g. `[15, 3, 2]`.
    pub fn from_percentages(
        percentages: [Decimal; 3],
        effective_from: TimeMs,
    ) -> Result<Self, RateError> {
        let rates = percentages.map(|p| p / Decimal::hundred());
        Self::new(rates, effective_from)
    }

    pub fn rate(&self, generation: Generation) -> Decimal {
        self.rates[generation.index()]
    }
}

/// Select the schedule in force at `at` from an unordered list.
pub fn schedule_in_force(schedules: &[RateSchedule], at: TimeMs) -> Option<&RateSchedule> {
    schedules
        .iter()
        .filter(|s| s.effective_from <= at)
        .max_by_key(|s| s.effective_from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn pct(a: &str, b: &str, c: &str) -> [Decimal; 3] {
        [
            Decimal::from_str(a).unwrap(),
            Decimal::from_str(b).unwrap(),
            Decimal::from_str(c).unwrap(),
        ]
    }

    #[test]
    fn percentages_become_fractions() {
        let s = RateSchedule::from_percentages(pct("15", "3", "2"), TimeMs::new(0)).unwrap();
        assert_eq!(s.rate(Generation::FIRST), Decimal::from_str("0.15").unwrap());
        assert_eq!(
            s.rate(Generation::new(3).unwrap()),
            Decimal::from_str("0.02").unwrap()
        );
    }

    #[test]
    fn rejects_negative_and_above_one() {
        assert_eq!(
            RateSchedule::from_percentages(pct("15", "-1", "2"), TimeMs::new(0)),
            Err(RateError::Negative(2))
        );
        assert_eq!(
            RateSchedule::from_percentages(pct("101", "3", "2"), TimeMs::new(0)),
            Err(RateError::AboveOne(1))
        );
    }

    #[test]
    fn picks_latest_effective_schedule() {
        let v1 = RateSchedule::from_percentages(pct("15", "3", "2"), TimeMs::new(100)).unwrap();
        let v2 = RateSchedule::from_percentages(pct("10", "2", "1"), TimeMs::new(200)).unwrap();
        let all = vec![v2.clone(), v1.clone()];

        assert_eq!(schedule_in_force(&all, TimeMs::new(50)), None);
        assert_eq!(schedule_in_force(&all, TimeMs::new(100)), Some(&v1));
        assert_eq!(schedule_in_force(&all, TimeMs::new(150)), Some(&v1));
        assert_eq!(schedule_in_force(&all, TimeMs::new(250)), Some(&v2));
    }
}
