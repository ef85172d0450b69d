//! Commission entries: the ledger of record.

use crate::domain::{Currency, Decimal, Generation, ParticipantId, TimeMs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of an entry. Only `active` contributes to aggregates; both
/// transitions out of `active` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Active,
    Duplicate,
    RolledBack,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Active => "active",
            EntryStatus::Duplicate => "duplicate",
            EntryStatus::RolledBack => "rolled_back",
        }
    }

    pub fn can_transition_to(&self, next: EntryStatus) -> bool {
        matches!(
            (self, next),
            (EntryStatus::Active, EntryStatus::Duplicate)
                | (EntryStatus::Active, EntryStatus::RolledBack)
        )
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(EntryStatus::Active),
            "duplicate" => Ok(EntryStatus::Duplicate),
            "rolled_back" | "rolled-back" => Ok(EntryStatus::RolledBack),
            other => Err(format!("unknown entry status: {}", other)),
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the commission owed: one active entry per key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryKey {
    pub event_id: String,
    pub generation: Generation,
    pub beneficiary_id: ParticipantId,
}

impl EntryKey {
    /// Deterministic entry id for the canonical entry of this key.
    ///
    /// SHA-256 over length-prefixed fields, truncated to 128 bits.
    pub fn entry_id(&self) -> String {
        use sha2::{Digest, Sha256};

        fn hash_var(hasher: &mut Sha256, data: &str) {
            hasher.update((data.len() as u32).to_le_bytes());
            hasher.update(data.as_bytes());
        }

        let mut hasher = Sha256::new();
        hash_var(&mut hasher, &self.event_id);
        hasher.update([self.generation.get()]);
        hash_var(&mut hasher, self.beneficiary_id.as_str());

        let hash = hasher.finalize();
        format!("ce_{}", hex::encode(&hash[..16]))
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, g{}, {})",
            self.event_id, self.generation, self.beneficiary_id
        )
    }
}

/// An entry the deriver says should exist, before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedEntry {
    pub event_id: String,
    pub generation: Generation,
    pub beneficiary_id: ParticipantId,
    pub referred_id: ParticipantId,
    pub amount: Decimal,
    pub currency: Currency,
    pub rate_applied: Decimal,
}

impl DerivedEntry {
    pub fn key(&self) -> EntryKey {
        EntryKey {
            event_id: self.event_id.clone(),
            generation: self.generation,
            beneficiary_id: self.beneficiary_id.clone(),
        }
    }
}

/// A persisted commission entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommissionEntry {
    pub entry_id: String,
    pub event_id: String,
    pub generation: Generation,
    pub beneficiary_id: ParticipantId,
    pub referred_id: ParticipantId,
    pub amount: Decimal,
    pub currency: Currency,
    pub rate_applied: Decimal,
    pub status: EntryStatus,
    pub created_at: TimeMs,
}

impl CommissionEntry {
    pub fn from_derived(derived: &DerivedEntry, created_at: TimeMs) -> Self {
        Self {
            entry_id: derived.key().entry_id(),
            event_id: derived.event_id.clone(),
            generation: derived.generation,
            beneficiary_id: derived.beneficiary_id.clone(),
            referred_id: derived.referred_id.clone(),
            amount: derived.amount,
            currency: derived.currency,
            rate_applied: derived.rate_applied,
            status: EntryStatus::Active,
            created_at,
        }
    }

    pub fn key(&self) -> EntryKey {
        EntryKey {
            event_id: self.event_id.clone(),
            generation: self.generation,
            beneficiary_id: self.beneficiary_id.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == EntryStatus::Active
    }
}
