//! Reconciler run journal types.

use crate::domain::{Currency, Decimal, EntryKey, ParticipantId, TimeMs};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a reconciliation pass covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum ReconcileScope {
    All,
    Beneficiary(ParticipantId),
    Event(String),
}

impl fmt::Display for ReconcileScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileScope::All => write!(f, "all"),
            ReconcileScope::Beneficiary(id) => write!(f, "beneficiary:{}", id),
            ReconcileScope::Event(id) => write!(f, "event:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// An integrity problem observed during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    DuplicateGroup {
        key: EntryKey,
        entry_ids: Vec<String>,
    },
    MissingEntry {
        key: EntryKey,
        amount: Decimal,
    },
    AmountConflict {
        entry_id: String,
        key: EntryKey,
        expected: Decimal,
        actual: Decimal,
    },
    AggregateDrift {
        beneficiary_id: ParticipantId,
        currency: Currency,
        stored_total: Decimal,
        computed_total: Decimal,
    },
    UnresolvableReferrer {
        participant_id: ParticipantId,
        referrer_handle: String,
        reason: String,
    },
}

/// A repair performed during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    MarkedDuplicate {
        entry_id: String,
        key: EntryKey,
    },
    InsertedEntry {
        entry_id: String,
        key: EntryKey,
    },
    RebuiltAggregate {
        beneficiary_id: ParticipantId,
        currency: Currency,
        version: i64,
    },
    FlaggedParticipant {
        participant_id: ParticipantId,
    },
}

/// Journal record of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerRun {
    pub run_id: String,
    pub scope: ReconcileScope,
    pub status: RunStatus,
    pub started_at: TimeMs,
    pub finished_at: TimeMs,
    pub issues_found: Vec<Finding>,
    pub actions_taken: Vec<Action>,
}

impl ReconcilerRun {
    pub fn is_noop(&self) -> bool {
        self.actions_taken.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_serializes_tagged() {
        let json = serde_json::to_value(ReconcileScope::Beneficiary(ParticipantId::new("a")))
            .unwrap();
        assert_eq!(json, serde_json::json!({"scope": "beneficiary", "id": "a"}));

        let all: ReconcileScope = serde_json::from_value(serde_json::json!({"scope": "all"}))
            .unwrap();
        assert_eq!(all, ReconcileScope::All);
    }
}
