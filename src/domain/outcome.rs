//! Results of ledger operations as seen by callers.

use crate::domain::{ChainLink, Decimal, EntryKey, RejectReason};
use serde::Serialize;

/// An active entry whose stored amount disagrees with a fresh derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetail {
    pub entry_id: String,
    pub key: EntryKey,
    pub stored: Decimal,
    pub derived: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ApplyOutcome {
    #[serde(rename_all = "camelCase")]
    Applied { count: usize, entry_ids: Vec<String> },
    Noop,
    Conflict(ConflictDetail),
}

impl ApplyOutcome {
    pub fn applied_count(&self) -> usize {
        match self {
            ApplyOutcome::Applied { count, .. } => *count,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RollbackOutcome {
    #[serde(rename_all = "camelCase")]
    RolledBack {
        event_id: String,
        entry_ids: Vec<String>,
    },
    AlreadyRolledBack {
        #[serde(rename = "eventId")]
        event_id: String,
    },
}

/// Outcome of submitting one purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitResult {
    #[serde(rename_all = "camelCase")]
    Accepted {
        event_id: String,
        chain: Vec<ChainLink>,
        outcome: ApplyOutcome,
    },
    Rejected {
        reason: RejectReason,
    },
    Duplicate {
        #[serde(rename = "eventId")]
        event_id: String,
    },
}
