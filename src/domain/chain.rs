//! Resolved referral chains captured per event.

use crate::domain::{Generation, ParticipantId, TimeMs};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One ancestor in a resolved chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainLink {
    pub generation: Generation,
    pub beneficiary_id: ParticipantId,
    /// Inactive or banned ancestor: kept for audit, earns nothing.
    pub suppressed: bool,
}

/// Why the chain walk ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum ChainStop {
    NoReferrer,
    InvalidHandle(String),
    UnresolvedHandle(String),
    SelfReferral,
    Cycle(ParticipantId),
    MaxDepth,
}

/// The ancestor list of an event's purchaser at acceptance time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSnapshot {
    pub event_id: String,
    pub links: Vec<ChainLink>,
    pub captured_at: TimeMs,
}

impl ChainSnapshot {
    pub fn new(event_id: impl Into<String>, links: Vec<ChainLink>, captured_at: TimeMs) -> Self {
        Self {
            event_id: event_id.into(),
            links,
            captured_at,
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn beneficiaries(&self) -> impl Iterator<Item = &ParticipantId> {
        self.links.iter().map(|l| &l.beneficiary_id)
    }

    /// Strictly ascending generations starting at 1, no repeated beneficiary,
    /// purchaser absent, at most three links.
    pub fn is_sound(&self, purchaser: &ParticipantId) -> bool {
        if self.links.len() > usize::from(Generation::MAX) {
            return false;
        }
        let mut seen = HashSet::new();
        for (i, link) in self.links.iter().enumerate() {
            if usize::from(link.generation.get()) != i + 1 {
                return false;
            }
            if &link.beneficiary_id == purchaser || !seen.insert(&link.beneficiary_id) {
                return false;
            }
        }
        true
    }
}
