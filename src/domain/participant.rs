//! Participants of the referral graph, owned by the host identity store.

use crate::domain::{ParticipantId, TimeMs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Active,
    Inactive,
    Banned,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantStatus::Active => "active",
            ParticipantStatus::Inactive => "inactive",
            ParticipantStatus::Banned => "banned",
        }
    }
}

impl FromStr for ParticipantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(ParticipantStatus::Active),
            "inactive" => Ok(ParticipantStatus::Inactive),
            "banned" => Ok(ParticipantStatus::Banned),
            other => Err(format!("unknown participant status: {}", other)),
        }
    }
}

impl fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A member of the referral graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    /// Unique referral code; immutable once set.
    pub handle: String,
    /// Handle of the participant who referred this one.
    pub referrer_handle: Option<String>,
    pub status: ParticipantStatus,
}

impl Participant {
    pub fn new(id: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            id: ParticipantId::new(id),
            handle: handle.into(),
            referrer_handle: None,
            status: ParticipantStatus::Active,
        }
    }

    pub fn referred_by(mut self, handle: impl Into<String>) -> Self {
        self.referrer_handle = Some(handle.into());
        self
    }

    pub fn with_status(mut self, status: ParticipantStatus) -> Self {
        self.status = status;
        self
    }

    /// Inactive and banned participants stay in the chain but earn nothing.
    pub fn is_suppressed(&self) -> bool {
        self.status != ParticipantStatus::Active
    }
}

/// A participant whose referrer handle no longer resolves, awaiting admin action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantFlag {
    pub participant_id: ParticipantId,
    pub referrer_handle: String,
    pub reason: String,
    pub flagged_at: TimeMs,
    pub run_id: String,
}
