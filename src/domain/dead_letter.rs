//! Dead-letter records for events that need human triage.

use crate::domain::TimeMs;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    Validation,
    Conflict,
}

impl DeadLetterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterKind::Validation => "validation",
            DeadLetterKind::Conflict => "conflict",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: String,
    pub event_id: Option<String>,
    pub kind: DeadLetterKind,
    pub reason: String,
    pub payload: serde_json::Value,
    pub created_at: TimeMs,
}
