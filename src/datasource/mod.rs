//! Collaborator interfaces: the participant directory and the rate schedule source.
//!
//! Both are owned by the host platform. The ledger only reads them. The SQLite
//! `Repository` implements both; `MockDirectory` serves tests.

use crate::db::Repository;
use crate::domain::{schedule_in_force, Participant, ParticipantId, RateSchedule, TimeMs};
use crate::error::{is_transient_store_error, LedgerError};
use async_trait::async_trait;
use std::fmt;

pub mod mock;
pub mod purchase_csv;

pub use mock::MockDirectory;
pub use purchase_csv::{parse_purchases, ImportError};

/// Read access to the referral graph.
#[async_trait]
pub trait ParticipantDirectory: Send + Sync + fmt::Debug {
    async fn get_participant(
        &self,
        id: &ParticipantId,
    ) -> Result<Option<Participant>, DataSourceError>;

    /// Look up a participant by referral handle (exact match).
    async fn get_participant_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<Participant>, DataSourceError>;

    /// Every participant that names a referrer.
    async fn list_participants_with_referrer(&self) -> Result<Vec<Participant>, DataSourceError>;
}

/// Read access to the append-only rate schedule history.
#[async_trait]
pub trait RateScheduleSource: Send + Sync + fmt::Debug {
    async fn schedules(&self) -> Result<Vec<RateSchedule>, DataSourceError>;

    /// The schedule in force at `at`.
    async fn schedule_at(&self, at: TimeMs) -> Result<Option<RateSchedule>, DataSourceError> {
        let all = self.schedules().await?;
        Ok(schedule_in_force(&all, at).cloned())
    }
}

/// Error type for collaborator lookups.
#[derive(Debug, Clone)]
pub enum DataSourceError {
    /// Lock contention, pool exhaustion or I/O; worth retrying.
    Unavailable(String),
    /// Stored data could not be read back.
    Corrupt(String),
    /// Other error
    Other(String),
}

impl DataSourceError {
    pub fn into_ledger(self, operation: &'static str) -> LedgerError {
        match self {
            DataSourceError::Unavailable(msg) => LedgerError::transient(operation, msg),
            DataSourceError::Corrupt(msg) | DataSourceError::Other(msg) => {
                LedgerError::integrity(operation, msg)
            }
        }
    }
}

impl fmt::Display for DataSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSourceError::Unavailable(msg) => write!(f, "Unavailable: {}", msg),
            DataSourceError::Corrupt(msg) => write!(f, "Corrupt data: {}", msg),
            DataSourceError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for DataSourceError {}

impl From<sqlx::Error> for DataSourceError {
    fn from(err: sqlx::Error) -> Self {
        if is_transient_store_error(&err) {
            DataSourceError::Unavailable(err.to_string())
        } else if matches!(err, sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. }) {
            DataSourceError::Corrupt(err.to_string())
        } else {
            DataSourceError::Other(err.to_string())
        }
    }
}

#[async_trait]
impl ParticipantDirectory for Repository {
    async fn get_participant(
        &self,
        id: &ParticipantId,
    ) -> Result<Option<Participant>, DataSourceError> {
        Ok(Repository::get_participant(self, id).await?)
    }

    async fn get_participant_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<Participant>, DataSourceError> {
        Ok(Repository::get_participant_by_handle(self, handle).await?)
    }

    async fn list_participants_with_referrer(&self) -> Result<Vec<Participant>, DataSourceError> {
        Ok(Repository::list_participants_with_referrer(self).await?)
    }
}

#[async_trait]
impl RateScheduleSource for Repository {
    async fn schedules(&self) -> Result<Vec<RateSchedule>, DataSourceError> {
        Ok(self.list_rate_schedules().await?)
    }

    async fn schedule_at(&self, at: TimeMs) -> Result<Option<RateSchedule>, DataSourceError> {
        Ok(self.rate_schedule_at(at).await?)
    }
}
