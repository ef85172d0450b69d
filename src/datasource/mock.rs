//! In-memory participant directory and rate schedule source for tests.

use super::{DataSourceError, ParticipantDirectory, RateScheduleSource};
use crate::domain::{Participant, ParticipantId, RateSchedule};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Directory that serves a predefined referral graph.
#[derive(Debug, Clone, Default)]
pub struct MockDirectory {
    participants: BTreeMap<ParticipantId, Participant>,
    schedules: Vec<RateSchedule>,
    unavailable: bool,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant (replacing one with the same id).
    pub fn with_participant(mut self, participant: Participant) -> Self {
        self.participants
            .insert(participant.id.clone(), participant);
        self
    }

    pub fn with_participants(mut self, participants: impl IntoIterator<Item = Participant>) -> Self {
        for p in participants {
            self.participants.insert(p.id.clone(), p);
        }
        self
    }

    pub fn with_schedule(mut self, schedule: RateSchedule) -> Self {
        self.schedules.push(schedule);
        self
    }

    /// Make every lookup fail with a retryable error.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    fn check(&self) -> Result<(), DataSourceError> {
        if self.unavailable {
            return Err(DataSourceError::Unavailable("mock directory offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ParticipantDirectory for MockDirectory {
    async fn get_participant(
        &self,
        id: &ParticipantId,
    ) -> Result<Option<Participant>, DataSourceError> {
        self.check()?;
        Ok(self.participants.get(id).cloned())
    }

    async fn get_participant_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<Participant>, DataSourceError> {
        self.check()?;
        Ok(self
            .participants
            .values()
            .find(|p| p.handle == handle)
            .cloned())
    }

    async fn list_participants_with_referrer(&self) -> Result<Vec<Participant>, DataSourceError> {
        self.check()?;
        Ok(self
            .participants
            .values()
            .filter(|p| p.referrer_handle.is_some())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RateScheduleSource for MockDirectory {
    async fn schedules(&self) -> Result<Vec<RateSchedule>, DataSourceError> {
        self.check()?;
        Ok(self.schedules.clone())
    }
}
