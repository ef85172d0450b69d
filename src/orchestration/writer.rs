//! Lock-guarded, retrying entry writer.
//!
//! Every write that touches aggregates goes through here: new entries for an
//! event and event rollbacks. Each attempt takes the aggregate locks it needs
//! in sorted order, then runs one store transaction under a deadline.

use super::locks::{AggregateKey, AggregateLocks};
use crate::config::Config;
use crate::db::repo::{ApplyTx, RollbackTx};
use crate::db::Repository;
use crate::domain::{
    ApplyOutcome, ChainSnapshot, ConflictDetail, DeadLetter, DeadLetterKind, DerivedEntry,
    PurchaseEvent, RawPurchase, RollbackOutcome, TimeMs,
};
use crate::error::LedgerError;
use crate::notify::{deliver, LedgerNotification, NotificationSink};
use backoff::future::retry;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fixed delay schedule with an attempt cap.
///
/// The n-th retry waits `delays[n]`, repeating the last delay once the list
/// runs out. No more retries once `max_attempts` attempts have run.
#[derive(Debug, Clone)]
pub struct ScheduleBackoff {
    delays: Vec<Duration>,
    max_attempts: u32,
    attempt: u32,
}

impl ScheduleBackoff {
    pub fn new(delays: Vec<Duration>, max_attempts: u32) -> Self {
        Self {
            delays,
            max_attempts: max_attempts.max(1),
            attempt: 0,
        }
    }
}

impl backoff::backoff::Backoff for ScheduleBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.max_attempts {
            return None;
        }
        let idx = (self.attempt as usize - 1).min(self.delays.len().saturating_sub(1));
        Some(self.delays.get(idx).copied().unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct LedgerWriter {
    repo: Arc<Repository>,
    locks: Arc<AggregateLocks>,
    sink: Arc<dyn NotificationSink>,
    delays: Vec<Duration>,
    max_attempts: u32,
    deadline: Duration,
}

impl LedgerWriter {
    pub fn new(
        repo: Arc<Repository>,
        locks: Arc<AggregateLocks>,
        sink: Arc<dyn NotificationSink>,
        config: &Config,
    ) -> Self {
        Self {
            repo,
            locks,
            sink,
            delays: config.retry_backoff.clone(),
            max_attempts: config.retry_max_attempts,
            deadline: config.store_call_deadline,
        }
    }

    pub fn locks(&self) -> &Arc<AggregateLocks> {
        &self.locks
    }

    fn backoff(&self) -> ScheduleBackoff {
        ScheduleBackoff::new(self.delays.clone(), self.max_attempts)
    }

    /// Run `fut` under the store-call deadline; elapsing is a `Cancelled` error.
    async fn within<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = T>,
    ) -> Result<T, LedgerError> {
        tokio::time::timeout(self.deadline, fut).await.map_err(|_| {
            LedgerError::cancelled(
                operation,
                format!("deadline of {}ms elapsed", self.deadline.as_millis()),
            )
        })
    }

    /// Run `f` while holding the locks of `keys`, retrying transient failures
    /// with the writer's backoff. Each attempt relocks and reruns `f` in full.
    pub async fn locked<T, F, Fut>(
        &self,
        operation: &'static str,
        keys: &BTreeSet<AggregateKey>,
        f: F,
    ) -> Result<T, LedgerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        retry(self.backoff(), || async {
            let _guard = self
                .within(operation, self.locks.acquire(keys.iter().cloned()))
                .await
                .map_err(classify)?;
            self.within(operation, f())
                .await
                .and_then(|r| r)
                .map_err(classify)
        })
        .await
    }

    /// Persist whichever of `derived` are missing, with their aggregate
    /// deltas, and capture the chain snapshot.
    ///
    /// Re-applying the same event is a no-op. A stored amount that disagrees
    /// with `derived` by more than one currency unit is reported as a
    /// conflict, dead-lettered, and leaves the store untouched.
    pub async fn apply(
        &self,
        event: &PurchaseEvent,
        chain: &ChainSnapshot,
        derived: &[DerivedEntry],
    ) -> Result<ApplyOutcome, LedgerError> {
        const OP: &str = "apply_event";
        let keys: BTreeSet<AggregateKey> = derived
            .iter()
            .map(|d| (d.beneficiary_id.clone(), d.currency))
            .collect();

        let result = retry(self.backoff(), || async {
            let _guard = self
                .within(OP, self.locks.acquire(keys.iter().cloned()))
                .await
                .map_err(classify)?;
            let now = TimeMs::now();
            self.within(OP, self.repo.apply_event_entries(event, chain, derived, now))
                .await
                .and_then(|r| r)
                .map_err(|e| {
                    if e.is_retryable() {
                        debug!(event_id = %event.event_id, error = %e, "Retrying apply");
                    }
                    classify(e)
                })
        })
        .await?;

        match result {
            ApplyTx::Applied {
                entries,
                aggregates,
            } => {
                info!(
                    event_id = %event.event_id,
                    entries = entries.len(),
                    aggregates = aggregates.len(),
                    "Applied commission entries"
                );
                for entry in &entries {
                    deliver(
                        self.sink.as_ref(),
                        &LedgerNotification::EntryApplied {
                            entry_id: entry.entry_id.clone(),
                            event_id: entry.event_id.clone(),
                            beneficiary_id: entry.beneficiary_id.clone(),
                            generation: entry.generation,
                            amount: entry.amount,
                            currency: entry.currency,
                        },
                    )
                    .await;
                }
                Ok(ApplyOutcome::Applied {
                    count: entries.len(),
                    entry_ids: entries.into_iter().map(|e| e.entry_id).collect(),
                })
            }
            ApplyTx::Noop => Ok(ApplyOutcome::Noop),
            ApplyTx::EventRolledBack => {
                debug!(event_id = %event.event_id, "Event rolled back; nothing to apply");
                Ok(ApplyOutcome::Noop)
            }
            ApplyTx::Conflict(detail) => {
                self.dead_letter_conflict(event, &detail).await?;
                Ok(ApplyOutcome::Conflict(detail))
            }
        }
    }

    async fn dead_letter_conflict(
        &self,
        event: &PurchaseEvent,
        detail: &ConflictDetail,
    ) -> Result<(), LedgerError> {
        warn!(
            event_id = %event.event_id,
            entry_id = %detail.entry_id,
            stored = %detail.stored,
            derived = %detail.derived,
            "Stored entry disagrees with derivation"
        );

        let letter = DeadLetter {
            id: uuid::Uuid::new_v4().to_string(),
            event_id: Some(event.event_id.clone()),
            kind: DeadLetterKind::Conflict,
            reason: format!(
                "entry {} stored {} but derivation gives {}",
                detail.entry_id, detail.stored, detail.derived
            ),
            payload: serde_json::json!({
                "event": RawPurchase::from(event),
                "conflict": detail,
            }),
            created_at: TimeMs::now(),
        };
        self.repo
            .insert_dead_letter(&letter)
            .await
            .map_err(|e| LedgerError::store("dead_letter", e).with_id(event.event_id.as_str()))
    }

    /// Mark every active entry of an event rolled back and reverse its
    /// aggregate contributions.
    pub async fn rollback(
        &self,
        event_id: &str,
        reason: &str,
    ) -> Result<RollbackOutcome, LedgerError> {
        const OP: &str = "rollback_event";

        let result = retry(self.backoff(), || async {
            let keys = self
                .within(OP, self.repo.active_aggregate_keys_for_event(event_id))
                .await
                .map_err(classify)?
                .map_err(|e| classify(LedgerError::store(OP, e).with_id(event_id)))?;
            let guard = self
                .within(OP, self.locks.acquire(keys))
                .await
                .map_err(classify)?;
            let now = TimeMs::now();
            self.within(
                OP,
                self.repo
                    .rollback_event_entries(event_id, reason, guard.keys(), now),
            )
            .await
            .and_then(|r| r)
            .map_err(classify)
        })
        .await?;

        match result {
            RollbackTx::RolledBack {
                entries,
                aggregates,
            } => {
                info!(
                    event_id,
                    entries = entries.len(),
                    aggregates = aggregates.len(),
                    reason,
                    "Rolled back event"
                );
                Ok(RollbackOutcome::RolledBack {
                    event_id: event_id.to_string(),
                    entry_ids: entries.into_iter().map(|e| e.entry_id).collect(),
                })
            }
            RollbackTx::AlreadyRolledBack => Ok(RollbackOutcome::AlreadyRolledBack {
                event_id: event_id.to_string(),
            }),
        }
    }
}

fn classify(err: LedgerError) -> backoff::Error<LedgerError> {
    if err.is_retryable() {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}
