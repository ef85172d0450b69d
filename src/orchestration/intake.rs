//! Purchase intake: validation, chain resolution, derivation and the write,
//! fronted by a bounded queue.

use super::writer::LedgerWriter;
use crate::datasource::{ParticipantDirectory, RateScheduleSource};
use crate::db::Repository;
use crate::domain::{
    ChainSnapshot, DeadLetter, DeadLetterKind, PurchaseEvent, RawPurchase, RejectReason,
    SubmitResult, TimeMs,
};
use crate::engine::{ChainResolver, CommissionDeriver};
use crate::error::{ErrorKind, LedgerError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

/// Runs one purchase from raw payload to committed entries.
#[derive(Debug, Clone)]
pub struct IntakeService {
    repo: Arc<Repository>,
    directory: Arc<dyn ParticipantDirectory>,
    schedules: Arc<dyn RateScheduleSource>,
    resolver: ChainResolver,
    deriver: CommissionDeriver,
    writer: LedgerWriter,
}

impl IntakeService {
    pub fn new(
        repo: Arc<Repository>,
        directory: Arc<dyn ParticipantDirectory>,
        schedules: Arc<dyn RateScheduleSource>,
        deriver: CommissionDeriver,
        writer: LedgerWriter,
    ) -> Self {
        Self {
            repo,
            resolver: ChainResolver::new(directory.clone()),
            directory,
            schedules,
            deriver,
            writer,
        }
    }

    /// Accept, reject or recognise a duplicate of one purchase.
    ///
    /// Rejections are dead-lettered. Errors are returned only for store or
    /// directory failures; an event already logged when such a failure hits
    /// is completed by the next reconciliation.
    pub async fn submit(&self, raw: RawPurchase) -> Result<SubmitResult, LedgerError> {
        const OP: &str = "submit_purchase";

        let event = match PurchaseEvent::normalize(&raw) {
            Ok(event) => event,
            Err(reason) => return self.reject(&raw, reason).await,
        };
        let store = |e: sqlx::Error| LedgerError::store(OP, e).with_id(event.event_id.as_str());

        if self.repo.event_exists(&event.event_id).await.map_err(store)? {
            debug!(event_id = %event.event_id, "Duplicate purchase");
            return Ok(SubmitResult::Duplicate {
                event_id: event.event_id,
            });
        }

        let purchaser = match self
            .directory
            .get_participant(&event.purchaser_id)
            .await
            .map_err(|e| e.into_ledger(OP))?
        {
            Some(p) => p,
            None => {
                let reason = RejectReason::UnknownPurchaser(event.purchaser_id.to_string());
                return self.reject(&raw, reason).await;
            }
        };

        let Some(schedule) = self
            .schedules
            .schedule_at(event.occurred_at)
            .await
            .map_err(|e| e.into_ledger(OP))?
        else {
            let reason = RejectReason::NoScheduleInForce(event.occurred_at.as_ms());
            return self.reject(&raw, reason).await;
        };

        let resolved = self
            .resolver
            .resolve(&purchaser)
            .await
            .map_err(|e| e.into_ledger(OP))?;
        let derived = self
            .deriver
            .derive(&event, &resolved.links, &schedule)
            .map_err(|e| LedgerError::integrity(OP, e.to_string()).with_id(event.event_id.as_str()))?;

        let now = TimeMs::now();
        if !self
            .repo
            .insert_event_if_absent(&event, now)
            .await
            .map_err(store)?
        {
            return Ok(SubmitResult::Duplicate {
                event_id: event.event_id,
            });
        }

        let snapshot = ChainSnapshot::new(event.event_id.as_str(), resolved.links, now);
        let outcome = match self.writer.apply(&event, &snapshot, &derived).await {
            Ok(outcome) => outcome,
            Err(e) if e.kind == ErrorKind::Validation => {
                self.dead_letter_unapplied(&raw, &e).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        info!(
            event_id = %event.event_id,
            purchaser = %event.purchaser_id,
            depth = snapshot.len(),
            stop = ?resolved.stop,
            applied = outcome.applied_count(),
            "Accepted purchase"
        );

        Ok(SubmitResult::Accepted {
            event_id: event.event_id,
            chain: snapshot.links,
            outcome,
        })
    }

    async fn reject(
        &self,
        raw: &RawPurchase,
        reason: RejectReason,
    ) -> Result<SubmitResult, LedgerError> {
        warn!(event_id = %raw.event_id, reason = %reason, "Rejected purchase");
        self.dead_letter(raw, reason.to_string()).await?;
        Ok(SubmitResult::Rejected { reason })
    }

    /// The event is logged but its entries could not be written.
    async fn dead_letter_unapplied(
        &self,
        raw: &RawPurchase,
        err: &LedgerError,
    ) -> Result<(), LedgerError> {
        error!(event_id = %raw.event_id, error = %err, "Logged purchase cannot be applied");
        self.dead_letter(raw, err.message.clone()).await
    }

    async fn dead_letter(&self, raw: &RawPurchase, reason: String) -> Result<(), LedgerError> {
        let event_id = Some(raw.event_id.trim().to_string()).filter(|id| !id.is_empty());
        let letter = DeadLetter {
            id: uuid::Uuid::new_v4().to_string(),
            event_id,
            kind: DeadLetterKind::Validation,
            reason,
            payload: serde_json::to_value(raw).unwrap_or_default(),
            created_at: TimeMs::now(),
        };
        self.repo
            .insert_dead_letter(&letter)
            .await
            .map_err(|e| LedgerError::store("dead_letter", e))
    }
}

struct IntakeJob {
    raw: RawPurchase,
    reply: oneshot::Sender<Result<SubmitResult, LedgerError>>,
}

/// Bounded queue in front of a fixed pool of intake workers.
#[derive(Debug, Clone)]
pub struct IntakeQueue {
    tx: mpsc::Sender<IntakeJob>,
    reply_deadline: Duration,
}

impl std::fmt::Debug for IntakeJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntakeJob").field("raw", &self.raw).finish()
    }
}

impl IntakeQueue {
    /// Spawn `workers` tasks draining a queue of `capacity` jobs. Callers
    /// wait up to `reply_deadline` for each result.
    pub fn start(
        service: Arc<IntakeService>,
        capacity: usize,
        workers: usize,
        reply_deadline: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<IntakeJob>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for worker_id in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                intake_worker(worker_id, service, rx).await;
            });
        }

        info!(capacity, workers, "Intake queue started");
        Self { tx, reply_deadline }
    }

    /// Enqueue without waiting for room and wait for the result.
    ///
    /// A full queue fails immediately with a retryable error. No answer
    /// within the reply deadline is a `Cancelled` error; the job may still
    /// complete, and resubmitting it is safe.
    pub async fn try_submit(&self, raw: RawPurchase) -> Result<SubmitResult, LedgerError> {
        const OP: &str = "submit_purchase";
        let (reply, rx) = oneshot::channel();

        self.tx
            .try_send(IntakeJob { raw, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(job) => {
                    LedgerError::transient(OP, "intake queue is full").with_id(job.raw.event_id)
                }
                mpsc::error::TrySendError::Closed(_) => {
                    LedgerError::transient(OP, "intake queue is closed")
                }
            })?;

        match tokio::time::timeout(self.reply_deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LedgerError::transient(OP, "intake worker dropped the job")),
            Err(_) => Err(LedgerError::cancelled(
                OP,
                format!("no result within {}ms", self.reply_deadline.as_millis()),
            )),
        }
    }
}

async fn intake_worker(
    worker_id: usize,
    service: Arc<IntakeService>,
    rx: Arc<Mutex<mpsc::Receiver<IntakeJob>>>,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            match rx.recv().await {
                Some(job) => job,
                None => {
                    debug!(worker_id, "Intake worker shutting down (channel closed)");
                    return;
                }
            }
        };

        let IntakeJob { raw, reply } = job;
        let event_id = raw.event_id.clone();
        let task = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.submit(raw).await })
        };
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(
                LedgerError::integrity("submit_purchase", format!("intake job aborted: {}", e))
                    .with_id(event_id.as_str()),
            ),
        };
        if let Err(e) = &result {
            error!(worker_id, event_id = %event_id, error = %e, "Intake failed");
        }
        // Caller may have gone away.
        let _ = reply.send(result);
    }
}
