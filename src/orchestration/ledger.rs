use super::intake::{IntakeQueue, IntakeService};
use super::locks::AggregateLocks;
use super::reconciler::Reconciler;
use super::writer::LedgerWriter;
use crate::config::Config;
use crate::datasource::{parse_purchases, ParticipantDirectory, RateScheduleSource};
use crate::db::{EntryFilter, Page, Repository};
use crate::domain::{
    BeneficiaryAggregate, CommissionEntry, Currency, ParticipantId, RawPurchase, ReconcileScope,
    ReconcilerRun, RollbackOutcome, SubmitResult,
};
use crate::engine::CommissionDeriver;
use crate::error::LedgerError;
use crate::notify::NotificationSink;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Counts from one backfill import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub accepted: usize,
    pub duplicate: usize,
    pub rejected: usize,
    pub failed: usize,
}

/// Entry point for every inbound ledger operation.
///
/// Owns the intake queue, the writer and the reconciler, all sharing one
/// aggregate lock table.
#[derive(Debug)]
pub struct Ledger {
    repo: Arc<Repository>,
    intake: Arc<IntakeService>,
    queue: IntakeQueue,
    writer: LedgerWriter,
    reconciler: Arc<Reconciler>,
    reconciler_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Ledger {
    /// Wire the ledger and start the intake workers. Must be called inside a
    /// tokio runtime.
    pub fn new(
        repo: Arc<Repository>,
        directory: Arc<dyn ParticipantDirectory>,
        schedules: Arc<dyn RateScheduleSource>,
        sink: Arc<dyn NotificationSink>,
        config: &Config,
    ) -> Self {
        let locks = Arc::new(AggregateLocks::new());
        let deriver = CommissionDeriver::new(config.rounding_mode);
        let writer = LedgerWriter::new(repo.clone(), locks, sink.clone(), config);

        let intake = Arc::new(IntakeService::new(
            repo.clone(),
            directory.clone(),
            schedules.clone(),
            deriver,
            writer.clone(),
        ));
        let queue = IntakeQueue::start(
            intake.clone(),
            config.intake_queue_capacity,
            config.intake_workers,
            config.intake_reply_deadline,
        );
        let reconciler = Arc::new(Reconciler::new(
            repo.clone(),
            directory,
            schedules,
            deriver,
            writer.clone(),
            sink,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            repo,
            intake,
            queue,
            writer,
            reconciler,
            reconciler_interval: config.reconciler_interval,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn repo(&self) -> &Arc<Repository> {
        &self.repo
    }

    /// Submit through the bounded intake queue.
    pub async fn submit_purchase(&self, raw: RawPurchase) -> Result<SubmitResult, LedgerError> {
        self.queue.try_submit(raw).await
    }

    /// Submit on the caller's task, bypassing the queue.
    pub async fn submit_direct(&self, raw: RawPurchase) -> Result<SubmitResult, LedgerError> {
        self.intake.submit(raw).await
    }

    /// Latest committed aggregate; zeroed at version 0 when none exists.
    pub async fn query_aggregate(
        &self,
        beneficiary: &ParticipantId,
        currency: Currency,
    ) -> Result<BeneficiaryAggregate, LedgerError> {
        self.repo
            .get_aggregate(beneficiary, currency)
            .await
            .map_err(|e| LedgerError::store("query_aggregate", e).with_id(beneficiary.as_str()))
    }

    pub async fn list_entries(
        &self,
        filter: &EntryFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Page<CommissionEntry>, LedgerError> {
        if let (Some(since), Some(until)) = (filter.since, filter.until) {
            if since > until {
                return Err(LedgerError::validation("list_entries", "since must be <= until"));
            }
        }
        self.repo
            .list_entries(filter, page, page_size)
            .await
            .map_err(|e| {
                LedgerError::store("list_entries", e).with_id(filter.beneficiary_id.as_str())
            })
    }

    pub async fn rollback_event(
        &self,
        event_id: &str,
        reason: &str,
    ) -> Result<RollbackOutcome, LedgerError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(
                LedgerError::validation("rollback_event", "reason is required").with_id(event_id)
            );
        }
        self.writer.rollback(event_id, reason).await
    }

    /// Reconcile `scope` now. Stops early if the ledger is shutting down.
    pub async fn run_reconciliation(
        &self,
        scope: ReconcileScope,
    ) -> Result<ReconcilerRun, LedgerError> {
        self.reconciler.run(scope, &self.shutdown_rx).await
    }

    /// Start the periodic reconciler; it stops on `shutdown`.
    pub fn spawn_reconciler(&self) -> JoinHandle<()> {
        info!(
            interval_ms = self.reconciler_interval.as_millis() as u64,
            "Starting periodic reconciler"
        );
        self.reconciler
            .clone()
            .spawn_periodic(self.reconciler_interval, self.shutdown_rx.clone())
    }

    /// Drop a participant's referrer handle. Later purchases resolve the
    /// chain without it; existing snapshots are untouched.
    pub async fn clear_referrer(&self, participant: &ParticipantId) -> Result<(), LedgerError> {
        const OP: &str = "clear_referrer";
        let cleared = self
            .repo
            .clear_referrer(participant)
            .await
            .map_err(|e| LedgerError::store(OP, e).with_id(participant.as_str()))?;
        if !cleared {
            return Err(
                LedgerError::not_found(OP, "no such participant").with_id(participant.as_str())
            );
        }
        info!(participant = %participant, "Cleared referrer");
        Ok(())
    }

    /// Backfill the event log from an exported CSV (optionally LZ4) batch.
    ///
    /// Rows are submitted one by one on the caller's task; a failed row is
    /// counted and the import carries on.
    pub async fn import_purchases(&self, bytes: &[u8]) -> Result<ImportSummary, LedgerError> {
        let rows = parse_purchases(bytes)
            .map_err(|e| LedgerError::validation("import_purchases", e.to_string()))?;

        let mut summary = ImportSummary::default();
        for raw in rows {
            let event_id = raw.event_id.clone();
            match self.intake.submit(raw).await {
                Ok(SubmitResult::Accepted { .. }) => summary.accepted += 1,
                Ok(SubmitResult::Duplicate { .. }) => summary.duplicate += 1,
                Ok(SubmitResult::Rejected { .. }) => summary.rejected += 1,
                Err(e) => {
                    warn!(event_id, error = %e, "Import row failed");
                    summary.failed += 1;
                }
            }
        }

        info!(
            accepted = summary.accepted,
            duplicate = summary.duplicate,
            rejected = summary.rejected,
            failed = summary.failed,
            "Import finished"
        );
        Ok(summary)
    }

    /// Signal in-flight reconciliations and the periodic task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
