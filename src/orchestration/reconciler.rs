//! Out-of-band recompute and repair of entries and aggregates.
//!
//! A run walks its scope in three phases: insert entries missing for logged
//! events, quarantine duplicate entries and rebuild drifted aggregates, then
//! flag participants whose referrer handle no longer resolves. Every run is
//! journaled with what it found and what it changed.

use super::locks::AggregateKey;
use super::writer::LedgerWriter;
use crate::datasource::{ParticipantDirectory, RateScheduleSource};
use crate::db::Repository;
use crate::domain::{
    Action, ApplyOutcome, ChainSnapshot, CommissionEntry, Currency, Decimal, EntryKey,
    EntryStatus, Finding, Participant, ParticipantFlag, ParticipantId, ReconcileScope,
    ReconcilerRun, RunStatus, TimeMs,
};
use crate::engine::{rebuild, split_duplicates, validate_handle, ChainResolver, CommissionDeriver};
use crate::error::{ErrorKind, LedgerError};
use crate::notify::{deliver, LedgerNotification, NotificationSink};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct Report {
    findings: Vec<Finding>,
    actions: Vec<Action>,
}

/// What one aggregate repair found and changed.
#[derive(Debug, Default)]
struct PairRepair {
    findings: Vec<Finding>,
    actions: Vec<Action>,
    quarantined: Vec<CommissionEntry>,
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    repo: Arc<Repository>,
    directory: Arc<dyn ParticipantDirectory>,
    schedules: Arc<dyn RateScheduleSource>,
    resolver: ChainResolver,
    deriver: CommissionDeriver,
    writer: LedgerWriter,
    sink: Arc<dyn NotificationSink>,
}

impl Reconciler {
    pub fn new(
        repo: Arc<Repository>,
        directory: Arc<dyn ParticipantDirectory>,
        schedules: Arc<dyn RateScheduleSource>,
        deriver: CommissionDeriver,
        writer: LedgerWriter,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            repo,
            resolver: ChainResolver::new(directory.clone()),
            directory,
            schedules,
            deriver,
            writer,
            sink,
        }
    }

    /// Reconcile `scope`, stopping early once `cancel` reads true.
    ///
    /// Cancellation is checked between events, beneficiaries and
    /// participants; work already committed stays committed and the run is
    /// journaled as cancelled.
    pub async fn run(
        &self,
        scope: ReconcileScope,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ReconcilerRun, LedgerError> {
        const OP: &str = "reconcile";
        let store = |e: sqlx::Error| LedgerError::store(OP, e);

        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = TimeMs::now();
        let mut report = Report::default();
        let mut status = RunStatus::Completed;

        info!(%run_id, %scope, "Reconciliation started");

        let event_ids = self.repo.event_ids_in_scope(&scope).await.map_err(store)?;
        for event_id in &event_ids {
            if *cancel.borrow() {
                status = RunStatus::Cancelled;
                break;
            }
            self.sweep_event(event_id, &scope, &mut report).await?;
        }

        if status == RunStatus::Completed {
            let beneficiaries = self.repo.beneficiaries_in_scope(&scope).await.map_err(store)?;
            for beneficiary in &beneficiaries {
                if *cancel.borrow() {
                    status = RunStatus::Cancelled;
                    break;
                }
                self.repair_beneficiary(beneficiary, &run_id, &mut report)
                    .await?;
            }
        }

        if status == RunStatus::Completed {
            status = self
                .repair_chains(&scope, &run_id, cancel, &mut report)
                .await?;
        }

        let run = ReconcilerRun {
            run_id,
            scope,
            status,
            started_at,
            finished_at: TimeMs::now(),
            issues_found: report.findings,
            actions_taken: report.actions,
        };
        self.repo.insert_reconciler_run(&run).await.map_err(store)?;

        info!(
            run_id = %run.run_id,
            status = run.status.as_str(),
            issues = run.issues_found.len(),
            actions = run.actions_taken.len(),
            "Reconciliation finished"
        );
        deliver(
            self.sink.as_ref(),
            &LedgerNotification::ReconciliationCompleted {
                run_id: run.run_id.clone(),
                scope: run.scope.clone(),
                status: run.status,
                issues: run.issues_found.len(),
                actions: run.actions_taken.len(),
            },
        )
        .await;

        Ok(run)
    }

    // =========================================================================
    // Missing sweep
    // =========================================================================

    async fn sweep_event(
        &self,
        event_id: &str,
        scope: &ReconcileScope,
        report: &mut Report,
    ) -> Result<(), LedgerError> {
        const OP: &str = "reconcile_missing";
        let store = |e: sqlx::Error| LedgerError::store(OP, e).with_id(event_id);

        let Some(stored) = self.repo.get_event(event_id).await.map_err(store)? else {
            return Ok(());
        };
        if stored.is_rolled_back() {
            return Ok(());
        }
        let event = stored.event;

        let (snapshot, fresh) = match self.repo.get_chain_snapshot(event_id).await.map_err(store)? {
            Some(snapshot) => (snapshot, false),
            None => {
                let Some(purchaser) = self
                    .directory
                    .get_participant(&event.purchaser_id)
                    .await
                    .map_err(|e| e.into_ledger(OP))?
                else {
                    warn!(event_id, purchaser = %event.purchaser_id, "Purchaser vanished; cannot resolve chain");
                    return Ok(());
                };
                let resolved = self
                    .resolver
                    .resolve(&purchaser)
                    .await
                    .map_err(|e| e.into_ledger(OP))?;
                (ChainSnapshot::new(event_id, resolved.links, TimeMs::now()), true)
            }
        };

        let Some(schedule) = self
            .schedules
            .schedule_at(event.occurred_at)
            .await
            .map_err(|e| e.into_ledger(OP))?
        else {
            warn!(event_id, occurred_at = %event.occurred_at, "No rate schedule in force");
            return Ok(());
        };

        let mut derived = self
            .deriver
            .derive(&event, &snapshot.links, &schedule)
            .map_err(|e| LedgerError::integrity(OP, e.to_string()).with_id(event_id))?;
        if let ReconcileScope::Beneficiary(b) = scope {
            derived.retain(|d| &d.beneficiary_id == b);
        }

        let existing = self.repo.entries_for_event(event_id).await.map_err(store)?;
        let tolerance = Decimal::unit(event.currency.scale());

        let mut missing = Vec::new();
        for d in derived {
            let key = d.key();
            let same_key: Vec<&CommissionEntry> =
                existing.iter().filter(|e| e.key() == key).collect();
            if same_key.iter().any(|e| e.status == EntryStatus::RolledBack) {
                continue;
            }

            let active: Vec<&&CommissionEntry> = same_key.iter().filter(|e| e.is_active()).collect();
            if active.is_empty() {
                report.findings.push(Finding::MissingEntry {
                    key,
                    amount: d.amount,
                });
                missing.push(d);
                continue;
            }

            for e in active {
                if e.amount.differs_by_more_than(d.amount, tolerance) {
                    report.findings.push(Finding::AmountConflict {
                        entry_id: e.entry_id.clone(),
                        key: key.clone(),
                        expected: d.amount,
                        actual: e.amount,
                    });
                }
            }
        }

        if missing.is_empty() && !fresh {
            return Ok(());
        }

        let keys: HashMap<String, EntryKey> = missing
            .iter()
            .map(|d| (d.key().entry_id(), d.key()))
            .collect();
        let outcome = match self.writer.apply(&event, &snapshot, &missing).await {
            Ok(outcome) => outcome,
            // Aggregate overflow: nothing was applied.
            Err(e) if e.kind == ErrorKind::Validation => {
                warn!(event_id, error = %e, "Missing entries cannot be applied");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match outcome {
            ApplyOutcome::Applied { entry_ids, .. } => {
                for entry_id in entry_ids {
                    if let Some(key) = keys.get(&entry_id) {
                        report.actions.push(Action::InsertedEntry {
                            entry_id,
                            key: key.clone(),
                        });
                    }
                }
            }
            ApplyOutcome::Noop => {}
            ApplyOutcome::Conflict(detail) => {
                report.findings.push(Finding::AmountConflict {
                    entry_id: detail.entry_id,
                    key: detail.key,
                    expected: detail.derived,
                    actual: detail.stored,
                });
            }
        }
        Ok(())
    }

    // =========================================================================
    // Duplicate quarantine and aggregate rebuild
    // =========================================================================

    async fn repair_beneficiary(
        &self,
        beneficiary: &ParticipantId,
        run_id: &str,
        report: &mut Report,
    ) -> Result<(), LedgerError> {
        const OP: &str = "reconcile_aggregate";
        let currencies = self
            .repo
            .currencies_for_beneficiary(beneficiary)
            .await
            .map_err(|e| LedgerError::store(OP, e).with_id(beneficiary.as_str()))?;

        for currency in currencies {
            let keys: BTreeSet<AggregateKey> = [(beneficiary.clone(), currency)].into();
            let repaired = match self
                .writer
                .locked(OP, &keys, || self.repair_pair(beneficiary, currency))
                .await
            {
                Ok(repaired) => repaired,
                Err(e) if e.kind == ErrorKind::Validation => {
                    warn!(beneficiary = %beneficiary, %currency, error = %e, "Aggregate cannot be rebuilt");
                    continue;
                }
                Err(e) => return Err(e),
            };

            for entry in &repaired.quarantined {
                deliver(
                    self.sink.as_ref(),
                    &LedgerNotification::EntryQuarantined {
                        entry_id: entry.entry_id.clone(),
                        event_id: entry.event_id.clone(),
                        beneficiary_id: entry.beneficiary_id.clone(),
                        run_id: run_id.to_string(),
                    },
                )
                .await;
            }
            report.findings.extend(repaired.findings);
            report.actions.extend(repaired.actions);
        }
        Ok(())
    }

    /// Must run under the lock of `(beneficiary, currency)`.
    async fn repair_pair(
        &self,
        beneficiary: &ParticipantId,
        currency: Currency,
    ) -> Result<PairRepair, LedgerError> {
        const OP: &str = "reconcile_aggregate";
        let store = |e: sqlx::Error| LedgerError::store(OP, e).with_id(beneficiary.as_str());

        let entries = self
            .repo
            .active_entries_for(beneficiary, currency)
            .await
            .map_err(store)?;
        let stored = self
            .repo
            .get_aggregate(beneficiary, currency)
            .await
            .map_err(store)?;
        let stored_seen = self
            .repo
            .seen_index(beneficiary, currency)
            .await
            .map_err(store)?;

        let split = split_duplicates(entries);
        let (mut rebuilt, seen) = rebuild(beneficiary, currency, &split.kept).map_err(|e| {
            LedgerError::validation(OP, e.to_string()).with_id(beneficiary.as_str())
        })?;
        let drifted = !rebuilt.same_balances(&stored);

        if !drifted && seen == stored_seen && split.duplicates.is_empty() {
            return Ok(PairRepair::default());
        }

        let mut repair = PairRepair::default();
        for (key, dups) in &split.duplicates {
            let mut entry_ids: Vec<String> = split
                .kept
                .iter()
                .filter(|e| &e.key() == key)
                .map(|e| e.entry_id.clone())
                .collect();
            entry_ids.extend(dups.iter().map(|e| e.entry_id.clone()));
            repair.findings.push(Finding::DuplicateGroup {
                key: key.clone(),
                entry_ids,
            });
            for dup in dups {
                repair.actions.push(Action::MarkedDuplicate {
                    entry_id: dup.entry_id.clone(),
                    key: key.clone(),
                });
            }
        }
        if drifted {
            repair.findings.push(Finding::AggregateDrift {
                beneficiary_id: beneficiary.clone(),
                currency,
                stored_total: stored.total_earnings,
                computed_total: rebuilt.total_earnings,
            });
        }

        let now = TimeMs::now();
        rebuilt.version = stored.version + 1;
        rebuilt.updated_at = Some(now);
        let duplicate_ids: Vec<String> = split
            .duplicates
            .values()
            .flatten()
            .map(|e| e.entry_id.clone())
            .collect();

        self.repo
            .repair_aggregate(&rebuilt, stored.version, &duplicate_ids, &seen, now)
            .await?;

        info!(
            beneficiary = %beneficiary,
            %currency,
            duplicates = duplicate_ids.len(),
            drifted,
            version = rebuilt.version,
            "Rebuilt aggregate"
        );
        repair.actions.push(Action::RebuiltAggregate {
            beneficiary_id: beneficiary.clone(),
            currency,
            version: rebuilt.version,
        });
        repair.quarantined = split.duplicates.into_values().flatten().collect();
        Ok(repair)
    }

    // =========================================================================
    // Chain repair
    // =========================================================================

    async fn repair_chains(
        &self,
        scope: &ReconcileScope,
        run_id: &str,
        cancel: &watch::Receiver<bool>,
        report: &mut Report,
    ) -> Result<RunStatus, LedgerError> {
        const OP: &str = "reconcile_chains";
        let lookup = |e: crate::datasource::DataSourceError| e.into_ledger(OP);

        let participants: Vec<Participant> = match scope {
            ReconcileScope::All => self
                .directory
                .list_participants_with_referrer()
                .await
                .map_err(lookup)?,
            ReconcileScope::Beneficiary(id) => {
                self.directory.get_participant(id).await.map_err(lookup)?.into_iter().collect()
            }
            ReconcileScope::Event(event_id) => {
                match self
                    .repo
                    .get_event(event_id)
                    .await
                    .map_err(|e| LedgerError::store(OP, e).with_id(event_id.as_str()))?
                {
                    Some(stored) => self
                        .directory
                        .get_participant(&stored.event.purchaser_id)
                        .await
                        .map_err(lookup)?
                        .into_iter()
                        .collect(),
                    None => Vec::new(),
                }
            }
        };

        for participant in participants {
            if *cancel.borrow() {
                return Ok(RunStatus::Cancelled);
            }
            let Some(handle) = participant.referrer_handle.as_deref() else {
                continue;
            };

            let reason = match validate_handle(handle) {
                Err(e) => Some(e.to_string()),
                Ok(trimmed) => match self
                    .directory
                    .get_participant_by_handle(trimmed)
                    .await
                    .map_err(lookup)?
                {
                    Some(_) => None,
                    None => Some("referrer handle does not resolve".to_string()),
                },
            };
            let Some(reason) = reason else {
                continue;
            };

            debug!(participant = %participant.id, handle, %reason, "Unresolvable referrer");
            report.findings.push(Finding::UnresolvableReferrer {
                participant_id: participant.id.clone(),
                referrer_handle: handle.to_string(),
                reason: reason.clone(),
            });

            let flag = ParticipantFlag {
                participant_id: participant.id.clone(),
                referrer_handle: handle.to_string(),
                reason,
                flagged_at: TimeMs::now(),
                run_id: run_id.to_string(),
            };
            if self
                .repo
                .flag_participant(&flag)
                .await
                .map_err(|e| LedgerError::store(OP, e).with_id(participant.id.as_str()))?
            {
                report.actions.push(Action::FlaggedParticipant {
                    participant_id: participant.id,
                });
            }
        }

        Ok(RunStatus::Completed)
    }

    /// Reconcile everything every `interval` until `cancel` turns true or its
    /// sender is dropped. The first pass runs one interval after start.
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            info!("Periodic reconciler stopped");
                            return;
                        }
                        continue;
                    }
                }

                match self.run(ReconcileScope::All, &cancel).await {
                    Ok(run) if !run.is_noop() => {
                        info!(run_id = %run.run_id, actions = run.actions_taken.len(), "Periodic reconciliation repaired state");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Periodic reconciliation failed"),
                }
            }
        })
    }
}
