//! Reconciler reads and repairs, run journal and participant flags.

use super::entries::store_aggregate;
use super::{currency_column, decode_err, Repository};
use crate::domain::{
    BeneficiaryAggregate, Currency, Generation, ParticipantFlag, ParticipantId, ReconcileScope,
    ReconcilerRun, RunStatus, TimeMs,
};
use crate::error::LedgerError;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeMap;

/// Active-entry refcount per (generation, referred participant) of one aggregate.
pub type SeenIndex = BTreeMap<(Generation, ParticipantId), i64>;

impl Repository {
    // =========================================================================
    // Scope expansion
    // =========================================================================

    /// Event ids covered by a reconciliation scope, in acceptance order.
    pub async fn event_ids_in_scope(
        &self,
        scope: &ReconcileScope,
    ) -> Result<Vec<String>, sqlx::Error> {
        let rows = match scope {
            ReconcileScope::All => {
                sqlx::query("SELECT event_id FROM events ORDER BY accepted_at_ms ASC, event_id ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
            ReconcileScope::Beneficiary(id) => {
                sqlx::query(
                    r#"
                    SELECT e.event_id FROM events e
                    WHERE e.event_id IN (
                        SELECT event_id FROM chain_snapshots WHERE beneficiary_id = ?
                        UNION
                        SELECT event_id FROM commission_entries WHERE beneficiary_id = ?
                    )
                    ORDER BY e.accepted_at_ms ASC, e.event_id ASC
                    "#,
                )
                .bind(id.as_str())
                .bind(id.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            ReconcileScope::Event(event_id) => {
                sqlx::query("SELECT event_id FROM events WHERE event_id = ?")
                    .bind(event_id.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows.iter().map(|row| row.get("event_id")).collect())
    }

    /// Beneficiaries whose aggregates a scope covers, sorted.
    pub async fn beneficiaries_in_scope(
        &self,
        scope: &ReconcileScope,
    ) -> Result<Vec<ParticipantId>, sqlx::Error> {
        let rows = match scope {
            ReconcileScope::All => {
                sqlx::query(
                    r#"
                    SELECT beneficiary_id FROM commission_entries
                    UNION
                    SELECT beneficiary_id FROM beneficiary_aggregates
                    UNION
                    SELECT beneficiary_id FROM chain_snapshots
                    ORDER BY beneficiary_id ASC
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
            ReconcileScope::Beneficiary(id) => return Ok(vec![id.clone()]),
            ReconcileScope::Event(event_id) => {
                sqlx::query(
                    r#"
                    SELECT beneficiary_id FROM commission_entries WHERE event_id = ?
                    UNION
                    SELECT beneficiary_id FROM chain_snapshots WHERE event_id = ?
                    ORDER BY beneficiary_id ASC
                    "#,
                )
                .bind(event_id.as_str())
                .bind(event_id.as_str())
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows
            .iter()
            .map(|row| ParticipantId::new(row.get::<String, _>("beneficiary_id")))
            .collect())
    }

    /// Currencies in which a beneficiary has entries or a stored aggregate.
    pub async fn currencies_for_beneficiary(
        &self,
        beneficiary: &ParticipantId,
    ) -> Result<Vec<Currency>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT currency FROM commission_entries WHERE beneficiary_id = ?
            UNION
            SELECT currency FROM beneficiary_aggregates WHERE beneficiary_id = ?
            UNION
            SELECT currency FROM seen_referreds WHERE beneficiary_id = ?
            ORDER BY currency ASC
            "#,
        )
        .bind(beneficiary.as_str())
        .bind(beneficiary.as_str())
        .bind(beneficiary.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| currency_column(row, "currency")).collect()
    }

    pub async fn seen_index(
        &self,
        beneficiary: &ParticipantId,
        currency: Currency,
    ) -> Result<SeenIndex, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT generation, referred_id, active_entries
            FROM seen_referreds
            WHERE beneficiary_id = ? AND currency = ?
            "#,
        )
        .bind(beneficiary.as_str())
        .bind(currency.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let generation =
                    Generation::try_from(row.get::<i64, _>("generation")).map_err(decode_err)?;
                let referred = ParticipantId::new(row.get::<String, _>("referred_id"));
                Ok(((generation, referred), row.get::<i64, _>("active_entries")))
            })
            .collect()
    }

    // =========================================================================
    // Repairs
    // =========================================================================

    /// Quarantine duplicate entries and overwrite one aggregate and its seen
    /// index with values rebuilt from the surviving active entries.
    ///
    /// `rebuilt.version` must be `expected_version + 1`; a stored version other
    /// than `expected_version` aborts with a transient error.
    pub async fn repair_aggregate(
        &self,
        rebuilt: &BeneficiaryAggregate,
        expected_version: i64,
        duplicate_entry_ids: &[String],
        seen: &SeenIndex,
        now: TimeMs,
    ) -> Result<(), LedgerError> {
        const OP: &str = "repair_aggregate";
        let beneficiary = rebuilt.beneficiary_id.as_str();
        let store = |e: sqlx::Error| LedgerError::store(OP, e).with_id(beneficiary);

        let mut tx = self.pool.begin().await.map_err(store)?;

        if !store_aggregate(&mut tx, rebuilt, expected_version)
            .await
            .map_err(store)?
        {
            return Err(LedgerError::transient(OP, "aggregate version moved").with_id(beneficiary));
        }

        for entry_id in duplicate_entry_ids {
            let result = sqlx::query(
                r#"
                UPDATE commission_entries
                SET status = 'duplicate', status_changed_at_ms = ?, status_reason = 'reconciler'
                WHERE entry_id = ? AND status = 'active'
                "#,
            )
            .bind(now.as_ms())
            .bind(entry_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(store)?;
            if result.rows_affected() == 0 {
                return Err(LedgerError::transient(OP, "entry left active state during repair")
                    .with_id(entry_id.as_str()));
            }
        }

        sqlx::query("DELETE FROM seen_referreds WHERE beneficiary_id = ? AND currency = ?")
            .bind(beneficiary)
            .bind(rebuilt.currency.as_str())
            .execute(&mut *tx)
            .await
            .map_err(store)?;

        for ((generation, referred), active_entries) in seen {
            sqlx::query(
                r#"
                INSERT INTO seen_referreds (beneficiary_id, currency, generation, referred_id, active_entries)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(beneficiary)
            .bind(rebuilt.currency.as_str())
            .bind(i64::from(generation.get()))
            .bind(referred.as_str())
            .bind(*active_entries)
            .execute(&mut *tx)
            .await
            .map_err(store)?;
        }

        tx.commit().await.map_err(store)?;
        Ok(())
    }

    // =========================================================================
    // Run journal
    // =========================================================================

    pub async fn insert_reconciler_run(&self, run: &ReconcilerRun) -> Result<(), sqlx::Error> {
        let encode = |e: serde_json::Error| sqlx::Error::Protocol(e.to_string());

        sqlx::query(
            r#"
            INSERT INTO reconciler_runs (run_id, scope, status, started_at_ms, finished_at_ms, findings, actions)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.run_id.as_str())
        .bind(serde_json::to_string(&run.scope).map_err(encode)?)
        .bind(run.status.as_str())
        .bind(run.started_at.as_ms())
        .bind(run.finished_at.as_ms())
        .bind(serde_json::to_string(&run.issues_found).map_err(encode)?)
        .bind(serde_json::to_string(&run.actions_taken).map_err(encode)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_reconciler_run(
        &self,
        run_id: &str,
    ) -> Result<Option<ReconcilerRun>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT run_id, scope, status, started_at_ms, finished_at_ms, findings, actions
            FROM reconciler_runs
            WHERE run_id = ?
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    /// Most recent runs first.
    pub async fn list_reconciler_runs(&self, limit: i64) -> Result<Vec<ReconcilerRun>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, scope, status, started_at_ms, finished_at_ms, findings, actions
            FROM reconciler_runs
            ORDER BY started_at_ms DESC, run_id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(run_from_row).collect()
    }

    // =========================================================================
    // Participant flags
    // =========================================================================

    /// Record a flag once; returns false if the participant is already flagged.
    pub async fn flag_participant(&self, flag: &ParticipantFlag) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO participant_flags (participant_id, referrer_handle, reason, flagged_at_ms, run_id)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(participant_id) DO NOTHING
            "#,
        )
        .bind(flag.participant_id.as_str())
        .bind(flag.referrer_handle.as_str())
        .bind(flag.reason.as_str())
        .bind(flag.flagged_at.as_ms())
        .bind(flag.run_id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_participant_flags(&self) -> Result<Vec<ParticipantFlag>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT participant_id, referrer_handle, reason, flagged_at_ms, run_id
            FROM participant_flags
            ORDER BY participant_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ParticipantFlag {
                participant_id: ParticipantId::new(row.get::<String, _>("participant_id")),
                referrer_handle: row.get("referrer_handle"),
                reason: row.get("reason"),
                flagged_at: TimeMs::new(row.get("flagged_at_ms")),
                run_id: row.get("run_id"),
            })
            .collect())
    }
}

fn run_from_row(row: &SqliteRow) -> Result<ReconcilerRun, sqlx::Error> {
    let json_err = |e: serde_json::Error| decode_err(e.to_string());

    let scope: String = row.get("scope");
    let findings: String = row.get("findings");
    let actions: String = row.get("actions");
    let status = match row.get::<String, _>("status").as_str() {
        "cancelled" => RunStatus::Cancelled,
        _ => RunStatus::Completed,
    };

    Ok(ReconcilerRun {
        run_id: row.get("run_id"),
        scope: serde_json::from_str(&scope).map_err(json_err)?,
        status,
        started_at: TimeMs::new(row.get("started_at_ms")),
        finished_at: TimeMs::new(row.get("finished_at_ms")),
        issues_found: serde_json::from_str(&findings).map_err(json_err)?,
        actions_taken: serde_json::from_str(&actions).map_err(json_err)?,
    })
}
