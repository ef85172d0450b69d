//! Entry writes, rollbacks, aggregate maintenance and entry queries.
//!
//! Every write transaction here starts with a write statement so SQLite takes
//! the write lock up front instead of upgrading a read lock mid-transaction.

use super::{currency_column, decimal_column, decode_err, Repository};
use crate::domain::{
    AggregateDelta, BeneficiaryAggregate, ChainLink, ChainSnapshot, CommissionEntry,
    ConflictDetail, Currency, Decimal, DerivedEntry, EntryKey, EntryStatus, Generation,
    GenerationTotals, ParticipantId, PurchaseEvent, TimeMs,
};
use crate::error::LedgerError;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;

pub const MAX_PAGE_SIZE: u32 = 500;

/// Result of the per-event apply transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyTx {
    Applied {
        entries: Vec<CommissionEntry>,
        aggregates: Vec<BeneficiaryAggregate>,
    },
    Noop,
    Conflict(ConflictDetail),
    EventRolledBack,
}

/// Result of the per-event rollback transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackTx {
    RolledBack {
        entries: Vec<CommissionEntry>,
        aggregates: Vec<BeneficiaryAggregate>,
    },
    AlreadyRolledBack,
}

/// Filter for entry listings. Bounds are on `createdAt`: `since` inclusive,
/// `until` exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryFilter {
    pub beneficiary_id: ParticipantId,
    pub since: Option<TimeMs>,
    pub until: Option<TimeMs>,
    pub generation: Option<Generation>,
    pub status: Option<EntryStatus>,
}

impl EntryFilter {
    pub fn for_beneficiary(beneficiary_id: ParticipantId) -> Self {
        Self {
            beneficiary_id,
            since: None,
            until: None,
            generation: None,
            status: None,
        }
    }
}

/// One page of a listing. `page` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: i64,
}

#[derive(Debug, Default)]
struct KeyState {
    active: Vec<(String, Decimal)>,
    rolled_back: bool,
}

impl Repository {
    // =========================================================================
    // Writer transactions
    // =========================================================================

    /// Insert the missing `derived` entries of one event together with its
    /// chain snapshot and the resulting aggregate deltas, atomically.
    ///
    /// Keys already holding an active entry within one currency unit are
    /// skipped; a larger disagreement aborts the whole transaction with
    /// `Conflict`. Keys that were rolled back are never reinserted.
    pub async fn apply_event_entries(
        &self,
        event: &PurchaseEvent,
        chain: &ChainSnapshot,
        derived: &[DerivedEntry],
        now: TimeMs,
    ) -> Result<ApplyTx, LedgerError> {
        const OP: &str = "apply_event";
        let store = |e: sqlx::Error| LedgerError::store(OP, e).with_id(event.event_id.as_str());

        let mut tx = self.pool.begin().await.map_err(store)?;

        match touch_event(&mut tx, &event.event_id).await.map_err(store)? {
            None => {
                return Err(LedgerError::integrity(OP, "event is not in the log")
                    .with_id(event.event_id.as_str()))
            }
            Some(Some(_)) => return Ok(ApplyTx::EventRolledBack),
            Some(None) => {}
        }

        sqlx::query(
            "UPDATE events SET chain_captured_at_ms = ? WHERE event_id = ? AND chain_captured_at_ms IS NULL",
        )
        .bind(chain.captured_at.as_ms())
        .bind(event.event_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(store)?;

        for link in &chain.links {
            sqlx::query(
                r#"
                INSERT INTO chain_snapshots (event_id, generation, beneficiary_id, suppressed, captured_at_ms)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(event_id, generation) DO NOTHING
                "#,
            )
            .bind(chain.event_id.as_str())
            .bind(i64::from(link.generation.get()))
            .bind(link.beneficiary_id.as_str())
            .bind(link.suppressed)
            .bind(chain.captured_at.as_ms())
            .execute(&mut *tx)
            .await
            .map_err(store)?;
        }

        let existing = key_states(&mut tx, &event.event_id).await.map_err(store)?;
        let tolerance = Decimal::unit(event.currency.scale());

        let mut pending = Vec::new();
        for d in derived {
            let key = d.key();
            if let Some(state) = existing.get(&key) {
                if state.rolled_back {
                    continue;
                }
                if let Some((entry_id, stored)) = state
                    .active
                    .iter()
                    .find(|(_, amount)| amount.differs_by_more_than(d.amount, tolerance))
                {
                    return Ok(ApplyTx::Conflict(ConflictDetail {
                        entry_id: entry_id.clone(),
                        key,
                        stored: *stored,
                        derived: d.amount,
                    }));
                }
                if !state.active.is_empty() {
                    continue;
                }
            }
            pending.push(d);
        }

        let mut inserted = Vec::new();
        let mut deltas: BTreeMap<ParticipantId, AggregateDelta> = BTreeMap::new();
        for d in pending {
            let entry = CommissionEntry::from_derived(d, now);
            if !insert_entry(&mut tx, &entry).await.map_err(store)? {
                continue;
            }

            let delta = deltas.entry(entry.beneficiary_id.clone()).or_default();
            delta
                .add_earnings(entry.generation, entry.amount)
                .ok_or_else(|| earnings_overflow(OP, &entry))?;
            if seen_increment(&mut tx, &entry).await.map_err(store)? {
                delta.add_count(entry.generation, 1);
            }
            inserted.push(entry);
        }

        if inserted.is_empty() {
            // Keeps any snapshot rows captured above.
            tx.commit().await.map_err(store)?;
            return Ok(ApplyTx::Noop);
        }

        let mut aggregates = Vec::with_capacity(deltas.len());
        for (beneficiary, delta) in &deltas {
            aggregates.push(apply_delta(&mut tx, OP, beneficiary, event.currency, delta, now).await?);
        }

        tx.commit().await.map_err(store)?;
        Ok(ApplyTx::Applied {
            entries: inserted,
            aggregates,
        })
    }

    /// Mark every active entry of an event `rolled_back` and reverse its
    /// aggregate contributions, atomically.
    ///
    /// `covered` lists the aggregates the caller holds locks for; if the
    /// event's active entries touch any other aggregate the transaction is
    /// abandoned with a transient error so the caller can relock and retry.
    pub async fn rollback_event_entries(
        &self,
        event_id: &str,
        reason: &str,
        covered: &BTreeSet<(ParticipantId, Currency)>,
        now: TimeMs,
    ) -> Result<RollbackTx, LedgerError> {
        const OP: &str = "rollback_event";
        let store = |e: sqlx::Error| LedgerError::store(OP, e).with_id(event_id);

        let mut tx = self.pool.begin().await.map_err(store)?;

        match touch_event(&mut tx, event_id).await.map_err(store)? {
            None => return Err(LedgerError::not_found(OP, "no such event").with_id(event_id)),
            Some(Some(_)) => return Ok(RollbackTx::AlreadyRolledBack),
            Some(None) => {}
        }

        let rows = sqlx::query(
            r#"
            SELECT entry_id, event_id, generation, beneficiary_id, referred_id,
                   amount, currency, rate_applied, status, created_at_ms
            FROM commission_entries
            WHERE event_id = ? AND status = 'active'
            ORDER BY created_at_ms ASC, id ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(store)?;
        let mut entries = rows
            .iter()
            .map(entry_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(store)?;

        if let Some(e) = entries
            .iter()
            .find(|e| !covered.contains(&(e.beneficiary_id.clone(), e.currency)))
        {
            return Err(
                LedgerError::transient(OP, "active entries changed since locking")
                    .with_id(e.entry_id.as_str()),
            );
        }

        sqlx::query("UPDATE events SET rolled_back_at_ms = ?, rollback_reason = ? WHERE event_id = ?")
            .bind(now.as_ms())
            .bind(reason)
            .bind(event_id)
            .execute(&mut *tx)
            .await
            .map_err(store)?;

        sqlx::query(
            r#"
            UPDATE commission_entries
            SET status = 'rolled_back', status_changed_at_ms = ?, status_reason = ?
            WHERE event_id = ? AND status = 'active'
            "#,
        )
        .bind(now.as_ms())
        .bind(reason)
        .bind(event_id)
        .execute(&mut *tx)
        .await
        .map_err(store)?;

        let mut deltas: BTreeMap<(ParticipantId, Currency), AggregateDelta> = BTreeMap::new();
        for entry in &mut entries {
            let delta = deltas
                .entry((entry.beneficiary_id.clone(), entry.currency))
                .or_default();
            delta
                .add_earnings(entry.generation, -entry.amount)
                .ok_or_else(|| earnings_overflow(OP, entry))?;
            if seen_decrement(&mut tx, entry).await.map_err(store)? {
                delta.add_count(entry.generation, -1);
            }
            entry.status = EntryStatus::RolledBack;
        }

        let mut aggregates = Vec::with_capacity(deltas.len());
        for ((beneficiary, currency), delta) in &deltas {
            aggregates.push(apply_delta(&mut tx, OP, beneficiary, *currency, delta, now).await?);
        }

        tx.commit().await.map_err(store)?;
        Ok(RollbackTx::RolledBack {
            entries,
            aggregates,
        })
    }

    // =========================================================================
    // Entry and aggregate queries
    // =========================================================================

    /// Aggregates currently holding active entries of an event.
    pub async fn active_aggregate_keys_for_event(
        &self,
        event_id: &str,
    ) -> Result<BTreeSet<(ParticipantId, Currency)>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT beneficiary_id, currency
            FROM commission_entries
            WHERE event_id = ? AND status = 'active'
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok((
                    ParticipantId::new(row.get::<String, _>("beneficiary_id")),
                    currency_column(row, "currency")?,
                ))
            })
            .collect()
    }

    /// All entries of an event, any status, in insertion order.
    pub async fn entries_for_event(
        &self,
        event_id: &str,
    ) -> Result<Vec<CommissionEntry>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT entry_id, event_id, generation, beneficiary_id, referred_id,
                   amount, currency, rate_applied, status, created_at_ms
            FROM commission_entries
            WHERE event_id = ?
            ORDER BY created_at_ms ASC, id ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Active entries of one aggregate ordered by `(createdAt, insertion order)`.
    pub async fn active_entries_for(
        &self,
        beneficiary: &ParticipantId,
        currency: Currency,
    ) -> Result<Vec<CommissionEntry>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT entry_id, event_id, generation, beneficiary_id, referred_id,
                   amount, currency, rate_applied, status, created_at_ms
            FROM commission_entries
            WHERE beneficiary_id = ? AND currency = ? AND status = 'active'
            ORDER BY created_at_ms ASC, id ASC
            "#,
        )
        .bind(beneficiary.as_str())
        .bind(currency.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// The chain captured for an event, possibly with no links.
    ///
    /// `None` when the event is unknown or its chain was never captured.
    pub async fn get_chain_snapshot(
        &self,
        event_id: &str,
    ) -> Result<Option<ChainSnapshot>, sqlx::Error> {
        let captured_at: Option<i64> =
            sqlx::query("SELECT chain_captured_at_ms FROM events WHERE event_id = ?")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?
                .and_then(|row| row.get("chain_captured_at_ms"));
        let Some(captured_at) = captured_at else {
            return Ok(None);
        };

        let rows = sqlx::query(
            r#"
            SELECT generation, beneficiary_id, suppressed
            FROM chain_snapshots
            WHERE event_id = ?
            ORDER BY generation ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        let links = rows
            .iter()
            .map(|row| {
                Ok(ChainLink {
                    generation: Generation::try_from(row.get::<i64, _>("generation"))
                        .map_err(decode_err)?,
                    beneficiary_id: ParticipantId::new(row.get::<String, _>("beneficiary_id")),
                    suppressed: row.get("suppressed"),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(Some(ChainSnapshot::new(
            event_id,
            links,
            TimeMs::new(captured_at),
        )))
    }

    /// Latest committed aggregate; zeroed with version 0 when never written.
    pub async fn get_aggregate(
        &self,
        beneficiary: &ParticipantId,
        currency: Currency,
    ) -> Result<BeneficiaryAggregate, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        load_aggregate(&mut conn, beneficiary, currency).await
    }

    /// Page through a beneficiary's entries ordered by `(createdAt, insertion order)`.
    ///
    /// `page` is 1-based; `page_size` is clamped to `1..=500`.
    pub async fn list_entries(
        &self,
        filter: &EntryFilter,
        page: u32,
        page_size: u32,
    ) -> Result<Page<CommissionEntry>, sqlx::Error> {
        const WHERE_CLAUSE: &str = r#"
            WHERE beneficiary_id = ?
              AND (? IS NULL OR created_at_ms >= ?)
              AND (? IS NULL OR created_at_ms < ?)
              AND (? IS NULL OR generation = ?)
              AND (? IS NULL OR status = ?)
        "#;

        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let offset = i64::from(page - 1) * i64::from(page_size);

        let since = filter.since.map(|t| t.as_ms());
        let until = filter.until.map(|t| t.as_ms());
        let generation = filter.generation.map(|g| i64::from(g.get()));
        let status = filter.status.map(|s| s.as_str());

        let count_sql = format!("SELECT COUNT(*) AS n FROM commission_entries {}", WHERE_CLAUSE);
        let total: i64 = sqlx::query(&count_sql)
            .bind(filter.beneficiary_id.as_str())
            .bind(since)
            .bind(since)
            .bind(until)
            .bind(until)
            .bind(generation)
            .bind(generation)
            .bind(status)
            .bind(status)
            .fetch_one(&self.pool)
            .await?
            .get("n");

        let list_sql = format!(
            r#"
            SELECT entry_id, event_id, generation, beneficiary_id, referred_id,
                   amount, currency, rate_applied, status, created_at_ms
            FROM commission_entries
            {}
            ORDER BY created_at_ms ASC, id ASC
            LIMIT ? OFFSET ?
            "#,
            WHERE_CLAUSE
        );
        let rows = sqlx::query(&list_sql)
            .bind(filter.beneficiary_id.as_str())
            .bind(since)
            .bind(since)
            .bind(until)
            .bind(until)
            .bind(generation)
            .bind(generation)
            .bind(status)
            .bind(status)
            .bind(i64::from(page_size))
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .iter()
            .map(entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            page,
            page_size,
            total,
        })
    }
}

// =============================================================================
// Transaction helpers
// =============================================================================

/// Take the write lock by touching the event row.
///
/// Returns `None` when the event is unknown, otherwise its rollback timestamp.
async fn touch_event(
    conn: &mut SqliteConnection,
    event_id: &str,
) -> Result<Option<Option<i64>>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE events SET accepted_at_ms = accepted_at_ms
        WHERE event_id = ?
        RETURNING rolled_back_at_ms
        "#,
    )
    .bind(event_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|r| r.get::<Option<i64>, _>("rolled_back_at_ms")))
}

async fn key_states(
    conn: &mut SqliteConnection,
    event_id: &str,
) -> Result<HashMap<EntryKey, KeyState>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT entry_id, generation, beneficiary_id, amount, status
        FROM commission_entries
        WHERE event_id = ?
        ORDER BY created_at_ms ASC, id ASC
        "#,
    )
    .bind(event_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut states: HashMap<EntryKey, KeyState> = HashMap::new();
    for row in &rows {
        let key = EntryKey {
            event_id: event_id.to_string(),
            generation: Generation::try_from(row.get::<i64, _>("generation")).map_err(decode_err)?,
            beneficiary_id: ParticipantId::new(row.get::<String, _>("beneficiary_id")),
        };
        let status = EntryStatus::from_str(&row.get::<String, _>("status")).map_err(decode_err)?;
        let state = states.entry(key).or_default();
        match status {
            EntryStatus::Active => state
                .active
                .push((row.get("entry_id"), decimal_column(row, "amount"))),
            EntryStatus::RolledBack => state.rolled_back = true,
            EntryStatus::Duplicate => {}
        }
    }
    Ok(states)
}

/// Insert an entry; returns false if any uniqueness constraint already holds it.
async fn insert_entry(
    conn: &mut SqliteConnection,
    entry: &CommissionEntry,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO commission_entries (
            entry_id, event_id, generation, beneficiary_id, referred_id,
            amount, currency, rate_applied, status, created_at_ms
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(entry.entry_id.as_str())
    .bind(entry.event_id.as_str())
    .bind(i64::from(entry.generation.get()))
    .bind(entry.beneficiary_id.as_str())
    .bind(entry.referred_id.as_str())
    .bind(entry.amount.to_canonical_string())
    .bind(entry.currency.as_str())
    .bind(entry.rate_applied.to_canonical_string())
    .bind(entry.status.as_str())
    .bind(entry.created_at.as_ms())
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Count one more active entry for (beneficiary, currency, generation, referred).
///
/// Returns true when the referred participant was not seen before.
async fn seen_increment(
    conn: &mut SqliteConnection,
    entry: &CommissionEntry,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE seen_referreds SET active_entries = active_entries + 1
        WHERE beneficiary_id = ? AND currency = ? AND generation = ? AND referred_id = ?
        "#,
    )
    .bind(entry.beneficiary_id.as_str())
    .bind(entry.currency.as_str())
    .bind(i64::from(entry.generation.get()))
    .bind(entry.referred_id.as_str())
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() > 0 {
        return Ok(false);
    }

    sqlx::query(
        r#"
        INSERT INTO seen_referreds (beneficiary_id, currency, generation, referred_id, active_entries)
        VALUES (?, ?, ?, ?, 1)
        "#,
    )
    .bind(entry.beneficiary_id.as_str())
    .bind(entry.currency.as_str())
    .bind(i64::from(entry.generation.get()))
    .bind(entry.referred_id.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(true)
}

/// Count one fewer active entry; returns true when the referred participant
/// no longer has any.
async fn seen_decrement(
    conn: &mut SqliteConnection,
    entry: &CommissionEntry,
) -> Result<bool, sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE seen_referreds SET active_entries = active_entries - 1
        WHERE beneficiary_id = ? AND currency = ? AND generation = ? AND referred_id = ?
        "#,
    )
    .bind(entry.beneficiary_id.as_str())
    .bind(entry.currency.as_str())
    .bind(i64::from(entry.generation.get()))
    .bind(entry.referred_id.as_str())
    .execute(&mut *conn)
    .await?;

    let result = sqlx::query(
        r#"
        DELETE FROM seen_referreds
        WHERE beneficiary_id = ? AND currency = ? AND generation = ? AND referred_id = ?
          AND active_entries <= 0
        "#,
    )
    .bind(entry.beneficiary_id.as_str())
    .bind(entry.currency.as_str())
    .bind(i64::from(entry.generation.get()))
    .bind(entry.referred_id.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

fn earnings_overflow(op: &'static str, entry: &CommissionEntry) -> LedgerError {
    LedgerError::validation(
        op,
        format!(
            "earnings of {} in {} overflow generation {}",
            entry.beneficiary_id, entry.currency, entry.generation
        ),
    )
    .with_id(entry.event_id.as_str())
}

/// Load, adjust and store one aggregate with a version bump.
///
/// A total that would overflow is a validation error and nothing is stored.
async fn apply_delta(
    conn: &mut SqliteConnection,
    op: &'static str,
    beneficiary: &ParticipantId,
    currency: Currency,
    delta: &AggregateDelta,
    now: TimeMs,
) -> Result<BeneficiaryAggregate, LedgerError> {
    let mut agg = load_aggregate(&mut *conn, beneficiary, currency)
        .await
        .map_err(|e| LedgerError::store(op, e))?;

    let expected_version = agg.version;
    delta.apply_to(&mut agg).map_err(|e| {
        LedgerError::validation(op, e.to_string()).with_id(beneficiary.as_str())
    })?;
    agg.version = expected_version + 1;
    agg.updated_at = Some(now);

    let stored = store_aggregate(&mut *conn, &agg, expected_version)
        .await
        .map_err(|e| LedgerError::store(op, e))?;
    if !stored {
        return Err(LedgerError::transient(op, "aggregate version moved")
            .with_id(beneficiary.as_str()));
    }
    Ok(agg)
}

pub(super) async fn load_aggregate(
    conn: &mut SqliteConnection,
    beneficiary: &ParticipantId,
    currency: Currency,
) -> Result<BeneficiaryAggregate, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT total_earnings, g1_count, g1_earnings, g2_count, g2_earnings,
               g3_count, g3_earnings, direct_referral_count, version, updated_at_ms
        FROM beneficiary_aggregates
        WHERE beneficiary_id = ? AND currency = ?
        "#,
    )
    .bind(beneficiary.as_str())
    .bind(currency.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(BeneficiaryAggregate::empty(beneficiary.clone(), currency));
    };

    let totals = |g: u8| GenerationTotals {
        count: row.get(format!("g{}_count", g).as_str()),
        earnings: decimal_column(&row, &format!("g{}_earnings", g)),
    };

    Ok(BeneficiaryAggregate {
        beneficiary_id: beneficiary.clone(),
        currency,
        total_earnings: decimal_column(&row, "total_earnings"),
        per_generation: [totals(1), totals(2), totals(3)],
        direct_referral_count: row.get("direct_referral_count"),
        version: row.get("version"),
        updated_at: Some(TimeMs::new(row.get("updated_at_ms"))),
    })
}

/// Write `agg` if the stored version still equals `expected_version`
/// (0 meaning no row yet). Returns false on a version mismatch.
pub(super) async fn store_aggregate(
    conn: &mut SqliteConnection,
    agg: &BeneficiaryAggregate,
    expected_version: i64,
) -> Result<bool, sqlx::Error> {
    let [g1, g2, g3] = agg.per_generation;
    let updated_at = agg.updated_at.unwrap_or_else(TimeMs::now).as_ms();

    let result = if expected_version == 0 {
        sqlx::query(
            r#"
            INSERT INTO beneficiary_aggregates (
                beneficiary_id, currency, total_earnings,
                g1_count, g1_earnings, g2_count, g2_earnings, g3_count, g3_earnings,
                direct_referral_count, version, updated_at_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(beneficiary_id, currency) DO NOTHING
            "#,
        )
        .bind(agg.beneficiary_id.as_str())
        .bind(agg.currency.as_str())
        .bind(agg.total_earnings.to_canonical_string())
        .bind(g1.count)
        .bind(g1.earnings.to_canonical_string())
        .bind(g2.count)
        .bind(g2.earnings.to_canonical_string())
        .bind(g3.count)
        .bind(g3.earnings.to_canonical_string())
        .bind(agg.direct_referral_count)
        .bind(agg.version)
        .bind(updated_at)
        .execute(&mut *conn)
        .await?
    } else {
        sqlx::query(
            r#"
            UPDATE beneficiary_aggregates SET
                total_earnings = ?,
                g1_count = ?, g1_earnings = ?,
                g2_count = ?, g2_earnings = ?,
                g3_count = ?, g3_earnings = ?,
                direct_referral_count = ?,
                version = ?,
                updated_at_ms = ?
            WHERE beneficiary_id = ? AND currency = ? AND version = ?
            "#,
        )
        .bind(agg.total_earnings.to_canonical_string())
        .bind(g1.count)
        .bind(g1.earnings.to_canonical_string())
        .bind(g2.count)
        .bind(g2.earnings.to_canonical_string())
        .bind(g3.count)
        .bind(g3.earnings.to_canonical_string())
        .bind(agg.direct_referral_count)
        .bind(agg.version)
        .bind(updated_at)
        .bind(agg.beneficiary_id.as_str())
        .bind(agg.currency.as_str())
        .bind(expected_version)
        .execute(&mut *conn)
        .await?
    };

    Ok(result.rows_affected() > 0)
}

pub(super) fn entry_from_row(row: &SqliteRow) -> Result<CommissionEntry, sqlx::Error> {
    let status: String = row.get("status");
    Ok(CommissionEntry {
        entry_id: row.get("entry_id"),
        event_id: row.get("event_id"),
        generation: Generation::try_from(row.get::<i64, _>("generation")).map_err(decode_err)?,
        beneficiary_id: ParticipantId::new(row.get::<String, _>("beneficiary_id")),
        referred_id: ParticipantId::new(row.get::<String, _>("referred_id")),
        amount: decimal_column(row, "amount"),
        currency: currency_column(row, "currency")?,
        rate_applied: decimal_column(row, "rate_applied"),
        status: EntryStatus::from_str(&status).map_err(decode_err)?,
        created_at: TimeMs::new(row.get("created_at_ms")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::init_db;
    use crate::domain::RawPurchase;
    use tempfile::TempDir;

    async fn setup_test_db() -> (Repository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (Repository::new(pool), temp_dir)
    }

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s)
    }

    fn g(n: u8) -> Generation {
        Generation::new(n).unwrap()
    }

    async fn logged_event(repo: &Repository, id: &str, purchaser: &str) -> PurchaseEvent {
        let event = PurchaseEvent::normalize(&RawPurchase {
            event_id: id.to_string(),
            purchaser_id: purchaser.to_string(),
            amount: "10000".to_string(),
            currency: "NGN".to_string(),
            product_kind: "share".to_string(),
            occurred_at_ms: 1_000,
            source_ref: None,
        })
        .unwrap();
        repo.insert_event_if_absent(&event, TimeMs::new(1_000))
            .await
            .unwrap();
        event
    }

    fn chain(event_id: &str, ids: &[&str]) -> ChainSnapshot {
        let links = ids
            .iter()
            .enumerate()
            .map(|(i, id)| ChainLink {
                generation: g(i as u8 + 1),
                beneficiary_id: pid(id),
                suppressed: false,
            })
            .collect();
        ChainSnapshot::new(event_id, links, TimeMs::new(1_000))
    }

    fn derived(event: &PurchaseEvent, gen: u8, beneficiary: &str, amount: &str, rate: &str) -> DerivedEntry {
        DerivedEntry {
            event_id: event.event_id.clone(),
            generation: g(gen),
            beneficiary_id: pid(beneficiary),
            referred_id: event.purchaser_id.clone(),
            amount: d(amount),
            currency: event.currency,
            rate_applied: d(rate),
        }
    }

    fn abc(event: &PurchaseEvent) -> Vec<DerivedEntry> {
        vec![
            derived(event, 1, "a", "1500", "0.15"),
            derived(event, 2, "b", "300", "0.03"),
            derived(event, 3, "c", "200", "0.02"),
        ]
    }

    #[tokio::test]
    async fn test_apply_inserts_entries_snapshot_and_aggregates() {
        let (repo, _temp) = setup_test_db().await;
        let e1 = logged_event(&repo, "e1", "p").await;

        let result = repo
            .apply_event_entries(&e1, &chain("e1", &["a", "b", "c"]), &abc(&e1), TimeMs::new(2_000))
            .await
            .expect("apply failed");
        match result {
            ApplyTx::Applied { entries, aggregates } => {
                assert_eq!(entries.len(), 3);
                assert_eq!(aggregates.len(), 3);
            }
            other => panic!("expected Applied, got {:?}", other),
        }

        let a = repo.get_aggregate(&pid("a"), Currency::Ngn).await.unwrap();
        assert_eq!(a.total_earnings, d("1500"));
        assert_eq!(a.direct_referral_count, 1);
        assert_eq!(a.version, 1);

        let c = repo.get_aggregate(&pid("c"), Currency::Ngn).await.unwrap();
        assert_eq!(c.generation(g(3)).earnings, d("200"));
        assert_eq!(c.generation(g(3)).count, 1);
        assert_eq!(c.direct_referral_count, 0);

        let snapshot = repo.get_chain_snapshot("e1").await.unwrap().unwrap();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.is_sound(&pid("p")));
    }

    #[tokio::test]
    async fn test_empty_chain_is_captured() {
        let (repo, _temp) = setup_test_db().await;
        let e1 = logged_event(&repo, "e1", "p").await;
        assert!(repo.get_chain_snapshot("e1").await.unwrap().is_none());

        let result = repo
            .apply_event_entries(&e1, &chain("e1", &[]), &[], TimeMs::new(2_000))
            .await
            .unwrap();
        assert_eq!(result, ApplyTx::Noop);

        let snapshot = repo.get_chain_snapshot("e1").await.unwrap().unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.captured_at, TimeMs::new(1_000));
        assert!(repo.get_chain_snapshot("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reapply_is_noop() {
        let (repo, _temp) = setup_test_db().await;
        let e1 = logged_event(&repo, "e1", "p").await;
        let ch = chain("e1", &["a", "b", "c"]);

        repo.apply_event_entries(&e1, &ch, &abc(&e1), TimeMs::new(2_000))
            .await
            .unwrap();
        let again = repo
            .apply_event_entries(&e1, &ch, &abc(&e1), TimeMs::new(3_000))
            .await
            .unwrap();
        assert_eq!(again, ApplyTx::Noop);

        let a = repo.get_aggregate(&pid("a"), Currency::Ngn).await.unwrap();
        assert_eq!(a.total_earnings, d("1500"));
        assert_eq!(a.version, 1);
    }

    #[tokio::test]
    async fn test_amount_within_one_unit_is_not_a_conflict() {
        let (repo, _temp) = setup_test_db().await;
        let e1 = logged_event(&repo, "e1", "p").await;
        let ch = chain("e1", &["a"]);

        repo.apply_event_entries(&e1, &ch, &[derived(&e1, 1, "a", "1500", "0.15")], TimeMs::new(1))
            .await
            .unwrap();

        let near = repo
            .apply_event_entries(&e1, &ch, &[derived(&e1, 1, "a", "1500.01", "0.15")], TimeMs::new(2))
            .await
            .unwrap();
        assert_eq!(near, ApplyTx::Noop);

        let far = repo
            .apply_event_entries(&e1, &ch, &[derived(&e1, 1, "a", "1600", "0.16")], TimeMs::new(3))
            .await
            .unwrap();
        match far {
            ApplyTx::Conflict(detail) => {
                assert_eq!(detail.stored, d("1500"));
                assert_eq!(detail.derived, d("1600"));
            }
            other => panic!("expected Conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_distinct_referred_counts() {
        let (repo, _temp) = setup_test_db().await;
        let e1 = logged_event(&repo, "e1", "p").await;
        let e2 = logged_event(&repo, "e2", "p").await;
        let e3 = logged_event(&repo, "e3", "q").await;

        for e in [&e1, &e2, &e3] {
            repo.apply_event_entries(
                e,
                &chain(&e.event_id, &["a"]),
                &[derived(e, 1, "a", "1500", "0.15")],
                TimeMs::new(5),
            )
            .await
            .unwrap();
        }

        let a = repo.get_aggregate(&pid("a"), Currency::Ngn).await.unwrap();
        assert_eq!(a.total_earnings, d("4500"));
        assert_eq!(a.direct_referral_count, 2);
        assert_eq!(a.version, 3);
    }

    #[tokio::test]
    async fn test_rollback_restores_aggregates_and_blocks_reinsert() {
        let (repo, _temp) = setup_test_db().await;
        let e1 = logged_event(&repo, "e1", "p").await;
        let ch = chain("e1", &["a", "b", "c"]);
        repo.apply_event_entries(&e1, &ch, &abc(&e1), TimeMs::new(2_000))
            .await
            .unwrap();

        let covered = repo.active_aggregate_keys_for_event("e1").await.unwrap();
        assert_eq!(covered.len(), 3);

        let result = repo
            .rollback_event_entries("e1", "refund", &covered, TimeMs::new(3_000))
            .await
            .unwrap();
        match result {
            RollbackTx::RolledBack { entries, .. } => {
                assert_eq!(entries.len(), 3);
                assert!(entries.iter().all(|e| e.status == EntryStatus::RolledBack));
            }
            other => panic!("expected RolledBack, got {:?}", other),
        }

        let a = repo.get_aggregate(&pid("a"), Currency::Ngn).await.unwrap();
        assert!(a.total_earnings.is_zero());
        assert_eq!(a.direct_referral_count, 0);
        assert_eq!(a.version, 2);

        let again = repo
            .rollback_event_entries("e1", "refund", &BTreeSet::new(), TimeMs::new(4_000))
            .await
            .unwrap();
        assert_eq!(again, RollbackTx::AlreadyRolledBack);

        let reapply = repo
            .apply_event_entries(&e1, &ch, &abc(&e1), TimeMs::new(5_000))
            .await
            .unwrap();
        assert_eq!(reapply, ApplyTx::EventRolledBack);
        assert!(repo.active_entries_for(&pid("a"), Currency::Ngn).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_requires_covering_locks() {
        let (repo, _temp) = setup_test_db().await;
        let e1 = logged_event(&repo, "e1", "p").await;
        repo.apply_event_entries(&e1, &chain("e1", &["a"]), &[derived(&e1, 1, "a", "1500", "0.15")], TimeMs::new(1))
            .await
            .unwrap();

        let err = repo
            .rollback_event_entries("e1", "refund", &BTreeSet::new(), TimeMs::new(2))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let stored = repo.get_event("e1").await.unwrap().unwrap();
        assert!(!stored.is_rolled_back());
    }

    #[tokio::test]
    async fn test_rollback_unknown_event_is_not_found() {
        let (repo, _temp) = setup_test_db().await;
        let err = repo
            .rollback_event_entries("nope", "x", &BTreeSet::new(), TimeMs::new(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_list_entries_pages_and_filters() {
        let (repo, _temp) = setup_test_db().await;
        for i in 0..5 {
            let e = logged_event(&repo, &format!("e{}", i), &format!("p{}", i)).await;
            repo.apply_event_entries(
                &e,
                &chain(&e.event_id, &["a"]),
                &[derived(&e, 1, "a", "10", "0.15")],
                TimeMs::new(100 + i),
            )
            .await
            .unwrap();
        }

        let filter = EntryFilter::for_beneficiary(pid("a"));
        let page1 = repo.list_entries(&filter, 1, 2).await.unwrap();
        assert_eq!(page1.total, 5);
        assert_eq!(page1.items.len(), 2);
        assert_eq!(page1.items[0].event_id, "e0");

        let page3 = repo.list_entries(&filter, 3, 2).await.unwrap();
        assert_eq!(page3.items.len(), 1);
        assert_eq!(page3.items[0].event_id, "e4");

        let mut windowed = filter.clone();
        windowed.since = Some(TimeMs::new(101));
        windowed.until = Some(TimeMs::new(103));
        let page = repo.list_entries(&windowed, 0, 0).await.unwrap();
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, 1);
        assert_eq!(page.total, 2);

        let mut rolled = filter.clone();
        rolled.status = Some(EntryStatus::RolledBack);
        assert_eq!(repo.list_entries(&rolled, 1, 50).await.unwrap().total, 0);
    }
}
