//! Repository layer for database operations.
//!
//! This module provides the `Repository` struct for all database operations.
//! Methods are organized across submodules by domain:
//! - `entries.rs` - Entry writes, rollbacks, aggregates and entry queries
//! - `reconcile.rs` - Reconciler reads, repairs, run journal and flags

mod entries;
mod reconcile;

pub use entries::{ApplyTx, EntryFilter, Page, RollbackTx, MAX_PAGE_SIZE};
pub use reconcile::SeenIndex;

use crate::domain::{
    Currency, DeadLetter, DeadLetterKind, Decimal, Participant, ParticipantId, ParticipantStatus,
    ProductKind, PurchaseEvent, RateSchedule, TimeMs,
};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::warn;

/// An event from the log together with its lifecycle columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub event: PurchaseEvent,
    pub accepted_at: TimeMs,
    pub rolled_back_at: Option<TimeMs>,
    pub rollback_reason: Option<String>,
}

impl StoredEvent {
    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back_at.is_some()
    }
}

/// Repository for database operations.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Participant operations
    // =========================================================================

    /// Insert or replace a participant. The handle of an existing participant
    /// is never rewritten.
    pub async fn upsert_participant(&self, participant: &Participant) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO participants (id, handle, referrer_handle, status)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                referrer_handle = excluded.referrer_handle,
                status = excluded.status
            "#,
        )
        .bind(participant.id.as_str())
        .bind(participant.handle.as_str())
        .bind(participant.referrer_handle.as_deref())
        .bind(participant.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_participant(
        &self,
        id: &ParticipantId,
    ) -> Result<Option<Participant>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, handle, referrer_handle, status FROM participants WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(participant_from_row).transpose()
    }

    pub async fn get_participant_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<Participant>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, handle, referrer_handle, status FROM participants WHERE handle = ?",
        )
        .bind(handle)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(participant_from_row).transpose()
    }

    /// Participants that name a referrer, ordered by id.
    pub async fn list_participants_with_referrer(&self) -> Result<Vec<Participant>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, handle, referrer_handle, status
            FROM participants
            WHERE referrer_handle IS NOT NULL
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(participant_from_row).collect()
    }

    /// Clear a participant's referrer handle and any open flag for it.
    ///
    /// Returns false when the participant does not exist.
    pub async fn clear_referrer(&self, id: &ParticipantId) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE participants SET referrer_handle = NULL WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM participant_flags WHERE participant_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    // =========================================================================
    // Rate schedule operations
    // =========================================================================

    /// Append a schedule. Existing schedules are never modified.
    pub async fn insert_rate_schedule(&self, schedule: &RateSchedule) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO rate_schedules (effective_from_ms, rate_g1, rate_g2, rate_g3, created_at_ms)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(schedule.effective_from.as_ms())
        .bind(schedule.rates[0].to_canonical_string())
        .bind(schedule.rates[1].to_canonical_string())
        .bind(schedule.rates[2].to_canonical_string())
        .bind(TimeMs::now().as_ms())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_rate_schedules(&self) -> Result<Vec<RateSchedule>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT effective_from_ms, rate_g1, rate_g2, rate_g3
            FROM rate_schedules
            ORDER BY effective_from_ms ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(rate_schedule_from_row).collect())
    }

    /// The schedule in force at `at`: latest `effective_from <= at`, later
    /// insertions winning ties.
    pub async fn rate_schedule_at(&self, at: TimeMs) -> Result<Option<RateSchedule>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT effective_from_ms, rate_g1, rate_g2, rate_g3
            FROM rate_schedules
            WHERE effective_from_ms <= ?
            ORDER BY effective_from_ms DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(at.as_ms())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(rate_schedule_from_row))
    }

    pub async fn count_rate_schedules(&self) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM rate_schedules")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    // =========================================================================
    // Event log operations
    // =========================================================================

    pub async fn event_exists(&self, event_id: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 AS present FROM events WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Append an accepted event to the log idempotently.
    ///
    /// Returns false when the event id is already present.
    pub async fn insert_event_if_absent(
        &self,
        event: &PurchaseEvent,
        accepted_at: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO events (
                event_id, purchaser_id, amount, currency, product_kind,
                occurred_at_ms, source_ref, accepted_at_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(event_id) DO NOTHING
            "#,
        )
        .bind(event.event_id.as_str())
        .bind(event.purchaser_id.as_str())
        .bind(event.amount.to_canonical_string())
        .bind(event.currency.as_str())
        .bind(event.product_kind.as_str())
        .bind(event.occurred_at.as_ms())
        .bind(event.source_ref.as_str())
        .bind(accepted_at.as_ms())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_event(&self, event_id: &str) -> Result<Option<StoredEvent>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT event_id, purchaser_id, amount, currency, product_kind, occurred_at_ms,
                   source_ref, accepted_at_ms, rolled_back_at_ms, rollback_reason
            FROM events
            WHERE event_id = ?
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(stored_event_from_row).transpose()
    }

    // =========================================================================
    // Dead-letter operations
    // =========================================================================

    pub async fn insert_dead_letter(&self, letter: &DeadLetter) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters (id, event_id, kind, reason, payload, created_at_ms)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(letter.id.as_str())
        .bind(letter.event_id.as_deref())
        .bind(letter.kind.as_str())
        .bind(letter.reason.as_str())
        .bind(letter.payload.to_string())
        .bind(letter.created_at.as_ms())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Dead letters, newest first.
    pub async fn list_dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, kind, reason, payload, created_at_ms
            FROM dead_letters
            ORDER BY created_at_ms DESC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let letters = rows
            .iter()
            .map(|row| {
                let kind = match row.get::<String, _>("kind").as_str() {
                    "conflict" => DeadLetterKind::Conflict,
                    _ => DeadLetterKind::Validation,
                };
                let payload_str: String = row.get("payload");
                let payload = serde_json::from_str(&payload_str).unwrap_or_else(|e| {
                    warn!(error = %e, "Failed to parse dead-letter payload, keeping raw text");
                    serde_json::Value::String(payload_str.clone())
                });
                DeadLetter {
                    id: row.get("id"),
                    event_id: row.get("event_id"),
                    kind,
                    reason: row.get("reason"),
                    payload,
                    created_at: TimeMs::new(row.get("created_at_ms")),
                }
            })
            .collect();

        Ok(letters)
    }
}

// =============================================================================
// Row decoding
// =============================================================================

fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

/// Parse a stored decimal column, falling back to zero with a warning.
pub(crate) fn decimal_column(row: &SqliteRow, column: &str) -> Decimal {
    let raw: String = row.get(column);
    Decimal::from_str(&raw).unwrap_or_else(|e| {
        warn!(
            column,
            value = %raw,
            error = %e,
            "Failed to parse decimal column, using default"
        );
        Decimal::default()
    })
}

pub(crate) fn currency_column(row: &SqliteRow, column: &str) -> Result<Currency, sqlx::Error> {
    let raw: String = row.get(column);
    Currency::from_str(&raw).map_err(decode_err)
}

fn participant_from_row(row: &SqliteRow) -> Result<Participant, sqlx::Error> {
    let status: String = row.get("status");
    Ok(Participant {
        id: ParticipantId::new(row.get::<String, _>("id")),
        handle: row.get("handle"),
        referrer_handle: row.get("referrer_handle"),
        status: ParticipantStatus::from_str(&status).map_err(decode_err)?,
    })
}

fn rate_schedule_from_row(row: &SqliteRow) -> RateSchedule {
    RateSchedule {
        rates: [
            decimal_column(row, "rate_g1"),
            decimal_column(row, "rate_g2"),
            decimal_column(row, "rate_g3"),
        ],
        effective_from: TimeMs::new(row.get("effective_from_ms")),
    }
}

pub(crate) fn stored_event_from_row(row: &SqliteRow) -> Result<StoredEvent, sqlx::Error> {
    let product_kind: String = row.get("product_kind");
    let event = PurchaseEvent {
        event_id: row.get("event_id"),
        purchaser_id: ParticipantId::new(row.get::<String, _>("purchaser_id")),
        amount: decimal_column(row, "amount"),
        currency: currency_column(row, "currency")?,
        product_kind: ProductKind::from_str(&product_kind).map_err(decode_err)?,
        occurred_at: TimeMs::new(row.get("occurred_at_ms")),
        source_ref: row.get("source_ref"),
    };

    Ok(StoredEvent {
        event,
        accepted_at: TimeMs::new(row.get("accepted_at_ms")),
        rolled_back_at: row
            .get::<Option<i64>, _>("rolled_back_at_ms")
            .map(TimeMs::new),
        rollback_reason: row.get("rollback_reason"),
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

    fn event(id: &str) -> PurchaseEvent {
        PurchaseEvent::normalize(&RawPurchase {
            event_id: id.to_string(),
            purchaser_id: "p".to_string(),
            amount: "10000.50".to_string(),
            currency: "NGN".to_string(),
            product_kind: "share".to_string(),
            occurred_at_ms: 1_000,
            source_ref: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_participant_lookup_by_id_and_handle() {
        let (repo, _temp) = setup_test_db().await;

        let alice = Participant::new("u1", "alice").referred_by("bob");
        repo.upsert_participant(&alice).await.expect("upsert failed");

        let by_id = repo
            .get_participant(&ParticipantId::new("u1"))
            .await
            .unwrap();
        assert_eq!(by_id, Some(alice.clone()));

        let by_handle = repo.get_participant_by_handle("alice").await.unwrap();
        assert_eq!(by_handle, Some(alice));

        assert!(repo.get_participant_by_handle("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_referrer() {
        let (repo, _temp) = setup_test_db().await;
        repo.upsert_participant(&Participant::new("u1", "alice").referred_by("http://x"))
            .await
            .unwrap();

        assert!(repo.clear_referrer(&ParticipantId::new("u1")).await.unwrap());
        assert!(!repo.clear_referrer(&ParticipantId::new("ghost")).await.unwrap());

        let p = repo
            .get_participant(&ParticipantId::new("u1"))
            .await
            .unwrap()
            .unwrap();
        assert!(p.referrer_handle.is_none());
        assert!(repo.list_participants_with_referrer().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rate_schedule_at_picks_latest_effective() {
        let (repo, _temp) = setup_test_db().await;
        let pct = |a: i64, b: i64, c: i64| [Decimal::from(a), Decimal::from(b), Decimal::from(c)];

        let v1 = RateSchedule::from_percentages(pct(15, 3, 2), TimeMs::new(100)).unwrap();
        let v2 = RateSchedule::from_percentages(pct(10, 2, 1), TimeMs::new(200)).unwrap();
        repo.insert_rate_schedule(&v2).await.unwrap();
        repo.insert_rate_schedule(&v1).await.unwrap();

        assert_eq!(repo.count_rate_schedules().await.unwrap(), 2);
        assert_eq!(repo.rate_schedule_at(TimeMs::new(99)).await.unwrap(), None);
        assert_eq!(repo.rate_schedule_at(TimeMs::new(150)).await.unwrap(), Some(v1));
        assert_eq!(repo.rate_schedule_at(TimeMs::new(200)).await.unwrap(), Some(v2));
    }

    #[tokio::test]
    async fn test_insert_event_is_idempotent() {
        let (repo, _temp) = setup_test_db().await;
        let e = event("e1");

        assert!(!repo.event_exists("e1").await.unwrap());
        assert!(repo.insert_event_if_absent(&e, TimeMs::new(5)).await.unwrap());
        assert!(!repo.insert_event_if_absent(&e, TimeMs::new(6)).await.unwrap());
        assert!(repo.event_exists("e1").await.unwrap());

        let stored = repo.get_event("e1").await.unwrap().unwrap();
        assert_eq!(stored.event, e);
        assert_eq!(stored.accepted_at, TimeMs::new(5));
        assert!(!stored.is_rolled_back());
    }

    #[tokio::test]
    async fn test_dead_letter_roundtrip() {
        let (repo, _temp) = setup_test_db().await;
        let letter = DeadLetter {
            id: "dl1".to_string(),
            event_id: Some("e9".to_string()),
            kind: DeadLetterKind::Validation,
            reason: "amount is negative: -1".to_string(),
            payload: serde_json::json!({"eventId": "e9", "amount": "-1"}),
            created_at: TimeMs::new(42),
        };
        repo.insert_dead_letter(&letter).await.unwrap();

        let letters = repo.list_dead_letters(10).await.unwrap();
        assert_eq!(letters, vec![letter]);
    }
}
