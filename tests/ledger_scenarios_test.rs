//! End-to-end ledger scenarios over a real SQLite store.

use refledger::config::Config;
use refledger::db::{init_db, EntryFilter};
use refledger::domain::{
    Action, ApplyOutcome, CommissionEntry, Currency, Decimal, EntryStatus, Finding, Generation,
    Participant, ParticipantId, RateSchedule, RawPurchase, ReconcileScope, RollbackOutcome,
    RunStatus, SubmitResult, TimeMs,
};
use refledger::notify::MemorySink;
use refledger::{Ledger, Repository};
use std::str::FromStr;
use std::sync::Arc;
use tempfile::TempDir;

struct TestLedger {
    ledger: Ledger,
    repo: Arc<Repository>,
    _temp: TempDir,
}

async fn setup(participants: Vec<Participant>, schedules: Vec<RateSchedule>) -> TestLedger {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();
    let pool = init_db(&db_path).await.expect("init_db failed");
    let repo = Arc::new(Repository::new(pool));

    for p in &participants {
        repo.upsert_participant(p).await.unwrap();
    }
    for s in &schedules {
        repo.insert_rate_schedule(s).await.unwrap();
    }

    let ledger = Ledger::new(
        repo.clone(),
        repo.clone(),
        repo.clone(),
        Arc::new(MemorySink::new()),
        &Config::new(db_path),
    );
    TestLedger {
        ledger,
        repo,
        _temp: temp_dir,
    }
}

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn schedule(g1: &str, g2: &str, g3: &str, from_ms: i64) -> RateSchedule {
    RateSchedule::from_percentages([dec(g1), dec(g2), dec(g3)], TimeMs::new(from_ms)).unwrap()
}

fn purchase(event_id: &str, purchaser: &str, amount: &str, at_ms: i64) -> RawPurchase {
    RawPurchase {
        event_id: event_id.to_string(),
        purchaser_id: purchaser.to_string(),
        amount: amount.to_string(),
        currency: "NGN".to_string(),
        product_kind: "share".to_string(),
        occurred_at_ms: at_ms,
        source_ref: None,
    }
}

/// P -> A -> B -> C
fn four_level_graph() -> Vec<Participant> {
    vec![
        Participant::new("P", "pat").referred_by("ann"),
        Participant::new("A", "ann").referred_by("bea"),
        Participant::new("B", "bea").referred_by("cal"),
        Participant::new("C", "cal"),
    ]
}

async fn entries_of(t: &TestLedger, beneficiary: &str) -> Vec<CommissionEntry> {
    t.ledger
        .list_entries(
            &EntryFilter::for_beneficiary(ParticipantId::new(beneficiary)),
            1,
            500,
        )
        .await
        .unwrap()
        .items
}

async fn total(t: &TestLedger, beneficiary: &str) -> Decimal {
    t.ledger
        .query_aggregate(&ParticipantId::new(beneficiary), Currency::Ngn)
        .await
        .unwrap()
        .total_earnings
}

#[tokio::test]
async fn scenario_a_three_generation_split() {
    let t = setup(four_level_graph(), vec![schedule("15", "3", "2", 0)]).await;

    let result = t
        .ledger
        .submit_purchase(purchase("e1", "P", "10000", 1_000))
        .await
        .unwrap();
    let SubmitResult::Accepted { chain, outcome, .. } = &result else {
        panic!("expected accepted, got {:?}", result);
    };
    assert_eq!(chain.len(), 3);
    assert_eq!(outcome.applied_count(), 3);

    assert_eq!(total(&t, "A").await, dec("1500"));
    assert_eq!(total(&t, "B").await, dec("300"));
    assert_eq!(total(&t, "C").await, dec("200"));

    let a = t
        .ledger
        .query_aggregate(&ParticipantId::new("A"), Currency::Ngn)
        .await
        .unwrap();
    assert_eq!(a.direct_referral_count, 1);
    assert_eq!(a.generation(Generation::FIRST).earnings, dec("1500"));

    let b_entries = entries_of(&t, "B").await;
    assert_eq!(b_entries.len(), 1);
    assert_eq!(b_entries[0].generation.get(), 2);
    assert_eq!(b_entries[0].referred_id, ParticipantId::new("P"));
    assert_eq!(b_entries[0].rate_applied, dec("0.03"));
}

#[tokio::test]
async fn scenario_b_loop_stops_after_first_generation() {
    let participants = vec![
        Participant::new("P", "pat").referred_by("ann"),
        Participant::new("A", "ann").referred_by("bea"),
        Participant::new("B", "bea").referred_by("ann"),
    ];
    let t = setup(participants, vec![schedule("15", "3", "2", 0)]).await;

    let result = t
        .ledger
        .submit_purchase(purchase("e1", "P", "1000", 1_000))
        .await
        .unwrap();
    let SubmitResult::Accepted { chain, .. } = &result else {
        panic!("expected accepted, got {:?}", result);
    };
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].beneficiary_id, ParticipantId::new("A"));

    assert_eq!(total(&t, "A").await, dec("150"));
    assert!(entries_of(&t, "B").await.is_empty());
}

#[tokio::test]
async fn scenario_c_resubmission_is_duplicate() {
    let t = setup(four_level_graph(), vec![schedule("15", "3", "2", 0)]).await;

    t.ledger
        .submit_purchase(purchase("e2", "P", "10000", 1_000))
        .await
        .unwrap();
    let before = t
        .ledger
        .query_aggregate(&ParticipantId::new("A"), Currency::Ngn)
        .await
        .unwrap();

    let result = t
        .ledger
        .submit_purchase(purchase("e2", "P", "10000", 1_000))
        .await
        .unwrap();
    assert_eq!(
        result,
        SubmitResult::Duplicate {
            event_id: "e2".to_string()
        }
    );

    let after = t
        .ledger
        .query_aggregate(&ParticipantId::new("A"), Currency::Ngn)
        .await
        .unwrap();
    assert_eq!(before, after);
    assert_eq!(entries_of(&t, "A").await.len(), 1);
}

#[tokio::test]
async fn scenario_d_rollback_restores_aggregates() {
    let t = setup(four_level_graph(), vec![schedule("15", "3", "2", 0)]).await;
    t.ledger
        .submit_purchase(purchase("e1", "P", "10000", 1_000))
        .await
        .unwrap();

    let outcome = t.ledger.rollback_event("e1", "refund").await.unwrap();
    let RollbackOutcome::RolledBack { entry_ids, .. } = &outcome else {
        panic!("expected rolled back, got {:?}", outcome);
    };
    assert_eq!(entry_ids.len(), 3);

    for b in ["A", "B", "C"] {
        assert_eq!(total(&t, b).await, Decimal::zero());
        let entries = entries_of(&t, b).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, EntryStatus::RolledBack);
    }
    let a = t
        .ledger
        .query_aggregate(&ParticipantId::new("A"), Currency::Ngn)
        .await
        .unwrap();
    assert_eq!(a.direct_referral_count, 0);

    let again = t.ledger.rollback_event("e1", "refund").await.unwrap();
    assert_eq!(
        again,
        RollbackOutcome::AlreadyRolledBack {
            event_id: "e1".to_string()
        }
    );

    // Reconciliation never resurrects rolled-back entries.
    let run = t.ledger.run_reconciliation(ReconcileScope::All).await.unwrap();
    assert!(run.is_noop(), "unexpected actions: {:?}", run.actions_taken);
    assert_eq!(total(&t, "A").await, Decimal::zero());
}

#[tokio::test]
async fn scenario_e_reconciler_quarantines_injected_duplicate() {
    let t = setup(four_level_graph(), vec![schedule("15", "3", "2", 0)]).await;
    t.ledger
        .submit_purchase(purchase("e1", "P", "10000", 1_000))
        .await
        .unwrap();

    let pool = t.repo.pool();
    sqlx::query("DROP INDEX ux_commission_entries_active")
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(
        r#"
        INSERT INTO commission_entries
            (entry_id, event_id, generation, beneficiary_id, referred_id, amount, currency,
             rate_applied, status, created_at_ms)
        VALUES ('ce_injected', 'e1', 1, 'A', 'P', '1500', 'NGN', '0.15', 'active', ?)
        "#,
    )
    .bind(TimeMs::now().as_ms() + 1_000)
    .execute(pool)
    .await
    .unwrap();
    sqlx::query(
        "UPDATE beneficiary_aggregates SET total_earnings = '3000', g1_earnings = '3000' WHERE beneficiary_id = 'A'",
    )
    .execute(pool)
    .await
    .unwrap();
    assert_eq!(total(&t, "A").await, dec("3000"));

    let run = t
        .ledger
        .run_reconciliation(ReconcileScope::Beneficiary(ParticipantId::new("A")))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.actions_taken.iter().any(|a| matches!(
        a,
        Action::MarkedDuplicate { entry_id, .. } if entry_id == "ce_injected"
    )));
    assert!(run
        .issues_found
        .iter()
        .any(|i| matches!(i, Finding::DuplicateGroup { entry_ids, .. } if entry_ids.len() == 2)));
    assert!(run
        .issues_found
        .iter()
        .any(|i| matches!(i, Finding::AggregateDrift { .. })));

    assert_eq!(total(&t, "A").await, dec("1500"));
    let statuses: Vec<EntryStatus> = entries_of(&t, "A").await.iter().map(|e| e.status).collect();
    assert_eq!(statuses, vec![EntryStatus::Active, EntryStatus::Duplicate]);

    let journal = t.repo.get_reconciler_run(&run.run_id).await.unwrap().unwrap();
    assert_eq!(journal.issues_found, run.issues_found);

    let second = t
        .ledger
        .run_reconciliation(ReconcileScope::Beneficiary(ParticipantId::new("A")))
        .await
        .unwrap();
    assert!(second.is_noop(), "unexpected actions: {:?}", second.actions_taken);
}

#[tokio::test]
async fn scenario_f_schedule_changes_do_not_rewrite_history() {
    let participants = vec![
        Participant::new("P", "pat").referred_by("ann"),
        Participant::new("A", "ann"),
    ];
    let t = setup(
        participants,
        vec![schedule("15", "3", "2", 1_000), schedule("10", "2", "1", 2_000)],
    )
    .await;

    t.ledger
        .submit_purchase(purchase("e1", "P", "10000", 1_500))
        .await
        .unwrap();
    t.ledger
        .submit_purchase(purchase("e2", "P", "10000", 2_500))
        .await
        .unwrap();

    let entries = entries_of(&t, "A").await;
    let by_event = |id: &str| entries.iter().find(|e| e.event_id == id).unwrap().clone();
    assert_eq!(by_event("e1").amount, dec("1500"));
    assert_eq!(by_event("e1").rate_applied, dec("0.15"));
    assert_eq!(by_event("e2").amount, dec("1000"));
    assert_eq!(by_event("e2").rate_applied, dec("0.1"));

    let run = t.ledger.run_reconciliation(ReconcileScope::All).await.unwrap();
    assert!(run.is_noop());
    assert!(!run
        .issues_found
        .iter()
        .any(|i| matches!(i, Finding::AmountConflict { .. })));
    assert_eq!(total(&t, "A").await, dec("2500"));

    // Before the first schedule nothing is in force.
    let early = t
        .ledger
        .submit_purchase(purchase("e0", "P", "10000", 500))
        .await
        .unwrap();
    assert!(matches!(early, SubmitResult::Rejected { .. }));
}

#[tokio::test]
async fn suppressed_ancestor_keeps_generation_but_earns_nothing() {
    use refledger::domain::ParticipantStatus;

    let mut participants = four_level_graph();
    participants[2] = Participant::new("B", "bea")
        .referred_by("cal")
        .with_status(ParticipantStatus::Banned);
    let t = setup(participants, vec![schedule("15", "3", "2", 0)]).await;

    let result = t
        .ledger
        .submit_purchase(purchase("e1", "P", "10000", 1_000))
        .await
        .unwrap();
    let SubmitResult::Accepted { chain, outcome, .. } = &result else {
        panic!("expected accepted, got {:?}", result);
    };
    assert_eq!(chain.len(), 3);
    assert!(chain[1].suppressed);
    assert!(matches!(outcome, ApplyOutcome::Applied { count: 2, .. }));

    assert!(entries_of(&t, "B").await.is_empty());
    assert_eq!(total(&t, "C").await, dec("200"));
}

#[tokio::test]
async fn cleared_referrer_affects_only_later_purchases() {
    let t = setup(four_level_graph(), vec![schedule("15", "3", "2", 0)]).await;
    t.ledger
        .submit_purchase(purchase("e1", "P", "10000", 1_000))
        .await
        .unwrap();

    t.ledger.clear_referrer(&ParticipantId::new("A")).await.unwrap();
    t.ledger
        .submit_purchase(purchase("e2", "P", "10000", 1_000))
        .await
        .unwrap();

    assert_eq!(total(&t, "A").await, dec("3000"));
    assert_eq!(total(&t, "B").await, dec("300"));

    // e1 keeps its captured chain through reconciliation.
    let run = t.ledger.run_reconciliation(ReconcileScope::All).await.unwrap();
    assert!(run.is_noop(), "unexpected actions: {:?}", run.actions_taken);
}
