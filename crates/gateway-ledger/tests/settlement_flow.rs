//! End-to-end settlement flow through the async database handle.
//!
//! Exercises the contract the gateway host relies on: the settlement runs
//! inside the same transaction as the host's own persistence, commits with
//! it, and rolls back with it.

use gateway_ledger::{
    BillingRates, Database, LedgerError, TurnSettlement, TurnStatus, UsageLedger,
};

fn settlement(association_no: &str) -> TurnSettlement {
    TurnSettlement {
        user_id: "tenant-7".into(),
        source: "chat".into(),
        association_no: association_no.into(),
        prompt_tokens: 4000,
        completion_tokens: 2000,
        status: TurnStatus::Completed,
    }
}

async fn setup() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().await.unwrap();
    db.execute(|conn| UsageLedger::credit(conn, "tenant-7", 50))
        .await
        .unwrap();
    db
}

#[tokio::test]
async fn settlement_commits_with_host_persistence() {
    let db = setup().await;
    let ledger = UsageLedger::new(BillingRates::default());

    let record = db
        .execute_mut(move |conn| {
            let tx = conn.transaction()?;

            // Host-side persistence shares the transaction; here a stand-in
            // table plays the part of the conversation store.
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS turn_log (association_no TEXT PRIMARY KEY);",
            )?;
            tx.execute(
                "INSERT INTO turn_log (association_no) VALUES ('turn-1')",
                [],
            )?;

            let record = ledger.settle(&tx, &settlement("turn-1"))?;
            tx.commit()?;
            Ok(record)
        })
        .await
        .unwrap();

    // 4000 * 1/1k + 2000 * 2/1k = 8.
    assert_eq!(record.amount, 8);

    let balance = db
        .execute(|conn| UsageLedger::balance(conn, "tenant-7"))
        .await
        .unwrap();
    assert_eq!(balance, 42);
}

#[tokio::test]
async fn settlement_rolls_back_with_host_persistence() {
    let db = setup().await;
    let ledger = UsageLedger::new(BillingRates::default());

    let result: Result<(), LedgerError> = db
        .execute_mut(move |conn| {
            let tx = conn.transaction()?;
            ledger.settle(&tx, &settlement("turn-1"))?;

            // The host's own write fails after the deduction; the whole
            // transaction unwinds.
            Err(LedgerError::InvalidArgument(
                "conversation persistence failed".into(),
            ))
        })
        .await;
    assert!(result.is_err());

    let balance = db
        .execute(|conn| UsageLedger::balance(conn, "tenant-7"))
        .await
        .unwrap();
    assert_eq!(balance, 50);

    let records = db
        .execute(|conn| UsageLedger::records_for_user(conn, "tenant-7"))
        .await
        .unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn client_retry_with_same_turn_identity_settles_once() {
    let db = setup().await;

    for _ in 0..3 {
        let ledger = UsageLedger::new(BillingRates::default());
        db.execute_mut(move |conn| {
            let tx = conn.transaction()?;
            let record = ledger.settle(&tx, &settlement("turn-1"))?;
            tx.commit()?;
            Ok(record)
        })
        .await
        .unwrap();
    }

    let balance = db
        .execute(|conn| UsageLedger::balance(conn, "tenant-7"))
        .await
        .unwrap();
    assert_eq!(balance, 42);

    let records = db
        .execute(|conn| UsageLedger::records_for_user(conn, "tenant-7"))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn concurrent_turns_cannot_both_spend_a_stale_balance() {
    let db = setup().await;

    // Two turns that each cost 30 against a balance of 50: exactly one may
    // succeed.  The conditional update decides under SQLite's write lock.
    let mut results = Vec::new();
    for turn in ["turn-a", "turn-b"] {
        let ledger = UsageLedger::new(BillingRates::default());
        let mut s = settlement(turn);
        s.prompt_tokens = 30_000;
        s.completion_tokens = 0;

        let result = db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let record = ledger.settle(&tx, &s)?;
                tx.commit()?;
                Ok(record)
            })
            .await;
        results.push(result);
    }

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1);
    assert!(matches!(
        results.iter().find(|r| r.is_err()),
        Some(Err(LedgerError::InsufficientBalance { .. }))
    ));

    let balance = db
        .execute(|conn| UsageLedger::balance(conn, "tenant-7"))
        .await
        .unwrap();
    assert_eq!(balance, 20);
}
