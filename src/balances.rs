//! Balance mutation primitives. Every function here runs inside the
//! caller-supplied database transaction; nothing commits.

use crate::database::PgTransaction;
use crate::errors::{Rejection, Result};
use crate::models::BalanceView;
use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

async fn append_snapshot(
    tx: &mut PgTransaction,
    balance: &BalanceView,
    new_amount: Decimal,
    delta: Decimal,
    transaction_id: Uuid,
    event_id: &str,
) -> Result<BalanceView> {
    let snapshot_id = Uuid::new_v4();

    sqlx::query(
        r#"
        INSERT INTO balance_snapshots
            (id, prev_snapshot_id, amount, delta, transaction_id, event_id,
             token_id, account_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(snapshot_id)
    .bind(balance.snapshot_id)
    .bind(new_amount)
    .bind(delta)
    .bind(transaction_id)
    .bind(event_id)
    .bind(balance.token_id)
    .bind(&balance.account_id)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE balances
        SET snapshot_id = $1, event_id = $2, updated_at = $3
        WHERE account_id = $4 AND token_id = $5
        "#,
    )
    .bind(snapshot_id)
    .bind(event_id)
    .bind(Utc::now())
    .bind(&balance.account_id)
    .bind(balance.token_id)
    .execute(&mut **tx)
    .await?;

    Ok(BalanceView {
        account_id: balance.account_id.clone(),
        token_id: balance.token_id,
        snapshot_id,
        event_id: event_id.to_string(),
        amount: new_amount,
    })
}

/// Debit an existing balance. The sufficiency predicate upstream should make
/// the underflow branch unreachable; it stays enforced here so a partial
/// debit can never commit.
pub async fn debit(
    tx: &mut PgTransaction,
    balance: &BalanceView,
    amount: Decimal,
    transaction_id: Uuid,
    event_id: &str,
) -> Result<BalanceView> {
    let new_amount = balance.amount - amount;
    if new_amount < Decimal::ZERO {
        return Err(Rejection::InsufficientFunds.into());
    }

    append_snapshot(tx, balance, new_amount, -amount, transaction_id, event_id).await
}

/// Credit an existing balance.
pub async fn credit(
    tx: &mut PgTransaction,
    balance: &BalanceView,
    amount: Decimal,
    transaction_id: Uuid,
    event_id: &str,
) -> Result<BalanceView> {
    let new_amount = balance.amount + amount;

    append_snapshot(tx, balance, new_amount, amount, transaction_id, event_id).await
}

/// First credit for a previously-unseen (account, token) pair. Balance and
/// root snapshot are written by one compound statement so both rows appear
/// together. A unique violation on the balance key means a concurrent unit
/// created the pair first; it propagates as a transient error and the retry
/// credits the existing row instead.
pub async fn create_fresh(
    tx: &mut PgTransaction,
    account_id: &str,
    token_id: Uuid,
    amount: Decimal,
    transaction_id: Uuid,
    event_id: &str,
) -> Result<BalanceView> {
    let snapshot_id = Uuid::new_v4();

    sqlx::query(
        r#"
        WITH snapshot AS (
            INSERT INTO balance_snapshots
                (id, prev_snapshot_id, amount, delta, transaction_id, event_id,
                 token_id, account_id, created_at)
            VALUES ($1, NULL, $2, $2, $3, $4, $5, $6, $7)
            RETURNING id
        )
        INSERT INTO balances (account_id, token_id, snapshot_id, event_id, created_at, updated_at)
        SELECT $6, $5, snapshot.id, $4, $7, $7 FROM snapshot
        "#,
    )
    .bind(snapshot_id)
    .bind(amount)
    .bind(transaction_id)
    .bind(event_id)
    .bind(token_id)
    .bind(account_id)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;

    Ok(BalanceView {
        account_id: account_id.to_string(),
        token_id,
        snapshot_id,
        event_id: event_id.to_string(),
        amount,
    })
}
