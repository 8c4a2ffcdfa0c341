use crate::errors::{LedgerError, Result};
use crate::models::{
    AnnouncedBalance, BalanceView, Event, LedgerTransaction, Token, TransactionType, TxVariant,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Postgres;
use std::time::Duration;
use uuid::Uuid;

pub type PgTransaction = sqlx::Transaction<'static, Postgres>;

/// Ledger store over Postgres. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Database { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fail fast if the migration tool has not seeded the transaction types.
    pub async fn verify_seeded(&self) -> Result<()> {
        for variant in TxVariant::ALL {
            if self.transaction_type(variant.descriptor()).await?.is_none() {
                return Err(LedgerError::Config(format!(
                    "transaction type '{}' is not seeded; run migrations first",
                    variant.descriptor()
                )));
            }
        }
        Ok(())
    }

    /// Open the mutation-phase transaction at serialisable isolation.
    pub async fn begin_serializable(&self) -> Result<PgTransaction> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Idempotency probe: has this request id been handled to finality?
    pub async fn event_exists(&self, event_id: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM events WHERE id = $1)")
                .bind(event_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(exists)
    }

    /// Persist the durable footprint of a terminal outcome outside any
    /// mutation transaction. Conflicts mean a concurrent delivery already
    /// finalised the same request; that is not an error.
    pub async fn insert_event(&self, event: &Event) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (id, signature, signer, author, kind, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&event.id)
        .bind(&event.signature)
        .bind(&event.signer)
        .bind(&event.author)
        .bind(event.kind)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist the request event inside the mutation transaction. A unique
    /// violation here means a concurrent duplicate won the commit race; it
    /// surfaces as a transient error and the retry drops at idempotency.
    pub async fn insert_event_tx(&self, tx: &mut PgTransaction, event: &Event) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (id, signature, signer, author, kind, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&event.id)
        .bind(&event.signature)
        .bind(&event.signer)
        .bind(&event.author)
        .bind(event.kind)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn insert_transaction_tx(
        &self,
        tx: &mut PgTransaction,
        transaction_type_id: Uuid,
        event_id: &str,
        payload: &serde_json::Value,
    ) -> Result<LedgerTransaction> {
        let row = sqlx::query_as::<_, LedgerTransaction>(
            r#"
            INSERT INTO transactions (id, transaction_type_id, event_id, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(transaction_type_id)
        .bind(event_id)
        .bind(payload)
        .bind(Utc::now())
        .fetch_one(&mut **tx)
        .await?;

        Ok(row)
    }

    pub async fn tokens_by_names(&self, names: &[String]) -> Result<Vec<Token>> {
        let tokens = sqlx::query_as::<_, Token>(
            r#"
            SELECT id, name FROM tokens WHERE name = ANY($1)
            "#,
        )
        .bind(names)
        .fetch_all(&self.pool)
        .await?;

        Ok(tokens)
    }

    pub async fn transaction_type(&self, descriptor: &str) -> Result<Option<TransactionType>> {
        let row = sqlx::query_as::<_, TransactionType>(
            r#"
            SELECT id, description FROM transaction_types WHERE description = $1
            "#,
        )
        .bind(descriptor)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Load an account's balances for the requested tokens, filtered to rows
    /// whose current amount covers the per-token requested amount. The caller
    /// compares cardinalities; a shortfall is its insufficient-funds signal.
    pub async fn balances_with_sufficiency(
        &self,
        tx: &mut PgTransaction,
        account_id: &str,
        requested: &[(Uuid, Decimal)],
    ) -> Result<Vec<BalanceView>> {
        let token_ids: Vec<Uuid> = requested.iter().map(|(id, _)| *id).collect();
        let amounts: Vec<Decimal> = requested.iter().map(|(_, amount)| *amount).collect();

        let balances = sqlx::query_as::<_, BalanceView>(
            r#"
            SELECT b.account_id, b.token_id, b.snapshot_id, b.event_id, s.amount
            FROM balances b
            JOIN balance_snapshots s ON s.id = b.snapshot_id
            JOIN UNNEST($2::uuid[], $3::numeric[]) AS req(token_id, amount)
              ON req.token_id = b.token_id
            WHERE b.account_id = $1 AND s.amount >= req.amount
            "#,
        )
        .bind(account_id)
        .bind(token_ids)
        .bind(amounts)
        .fetch_all(&mut **tx)
        .await?;

        Ok(balances)
    }

    /// Load an account's existing balances for a token set, no sufficiency
    /// predicate. Tokens absent from the result need a fresh balance.
    pub async fn balances_for(
        &self,
        tx: &mut PgTransaction,
        account_id: &str,
        token_ids: &[Uuid],
    ) -> Result<Vec<BalanceView>> {
        let balances = sqlx::query_as::<_, BalanceView>(
            r#"
            SELECT b.account_id, b.token_id, b.snapshot_id, b.event_id, s.amount
            FROM balances b
            JOIN balance_snapshots s ON s.id = b.snapshot_id
            WHERE b.account_id = $1 AND b.token_id = ANY($2)
            "#,
        )
        .bind(account_id)
        .bind(token_ids)
        .fetch_all(&mut **tx)
        .await?;

        Ok(balances)
    }

    /// Committed-state read used by balance re-announcement.
    pub async fn balances_with_names(
        &self,
        accounts: &[String],
        token_ids: &[Uuid],
    ) -> Result<Vec<AnnouncedBalance>> {
        let rows = sqlx::query_as::<_, AnnouncedBalance>(
            r#"
            SELECT b.account_id, t.name AS token_name, s.amount
            FROM balances b
            JOIN balance_snapshots s ON s.id = b.snapshot_id
            JOIN tokens t ON t.id = b.token_id
            WHERE b.account_id = ANY($1) AND b.token_id = ANY($2)
            "#,
        )
        .bind(accounts)
        .bind(token_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
