//! Scenario tests for the transaction engine.
//!
//! These tests require a migrated Postgres database reachable through
//! DATABASE_URL. They are marked as ignored and can be run with --ignored.

use async_trait::async_trait;
use chrono::Utc;
use ledger_engine::database::Database;
use ledger_engine::engine::Engine;
use ledger_engine::errors::Result;
use ledger_engine::models::TxVariant;
use ledger_engine::outbox::Outbox;
use ledger_engine::wire::{OutgoingEvent, SignedEvent, BALANCE_KIND, REQUEST_KIND};
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Collecting outbox: publication assertions without a bus.
#[derive(Default)]
struct MemoryOutbox {
    events: Mutex<Vec<OutgoingEvent>>,
}

impl MemoryOutbox {
    fn take(&self) -> Vec<OutgoingEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn snapshot(&self) -> Vec<OutgoingEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Outbox for MemoryOutbox {
    async fn publish(&self, event: &OutgoingEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct Harness {
    db: Database,
    outbox: Arc<MemoryOutbox>,
    engine: Engine,
    ledger: String,
    minter: String,
    _shutdown: watch::Sender<bool>,
}

fn identity() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

async fn harness() -> Harness {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a test database");
    let db = Database::new(&url, 5).await.unwrap();
    sqlx::migrate!("./migrations").run(db.pool()).await.ok();

    let outbox = Arc::new(MemoryOutbox::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let minter = identity();

    let engine = Engine::new(
        db.clone(),
        outbox.clone(),
        minter.clone(),
        10,
        Duration::from_millis(50),
        shutdown_rx,
    );

    Harness {
        db,
        outbox,
        engine,
        ledger: identity(),
        minter,
        _shutdown: shutdown_tx,
    }
}

async fn seed_token(db: &Database) -> (Uuid, String) {
    let id = Uuid::new_v4();
    let name = format!("tok-{}", Uuid::new_v4().simple());
    sqlx::query("INSERT INTO tokens (id, name) VALUES ($1, $2)")
        .bind(id)
        .bind(&name)
        .execute(db.pool())
        .await
        .unwrap();
    (id, name)
}

fn request(
    signer: &str,
    ledger: &str,
    receiver: &str,
    variant: TxVariant,
    content: String,
) -> SignedEvent {
    SignedEvent {
        id: format!("evt-{}", Uuid::new_v4().simple()),
        pubkey: signer.to_string(),
        created_at: Utc::now().timestamp(),
        kind: REQUEST_KIND,
        tags: vec![
            vec!["p".to_string(), ledger.to_string()],
            vec!["p".to_string(), receiver.to_string()],
            vec!["t".to_string(), variant.start_tag().to_string()],
        ],
        content,
        sig: "sig".to_string(),
    }
}

async fn balance_amount(db: &Database, account: &str, token_id: Uuid) -> Option<Decimal> {
    sqlx::query_scalar::<_, Decimal>(
        r#"
        SELECT s.amount
        FROM balances b
        JOIN balance_snapshots s ON s.id = b.snapshot_id
        WHERE b.account_id = $1 AND b.token_id = $2
        "#,
    )
    .bind(account)
    .bind(token_id)
    .fetch_optional(db.pool())
    .await
    .unwrap()
}

async fn transaction_count(db: &Database, event_id: &str) -> i64 {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM transactions WHERE event_id = $1")
        .bind(event_id)
        .fetch_one(db.pool())
        .await
        .unwrap()
}

/// Walk the snapshot chain from the balance head to the root, returning the
/// head amount and the sum of deltas along the chain.
async fn chain_delta_sum(db: &Database, account: &str, token_id: Uuid) -> (Decimal, Decimal) {
    let head: (Uuid, Decimal) = sqlx::query_as(
        r#"
        SELECT b.snapshot_id, s.amount
        FROM balances b
        JOIN balance_snapshots s ON s.id = b.snapshot_id
        WHERE b.account_id = $1 AND b.token_id = $2
        "#,
    )
    .bind(account)
    .bind(token_id)
    .fetch_one(db.pool())
    .await
    .unwrap();

    let mut sum = Decimal::ZERO;
    let mut cursor = Some(head.0);
    while let Some(snapshot_id) = cursor {
        let (delta, prev): (Decimal, Option<Uuid>) = sqlx::query_as(
            "SELECT delta, prev_snapshot_id FROM balance_snapshots WHERE id = $1",
        )
        .bind(snapshot_id)
        .fetch_one(db.pool())
        .await
        .unwrap();
        sum += delta;
        cursor = prev;
    }

    (head.1, sum)
}

fn has_type_tag(event: &OutgoingEvent, value: &str) -> bool {
    event
        .tags
        .iter()
        .any(|t| t.first().map(String::as_str) == Some("t") && t.get(1).map(String::as_str) == Some(value))
}

fn balance_events(events: &[OutgoingEvent]) -> usize {
    events.iter().filter(|e| e.kind == BALANCE_KIND).count()
}

async fn mint(h: &Harness, receiver: &str, token_name: &str, amount: u64) -> SignedEvent {
    let event = request(
        &h.minter,
        &h.ledger,
        receiver,
        TxVariant::Inbound,
        format!(r#"{{"tokens":{{"{token_name}":{amount}}}}}"#),
    );
    h.engine.process(TxVariant::Inbound, event.clone()).await;
    event
}

/// Wait out pending deferred re-announcements, then clear the outbox so the
/// next assertion window starts clean.
async fn drain(h: &Harness) {
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.outbox.take();
}

#[tokio::test]
#[ignore]
async fn simple_transfer_moves_funds_and_announces() {
    let h = harness().await;
    let (token_id, token_name) = seed_token(&h.db).await;
    let alice = identity();
    let bob = identity();

    mint(&h, &alice, &token_name, 100).await;
    drain(&h).await;

    let transfer = request(
        &alice,
        &h.ledger,
        &bob,
        TxVariant::Internal,
        format!(r#"{{"tokens":{{"{token_name}":40}}}}"#),
    );
    h.engine.process(TxVariant::Internal, transfer.clone()).await;

    assert_eq!(balance_amount(&h.db, &alice, token_id).await, Some(Decimal::from(60)));
    assert_eq!(balance_amount(&h.db, &bob, token_id).await, Some(Decimal::from(40)));

    let events = h.outbox.snapshot();
    assert!(events
        .iter()
        .any(|e| has_type_tag(e, "internal-transaction-ok")));
    assert_eq!(balance_events(&events), 2);

    // Deferred re-announcement fires after the republish interval.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let events = h.outbox.snapshot();
    assert_eq!(balance_events(&events), 4);

    // Snapshot chains stay consistent with the head amounts.
    let (amount, sum) = chain_delta_sum(&h.db, &alice, token_id).await;
    assert_eq!(amount, sum);
    let (amount, sum) = chain_delta_sum(&h.db, &bob, token_id).await;
    assert_eq!(amount, sum);
}

#[tokio::test]
#[ignore]
async fn insufficient_funds_rejects_without_mutation() {
    let h = harness().await;
    let (token_id, token_name) = seed_token(&h.db).await;
    let alice = identity();
    let bob = identity();

    mint(&h, &alice, &token_name, 10).await;
    drain(&h).await;

    let transfer = request(
        &alice,
        &h.ledger,
        &bob,
        TxVariant::Internal,
        format!(r#"{{"tokens":{{"{token_name}":40}}}}"#),
    );
    h.engine.process(TxVariant::Internal, transfer.clone()).await;

    assert_eq!(balance_amount(&h.db, &alice, token_id).await, Some(Decimal::from(10)));
    assert_eq!(balance_amount(&h.db, &bob, token_id).await, None);

    // The event is persisted so the request cannot replay, but no
    // transaction was committed.
    assert!(h.db.event_exists(&transfer.id).await.unwrap());
    assert_eq!(transaction_count(&h.db, &transfer.id).await, 0);

    let events = h.outbox.take();
    let error = events
        .iter()
        .find(|e| has_type_tag(e, "internal-transaction-error"))
        .expect("error outcome published");
    assert_eq!(error.content, r#"{"messages":["Not enough funds"]}"#);
    assert_eq!(balance_events(&events), 0);
}

#[tokio::test]
#[ignore]
async fn duplicate_delivery_is_silent() {
    let h = harness().await;
    let (token_id, token_name) = seed_token(&h.db).await;
    let alice = identity();
    let bob = identity();

    mint(&h, &alice, &token_name, 100).await;
    drain(&h).await;

    let transfer = request(
        &alice,
        &h.ledger,
        &bob,
        TxVariant::Internal,
        format!(r#"{{"tokens":{{"{token_name}":40}}}}"#),
    );
    h.engine.process(TxVariant::Internal, transfer.clone()).await;
    let first_pass = h.outbox.take();
    assert!(first_pass
        .iter()
        .any(|e| has_type_tag(e, "internal-transaction-ok")));

    h.engine.process(TxVariant::Internal, transfer.clone()).await;
    h.engine.process(TxVariant::Internal, transfer.clone()).await;

    assert_eq!(balance_amount(&h.db, &alice, token_id).await, Some(Decimal::from(60)));
    assert_eq!(balance_amount(&h.db, &bob, token_id).await, Some(Decimal::from(40)));
    assert_eq!(transaction_count(&h.db, &transfer.id).await, 1);

    // Replays publish no outcomes; the only balance events left are the
    // first commit's deferred re-announcements.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let replay_events = h.outbox.snapshot();
    assert_eq!(
        replay_events
            .iter()
            .filter(|e| e.kind == REQUEST_KIND)
            .count(),
        0
    );
    assert_eq!(balance_events(&replay_events), 2);
}

#[tokio::test]
#[ignore]
async fn mint_creates_fresh_balance_with_root_snapshot() {
    let h = harness().await;
    let (token_id, token_name) = seed_token(&h.db).await;
    let carol = identity();

    let event = mint(&h, &carol, &token_name, 1000).await;

    assert_eq!(balance_amount(&h.db, &carol, token_id).await, Some(Decimal::from(1000)));
    assert_eq!(transaction_count(&h.db, &event.id).await, 1);

    let (amount, sum) = chain_delta_sum(&h.db, &carol, token_id).await;
    assert_eq!(amount, Decimal::from(1000));
    assert_eq!(sum, Decimal::from(1000));

    let prev: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT s.prev_snapshot_id
        FROM balances b
        JOIN balance_snapshots s ON s.id = b.snapshot_id
        WHERE b.account_id = $1 AND b.token_id = $2
        "#,
    )
    .bind(&carol)
    .bind(token_id)
    .fetch_one(h.db.pool())
    .await
    .unwrap();
    assert!(prev.is_none());

    let events = h.outbox.take();
    assert!(events
        .iter()
        .any(|e| has_type_tag(e, "inbound-transaction-ok")));
}

#[tokio::test]
#[ignore]
async fn mint_by_non_minter_is_rejected_without_mutation() {
    let h = harness().await;
    let (token_id, token_name) = seed_token(&h.db).await;
    let mallory = identity();
    let carol = identity();

    let event = request(
        &mallory,
        &h.ledger,
        &carol,
        TxVariant::Inbound,
        format!(r#"{{"tokens":{{"{token_name}":1000}}}}"#),
    );
    h.engine.process(TxVariant::Inbound, event.clone()).await;

    assert_eq!(balance_amount(&h.db, &carol, token_id).await, None);
    assert!(h.db.event_exists(&event.id).await.unwrap());
    assert_eq!(transaction_count(&h.db, &event.id).await, 0);

    let events = h.outbox.take();
    let error = events
        .iter()
        .find(|e| has_type_tag(e, "inbound-transaction-error"))
        .expect("error outcome published");
    assert_eq!(error.content, r#"{"messages":["Author cannot mint this token"]}"#);
}

#[tokio::test]
#[ignore]
async fn multi_token_transfer_with_partial_deficit_is_atomic() {
    let h = harness().await;
    let (token1_id, token1) = seed_token(&h.db).await;
    let (token2_id, token2) = seed_token(&h.db).await;
    let alice = identity();
    let bob = identity();

    mint(&h, &alice, &token1, 100).await;
    mint(&h, &alice, &token2, 5).await;
    drain(&h).await;

    // BTreeMap ordering in content does not matter; build it by hand here.
    let transfer = request(
        &alice,
        &h.ledger,
        &bob,
        TxVariant::Internal,
        format!(r#"{{"tokens":{{"{token1}":50,"{token2}":10}}}}"#),
    );
    h.engine.process(TxVariant::Internal, transfer.clone()).await;

    assert_eq!(balance_amount(&h.db, &alice, token1_id).await, Some(Decimal::from(100)));
    assert_eq!(balance_amount(&h.db, &alice, token2_id).await, Some(Decimal::from(5)));
    assert_eq!(balance_amount(&h.db, &bob, token1_id).await, None);
    assert_eq!(balance_amount(&h.db, &bob, token2_id).await, None);

    assert!(h.db.event_exists(&transfer.id).await.unwrap());
    assert_eq!(transaction_count(&h.db, &transfer.id).await, 0);

    let events = h.outbox.take();
    let error = events
        .iter()
        .find(|e| has_type_tag(e, "internal-transaction-error"))
        .expect("error outcome published");
    assert_eq!(error.content, r#"{"messages":["Not enough funds"]}"#);
}

#[tokio::test]
#[ignore]
async fn burn_debits_the_minter() {
    let h = harness().await;
    let (token_id, token_name) = seed_token(&h.db).await;
    let receiver = identity();
    let minter = h.minter.clone();

    mint(&h, &minter, &token_name, 100).await;
    drain(&h).await;

    let burn = request(
        &minter,
        &h.ledger,
        &receiver,
        TxVariant::Outbound,
        format!(r#"{{"tokens":{{"{token_name}":40}}}}"#),
    );
    h.engine.process(TxVariant::Outbound, burn.clone()).await;

    assert_eq!(balance_amount(&h.db, &minter, token_id).await, Some(Decimal::from(60)));
    assert_eq!(transaction_count(&h.db, &burn.id).await, 1);

    let events = h.outbox.take();
    assert!(events
        .iter()
        .any(|e| has_type_tag(e, "outbound-transaction-ok")));
}

#[tokio::test]
#[ignore]
async fn unsupported_token_is_rejected() {
    let h = harness().await;
    let alice = identity();
    let bob = identity();

    let transfer = request(
        &alice,
        &h.ledger,
        &bob,
        TxVariant::Internal,
        r#"{"tokens":{"no-such-token":40}}"#.to_string(),
    );
    h.engine.process(TxVariant::Internal, transfer.clone()).await;

    assert!(h.db.event_exists(&transfer.id).await.unwrap());

    let events = h.outbox.take();
    let error = events
        .iter()
        .find(|e| has_type_tag(e, "internal-transaction-error"))
        .expect("error outcome published");
    assert_eq!(error.content, r#"{"messages":["Token not supported"]}"#);
}

#[tokio::test]
#[ignore]
async fn non_positive_amount_is_rejected() {
    let h = harness().await;
    let (_, token_name) = seed_token(&h.db).await;
    let alice = identity();
    let bob = identity();

    let transfer = request(
        &alice,
        &h.ledger,
        &bob,
        TxVariant::Internal,
        format!(r#"{{"tokens":{{"{token_name}":0}}}}"#),
    );
    h.engine.process(TxVariant::Internal, transfer.clone()).await;

    let events = h.outbox.take();
    let error = events
        .iter()
        .find(|e| has_type_tag(e, "internal-transaction-error"))
        .expect("error outcome published");
    assert_eq!(
        error.content,
        r#"{"messages":["Token amount must be a positive number"]}"#
    );
}

#[tokio::test]
#[ignore]
async fn unparsable_content_persists_event_with_empty_payload() {
    let h = harness().await;
    let alice = identity();
    let bob = identity();

    let transfer = request(
        &alice,
        &h.ledger,
        &bob,
        TxVariant::Internal,
        "not json".to_string(),
    );
    h.engine.process(TxVariant::Internal, transfer.clone()).await;

    assert!(h.db.event_exists(&transfer.id).await.unwrap());

    let payload: serde_json::Value =
        sqlx::query_scalar("SELECT payload FROM events WHERE id = $1")
            .bind(&transfer.id)
            .fetch_one(h.db.pool())
            .await
            .unwrap();
    assert_eq!(payload, serde_json::json!({}));

    let events = h.outbox.take();
    let error = events
        .iter()
        .find(|e| has_type_tag(e, "internal-transaction-error"))
        .expect("error outcome published");
    assert_eq!(error.content, r#"{"messages":["Unparsable content"]}"#);
}
