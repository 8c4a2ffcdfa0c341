//! Transaction handlers for the three variants, the retry controller that
//! governs them, and post-commit publication.

use rust_decimal::Decimal;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::balances;
use crate::database::{Database, PgTransaction};
use crate::errors::{LedgerError, Rejection, Result};
use crate::metrics::{REQUEST_OUTCOME_TOTAL, REQUEST_RETRIES_TOTAL};
use crate::models::{Event, LedgerTransaction, TransferContent, TxVariant};
use crate::outbox::Outbox;
use crate::validation::{self, RejectedRequest, TxRequest, Validated};
use crate::wire::{self, OutgoingEvent, SignedEvent};

/// A balance touched by a committed transaction, as it stood after commit.
#[derive(Debug, Clone)]
pub struct AffectedBalance {
    pub account_id: String,
    pub token_id: Uuid,
    pub token_name: String,
    pub amount: Decimal,
}

enum CommitOutcome {
    Committed {
        request: TxRequest,
        affected: Vec<AffectedBalance>,
    },
    Rejected(RejectedRequest),
}

pub struct Engine {
    db: Database,
    outbox: Arc<dyn Outbox>,
    minter: String,
    max_retries: u32,
    republish_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Engine {
    pub fn new(
        db: Database,
        outbox: Arc<dyn Outbox>,
        minter: String,
        max_retries: u32,
        republish_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Engine {
            db,
            outbox,
            minter,
            max_retries,
            republish_interval,
            shutdown,
        }
    }

    /// Drive one request to a terminal state. Deterministic rejections and
    /// successful commits finish in one pass; transient faults re-enter from
    /// the top, so the idempotency check and every validation step run again.
    pub async fn process(&self, variant: TxVariant, event: SignedEvent) {
        let request_id = event.id.clone();
        let max_attempts = self.max_retries.max(1);

        for attempt in 1..=max_attempts {
            match self.run_once(variant, event.clone()).await {
                Ok(outcome) => {
                    REQUEST_OUTCOME_TOTAL
                        .with_label_values(&[variant.short_name(), outcome])
                        .inc();
                    return;
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    REQUEST_RETRIES_TOTAL
                        .with_label_values(&[variant.short_name()])
                        .inc();
                    warn!(
                        "Transient fault on {} request {} (attempt {}/{}): {}",
                        variant, request_id, attempt, max_attempts, e
                    );
                }
                Err(e) => {
                    error!(
                        "Giving up on {} request {} after {} attempts: {}",
                        variant, request_id, attempt, e
                    );
                    break;
                }
            }
        }

        self.finalize_network_error(variant, &event).await;
        REQUEST_OUTCOME_TOTAL
            .with_label_values(&[variant.short_name(), "failed"])
            .inc();
    }

    async fn run_once(&self, variant: TxVariant, event: SignedEvent) -> Result<&'static str> {
        let request = match validation::validate(&self.db, variant, event).await? {
            Validated::Duplicate => {
                debug!("Dropping duplicate {} request", variant);
                return Ok("dropped");
            }
            Validated::Rejected(rejected) => {
                self.finalize_rejection(&rejected).await?;
                return Ok("rejected");
            }
            Validated::Request(request) => request,
        };

        // Mint and burn are reserved to the configured minter identity. This
        // check must come before any mutation.
        let authorisation = match variant {
            TxVariant::Inbound if request.sender != self.minter => {
                Some(Rejection::UnauthorizedMint)
            }
            TxVariant::Outbound if request.sender != self.minter => {
                Some(Rejection::UnauthorizedBurn)
            }
            _ => None,
        };
        if let Some(rejection) = authorisation {
            let rejected = request.into_rejected(rejection);
            self.finalize_rejection(&rejected).await?;
            return Ok("rejected");
        }

        match self.commit(request).await? {
            CommitOutcome::Rejected(rejected) => {
                self.finalize_rejection(&rejected).await?;
                Ok("rejected")
            }
            CommitOutcome::Committed { request, affected } => {
                info!(
                    "Committed {} request {} from {} touching {} balances",
                    request.variant,
                    request.event.id,
                    request.sender,
                    affected.len()
                );
                self.publish_success(&request, &affected).await;
                self.schedule_reannouncement(&request, &affected);
                Ok("committed")
            }
        }
    }

    /// Mutation phase: one serialisable transaction covering the event row,
    /// the transaction row, and every balance change.
    async fn commit(&self, request: TxRequest) -> Result<CommitOutcome> {
        let payload = serde_json::to_value(&request.content)?;
        let event_row = Event::from_wire(&request.event, &request.sender, payload.clone());

        let mut tx = self.db.begin_serializable().await?;
        self.db.insert_event_tx(&mut tx, &event_row).await?;
        let ledger_tx = self
            .db
            .insert_transaction_tx(&mut tx, request.tx_type.id, &request.event.id, &payload)
            .await?;

        let applied = match request.variant {
            TxVariant::Internal => self.apply_internal(&mut tx, &request, &ledger_tx).await,
            TxVariant::Inbound => self.apply_inbound(&mut tx, &request, &ledger_tx).await,
            TxVariant::Outbound => self.apply_outbound(&mut tx, &request, &ledger_tx).await,
        };

        match applied {
            Ok(affected) => {
                tx.commit().await?;
                Ok(CommitOutcome::Committed { request, affected })
            }
            Err(LedgerError::Rejected(rejection)) => {
                tx.rollback().await?;
                Ok(CommitOutcome::Rejected(request.into_rejected(rejection)))
            }
            Err(e) => Err(e),
        }
    }

    /// Sender debit, receiver credit, fresh balances for tokens the receiver
    /// has never held — in that order. Receiver balances are loaded after the
    /// debits so a self-transfer reads its own writes.
    async fn apply_internal(
        &self,
        tx: &mut PgTransaction,
        request: &TxRequest,
        ledger_tx: &LedgerTransaction,
    ) -> Result<Vec<AffectedBalance>> {
        let requested: Vec<(Uuid, Decimal)> =
            request.tokens.iter().map(|(t, a)| (t.id, *a)).collect();

        let sender_balances = self
            .db
            .balances_with_sufficiency(tx, &request.sender, &requested)
            .await?;
        if sender_balances.len() < request.tokens.len() {
            return Err(Rejection::InsufficientFunds.into());
        }

        let mut affected = Vec::new();
        for (token, amount) in &request.tokens {
            let balance = sender_balances
                .iter()
                .find(|b| b.token_id == token.id)
                .ok_or_else(|| {
                    LedgerError::Internal(format!("sender balance missing for '{}'", token.name))
                })?;
            let updated =
                balances::debit(tx, balance, *amount, ledger_tx.id, &request.event.id).await?;
            affected.push(AffectedBalance {
                account_id: updated.account_id,
                token_id: updated.token_id,
                token_name: token.name.clone(),
                amount: updated.amount,
            });
        }

        let token_ids: Vec<Uuid> = requested.iter().map(|(id, _)| *id).collect();
        let receiver_balances = self.db.balances_for(tx, &request.receiver, &token_ids).await?;

        for (token, amount) in &request.tokens {
            if let Some(balance) = receiver_balances.iter().find(|b| b.token_id == token.id) {
                let updated =
                    balances::credit(tx, balance, *amount, ledger_tx.id, &request.event.id).await?;
                affected.push(AffectedBalance {
                    account_id: updated.account_id,
                    token_id: updated.token_id,
                    token_name: token.name.clone(),
                    amount: updated.amount,
                });
            }
        }

        for (token, amount) in &request.tokens {
            if receiver_balances.iter().all(|b| b.token_id != token.id) {
                let created = balances::create_fresh(
                    tx,
                    &request.receiver,
                    token.id,
                    *amount,
                    ledger_tx.id,
                    &request.event.id,
                )
                .await?;
                affected.push(AffectedBalance {
                    account_id: created.account_id,
                    token_id: created.token_id,
                    token_name: token.name.clone(),
                    amount: created.amount,
                });
            }
        }

        Ok(affected)
    }

    /// Mint: credit the receiver's existing balances, create the rest.
    async fn apply_inbound(
        &self,
        tx: &mut PgTransaction,
        request: &TxRequest,
        ledger_tx: &LedgerTransaction,
    ) -> Result<Vec<AffectedBalance>> {
        let token_ids: Vec<Uuid> = request.tokens.iter().map(|(t, _)| t.id).collect();
        let receiver_balances = self.db.balances_for(tx, &request.receiver, &token_ids).await?;

        let mut affected = Vec::new();
        for (token, amount) in &request.tokens {
            if let Some(balance) = receiver_balances.iter().find(|b| b.token_id == token.id) {
                let updated =
                    balances::credit(tx, balance, *amount, ledger_tx.id, &request.event.id).await?;
                affected.push(AffectedBalance {
                    account_id: updated.account_id,
                    token_id: updated.token_id,
                    token_name: token.name.clone(),
                    amount: updated.amount,
                });
            }
        }
        for (token, amount) in &request.tokens {
            if receiver_balances.iter().all(|b| b.token_id != token.id) {
                let created = balances::create_fresh(
                    tx,
                    &request.receiver,
                    token.id,
                    *amount,
                    ledger_tx.id,
                    &request.event.id,
                )
                .await?;
                affected.push(AffectedBalance {
                    account_id: created.account_id,
                    token_id: created.token_id,
                    token_name: token.name.clone(),
                    amount: created.amount,
                });
            }
        }

        Ok(affected)
    }

    /// Burn: debit the author's balances after the sufficiency check.
    async fn apply_outbound(
        &self,
        tx: &mut PgTransaction,
        request: &TxRequest,
        ledger_tx: &LedgerTransaction,
    ) -> Result<Vec<AffectedBalance>> {
        let requested: Vec<(Uuid, Decimal)> =
            request.tokens.iter().map(|(t, a)| (t.id, *a)).collect();

        let sender_balances = self
            .db
            .balances_with_sufficiency(tx, &request.sender, &requested)
            .await?;
        if sender_balances.len() < request.tokens.len() {
            return Err(Rejection::InsufficientFunds.into());
        }

        let mut affected = Vec::new();
        for (token, amount) in &request.tokens {
            let balance = sender_balances
                .iter()
                .find(|b| b.token_id == token.id)
                .ok_or_else(|| {
                    LedgerError::Internal(format!("sender balance missing for '{}'", token.name))
                })?;
            let updated =
                balances::debit(tx, balance, *amount, ledger_tx.id, &request.event.id).await?;
            affected.push(AffectedBalance {
                account_id: updated.account_id,
                token_id: updated.token_id,
                token_name: token.name.clone(),
                amount: updated.amount,
            });
        }

        Ok(affected)
    }

    /// Persist the rejection's durable footprint, then publish the error
    /// outcome. Publication is best-effort; persistence failures propagate so
    /// the retry controller re-enters.
    async fn finalize_rejection(&self, rejected: &RejectedRequest) -> Result<()> {
        let event_row = Event::from_wire(&rejected.event, &rejected.sender, rejected.payload.clone());
        self.db.insert_event(&event_row).await?;

        warn!(
            "Rejected {} request {}: {}",
            rejected.variant,
            rejected.event.id,
            rejected.rejection.message()
        );

        let error_event = OutgoingEvent::outcome_error(
            rejected.variant,
            &rejected.sender,
            rejected.receiver.as_deref(),
            &rejected.event.id,
            rejected.rejection.message(),
        );
        if let Err(e) = self.outbox.publish(&error_event).await {
            error!(
                "Failed to publish error outcome for {}: {}",
                rejected.event.id, e
            );
        }

        Ok(())
    }

    /// Terminal path after retry exhaustion: persist the event so the request
    /// cannot replay, publish the network-error outcome. Everything here is
    /// best-effort; there is nothing left to retry with.
    async fn finalize_network_error(&self, variant: TxVariant, event: &SignedEvent) {
        let sender = wire::resolve_author(event).unwrap_or_else(|_| event.pubkey.clone());
        let receiver = event.recipient().map(str::to_string);
        let payload = serde_json::from_str::<TransferContent>(&event.content)
            .ok()
            .and_then(|content| serde_json::to_value(&content).ok())
            .unwrap_or_else(|| json!({}));

        let event_row = Event::from_wire(event, &sender, payload);
        if let Err(e) = self.db.insert_event(&event_row).await {
            error!("Failed to persist event {} after retry exhaustion: {}", event.id, e);
        }

        let error_event = OutgoingEvent::outcome_error(
            variant,
            &sender,
            receiver.as_deref(),
            &event.id,
            Rejection::NetworkError.message(),
        );
        if let Err(e) = self.outbox.publish(&error_event).await {
            error!("Failed to publish network-error outcome for {}: {}", event.id, e);
        }
    }

    /// Post-commit publication: one ok outcome, then one balance
    /// announcement per affected balance. Best-effort; the deferred
    /// re-announcement provides the authoritative follow-up.
    async fn publish_success(&self, request: &TxRequest, affected: &[AffectedBalance]) {
        let content = match serde_json::to_string(&request.content) {
            Ok(content) => content,
            Err(e) => {
                error!("Failed to serialize outcome content for {}: {}", request.event.id, e);
                "{}".to_string()
            }
        };

        let outcome = OutgoingEvent::outcome_ok(
            request.variant,
            &request.sender,
            &request.receiver,
            &request.event,
            content,
        );
        if let Err(e) = self.outbox.publish(&outcome).await {
            error!("Failed to publish ok outcome for {}: {}", request.event.id, e);
        }

        // One announcement per Balance. A self-transfer touches the same
        // (account, token) twice; the later entry carries the final amount.
        let final_per_balance: BTreeMap<(String, Uuid), &AffectedBalance> = affected
            .iter()
            .map(|b| ((b.account_id.clone(), b.token_id), b))
            .collect();

        for balance in final_per_balance.values() {
            let announcement = OutgoingEvent::balance_announcement(
                &balance.account_id,
                &balance.token_name,
                &balance.amount,
                &request.event.id,
            );
            if let Err(e) = self.outbox.publish(&announcement).await {
                error!(
                    "Failed to publish balance announcement for {} / {}: {}",
                    balance.account_id, balance.token_name, e
                );
            }
        }
    }

    /// Re-announce the affected balances after a fixed delay, from committed
    /// state. Compensates for out-of-order relay delivery of the first
    /// announcements. Skipped when shutdown is in progress.
    fn schedule_reannouncement(&self, request: &TxRequest, affected: &[AffectedBalance]) {
        let accounts: Vec<String> = affected
            .iter()
            .map(|b| b.account_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let token_ids: Vec<Uuid> = affected
            .iter()
            .map(|b| b.token_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let trigger = request.event.id.clone();

        let db = self.db.clone();
        let outbox = self.outbox.clone();
        let mut shutdown = self.shutdown.clone();
        let delay = self.republish_interval;

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => {
                    debug!("Skipping balance re-announcement for {}: shutting down", trigger);
                    return;
                }
            }

            match db.balances_with_names(&accounts, &token_ids).await {
                Ok(rows) => {
                    for row in rows {
                        let announcement = OutgoingEvent::balance_announcement(
                            &row.account_id,
                            &row.token_name,
                            &row.amount,
                            &trigger,
                        );
                        if let Err(e) = outbox.publish(&announcement).await {
                            error!(
                                "Failed to re-announce balance for {} / {}: {}",
                                row.account_id, row.token_name, e
                            );
                        }
                    }
                }
                Err(e) => error!("Failed to reload balances for re-announcement: {}", e),
            }
        });
    }
}
