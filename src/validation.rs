//! Shared pre-validation pipeline. Check order is fixed and significant:
//! idempotency, content parse, authorship, recipient, amount sanity, token
//! existence, transaction-type existence.

use rust_decimal::Decimal;
use serde_json::json;

use crate::database::Database;
use crate::errors::{Rejection, Result};
use crate::models::{Token, TransactionType, TransferContent, TxVariant};
use crate::wire::{self, SignedEvent};

/// A request that passed every shared check.
#[derive(Debug, Clone)]
pub struct TxRequest {
    pub variant: TxVariant,
    pub event: SignedEvent,
    /// Resolved author: delegator when delegated, signer otherwise.
    pub sender: String,
    pub receiver: String,
    pub content: TransferContent,
    /// Resolved token rows paired with the requested per-token amount.
    pub tokens: Vec<(Token, Decimal)>,
    pub tx_type: TransactionType,
}

/// Context for a deterministic rejection: enough to persist the event row
/// and address the error outcome.
#[derive(Debug, Clone)]
pub struct RejectedRequest {
    pub variant: TxVariant,
    pub event: SignedEvent,
    pub sender: String,
    pub receiver: Option<String>,
    pub payload: serde_json::Value,
    pub rejection: Rejection,
}

#[derive(Debug)]
pub enum Validated {
    /// The event id is already on record; drop silently.
    Duplicate,
    Rejected(RejectedRequest),
    Request(TxRequest),
}

pub async fn validate(
    db: &Database,
    variant: TxVariant,
    event: SignedEvent,
) -> Result<Validated> {
    // 1. Idempotency
    if db.event_exists(&event.id).await? {
        return Ok(Validated::Duplicate);
    }

    let receiver = event.recipient().map(str::to_string);

    // 2. Content parse. The event is persisted with an empty payload when the
    //    content cannot be interpreted.
    let content: TransferContent = match serde_json::from_str(&event.content) {
        Ok(content) => content,
        Err(_) => {
            let sender = wire::resolve_author(&event).unwrap_or_else(|_| event.pubkey.clone());
            return Ok(Validated::Rejected(RejectedRequest {
                variant,
                event,
                sender,
                receiver,
                payload: json!({}),
                rejection: Rejection::UnparsableContent,
            }));
        }
    };

    let payload = serde_json::to_value(&content)?;

    if content.tokens.is_empty() {
        let sender = wire::resolve_author(&event).unwrap_or_else(|_| event.pubkey.clone());
        return Ok(Validated::Rejected(RejectedRequest {
            variant,
            event,
            sender,
            receiver,
            payload,
            rejection: Rejection::UnparsableContent,
        }));
    }

    // 3. Authorship. An unresolvable delegation claim rejects with the
    //    signer recorded as sender.
    let sender = match wire::resolve_author(&event) {
        Ok(author) => author,
        Err(()) => {
            let sender = event.pubkey.clone();
            return Ok(Validated::Rejected(RejectedRequest {
                variant,
                event,
                sender,
                receiver,
                payload,
                rejection: Rejection::BadDelegation,
            }));
        }
    };

    // 4. Recipient: the second p tag. The first is this ledger's identity.
    let receiver = match receiver {
        Some(receiver) => receiver,
        None => {
            return Ok(Validated::Rejected(RejectedRequest {
                variant,
                event,
                sender,
                receiver: None,
                payload,
                rejection: Rejection::UnparsableContent,
            }));
        }
    };

    // 5. Amount sanity
    if content.tokens.values().any(|amount| amount.0 <= Decimal::ZERO) {
        return Ok(Validated::Rejected(RejectedRequest {
            variant,
            event,
            sender,
            receiver: Some(receiver),
            payload,
            rejection: Rejection::NonPositiveAmount,
        }));
    }

    // 6. Token existence
    let names: Vec<String> = content.tokens.keys().cloned().collect();
    let rows = db.tokens_by_names(&names).await?;
    if rows.len() < names.len() {
        return Ok(Validated::Rejected(RejectedRequest {
            variant,
            event,
            sender,
            receiver: Some(receiver),
            payload,
            rejection: Rejection::UnsupportedToken,
        }));
    }

    let mut by_name: std::collections::HashMap<String, Token> =
        rows.into_iter().map(|token| (token.name.clone(), token)).collect();
    let mut tokens: Vec<(Token, Decimal)> = Vec::with_capacity(content.tokens.len());
    for (name, amount) in &content.tokens {
        let token = by_name
            .remove(name)
            .ok_or_else(|| crate::errors::LedgerError::Internal(format!("token row missing for '{name}'")))?;
        tokens.push((token, amount.0));
    }

    // 7. Transaction-type existence
    let tx_type = match db.transaction_type(variant.descriptor()).await? {
        Some(tx_type) => tx_type,
        None => {
            return Ok(Validated::Rejected(RejectedRequest {
                variant,
                event,
                sender,
                receiver: Some(receiver),
                payload,
                rejection: Rejection::UnsupportedType,
            }));
        }
    };

    Ok(Validated::Request(TxRequest {
        variant,
        event,
        sender,
        receiver,
        content,
        tokens,
        tx_type,
    }))
}

impl TxRequest {
    /// Downgrade a validated request into rejection context, for checks that
    /// fail after the shared pipeline (authorisation, sufficiency).
    pub fn into_rejected(self, rejection: Rejection) -> RejectedRequest {
        let payload = serde_json::to_value(&self.content).unwrap_or_else(|_| json!({}));
        RejectedRequest {
            variant: self.variant,
            event: self.event,
            sender: self.sender,
            receiver: Some(self.receiver),
            payload,
            rejection,
        }
    }
}
