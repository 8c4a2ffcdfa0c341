use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::wire::SignedEvent;

/// The three transaction variants, with their derived tag strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxVariant {
    Internal,
    Inbound,
    Outbound,
}

impl TxVariant {
    pub const ALL: [TxVariant; 3] = [TxVariant::Internal, TxVariant::Inbound, TxVariant::Outbound];

    /// The transaction_types.description this variant resolves against.
    pub fn descriptor(&self) -> &'static str {
        match self {
            TxVariant::Internal => "internal-transaction",
            TxVariant::Inbound => "inbound-transaction",
            TxVariant::Outbound => "outbound-transaction",
        }
    }

    pub fn start_tag(&self) -> &'static str {
        match self {
            TxVariant::Internal => "internal-transaction-start",
            TxVariant::Inbound => "inbound-transaction-start",
            TxVariant::Outbound => "outbound-transaction-start",
        }
    }

    pub fn ok_tag(&self) -> &'static str {
        match self {
            TxVariant::Internal => "internal-transaction-ok",
            TxVariant::Inbound => "inbound-transaction-ok",
            TxVariant::Outbound => "outbound-transaction-ok",
        }
    }

    pub fn error_tag(&self) -> &'static str {
        match self {
            TxVariant::Internal => "internal-transaction-error",
            TxVariant::Inbound => "inbound-transaction-error",
            TxVariant::Outbound => "outbound-transaction-error",
        }
    }

    /// Short name used for bus subjects and metric labels.
    pub fn short_name(&self) -> &'static str {
        match self {
            TxVariant::Internal => "internal",
            TxVariant::Inbound => "inbound",
            TxVariant::Outbound => "outbound",
        }
    }
}

impl fmt::Display for TxVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.descriptor())
    }
}

/// A token amount carried in request content.
///
/// Wire amounts are integers. Deserialization goes through the raw JSON
/// number literal (serde_json's arbitrary_precision), so values are never
/// routed through f64, and fraction or exponent forms fail interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Amount(pub Decimal);

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let number = serde_json::Number::deserialize(deserializer)?;
        let literal = number.to_string();
        if literal.contains(['.', 'e', 'E']) {
            return Err(de::Error::custom("token amount must be an integer"));
        }
        Decimal::from_str(&literal)
            .map(Amount)
            .map_err(|e| de::Error::custom(format!("token amount out of range: {e}")))
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let value = self
            .0
            .normalize()
            .to_i128()
            .ok_or_else(|| serde::ser::Error::custom("amount is not an integer"))?;
        serializer.serialize_i128(value)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

/// Parsed request content.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TransferContent {
    pub tokens: BTreeMap<String, Amount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

/// Stored request event. Presence of a row is the idempotency key: the
/// request has been observed and handled to finality.
#[derive(Debug, Clone, FromRow)]
pub struct Event {
    pub id: String,
    pub signature: String,
    pub signer: String,
    pub author: String,
    pub kind: i32,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Build the durable row for a wire event, with the resolved author and
    /// the payload to persist (parsed content, or empty on parse failure).
    pub fn from_wire(event: &SignedEvent, author: &str, payload: serde_json::Value) -> Self {
        Event {
            id: event.id.clone(),
            signature: event.sig.clone(),
            signer: event.pubkey.clone(),
            author: author.to_string(),
            kind: event.kind,
            payload,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Token {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct TransactionType {
    pub id: Uuid,
    pub description: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub transaction_type_id: Uuid,
    pub event_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Current holding of one token by one account, joined with the amount held
/// by its latest snapshot.
#[derive(Debug, Clone, FromRow)]
pub struct BalanceView {
    pub account_id: String,
    pub token_id: Uuid,
    pub snapshot_id: Uuid,
    pub event_id: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, FromRow)]
pub struct BalanceSnapshot {
    pub id: Uuid,
    pub prev_snapshot_id: Option<Uuid>,
    pub amount: Decimal,
    pub delta: Decimal,
    pub transaction_id: Uuid,
    pub event_id: String,
    pub token_id: Uuid,
    pub account_id: String,
    pub created_at: DateTime<Utc>,
}

/// Read-side row used for balance announcements.
#[derive(Debug, Clone, FromRow)]
pub struct AnnouncedBalance {
    pub account_id: String,
    pub token_name: String,
    pub amount: Decimal,
}
