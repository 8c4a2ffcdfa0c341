//! Substrate wire format: signed request events coming in, event templates
//! going out. Signature verification and signing belong to the relay client;
//! this module only reads and assembles event structure.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::models::TxVariant;

/// Kind for transaction requests and outcomes.
pub const REQUEST_KIND: i32 = 1112;
/// Kind for parametrised-replaceable balance announcements.
pub const BALANCE_KIND: i32 = 31111;
/// Requests older than this are dropped at the subscription.
pub const FRESHNESS_WINDOW_SECS: i64 = 86_000;

/// A signed event as delivered by the relay client. The signature has already
/// been verified upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: i32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl SignedEvent {
    fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1).map(String::as_str))
    }

    pub fn p_tags(&self) -> Vec<&str> {
        self.tag_values("p").collect()
    }

    pub fn e_tags(&self) -> Vec<&str> {
        self.tag_values("e").collect()
    }

    /// First `t` tag value, the transaction-type marker.
    pub fn type_tag(&self) -> Option<&str> {
        self.tag_values("t").next()
    }

    /// The second `p` tag. The first one is the ledger's own identity, the
    /// subscription target.
    pub fn recipient(&self) -> Option<&str> {
        self.p_tags().get(1).copied()
    }

    fn delegation_tag(&self) -> Option<&Vec<String>> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some("delegation"))
    }
}

fn is_public_identity(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Resolve the request author: the delegator when a delegation tag is
/// present, the signer otherwise. `Err` means delegation was claimed but
/// could not be resolved.
pub fn resolve_author(event: &SignedEvent) -> Result<String, ()> {
    match event.delegation_tag() {
        None => Ok(event.pubkey.clone()),
        Some(tag) => {
            let delegator = tag.get(1).map(String::as_str).unwrap_or_default();
            if tag.len() >= 4 && is_public_identity(delegator) {
                Ok(delegator.to_string())
            } else {
                Err(())
            }
        }
    }
}

/// Subscription filter for one transaction variant. Serializes to the relay
/// REQ shape; `matches` re-applies the same predicate locally on delivery.
#[derive(Debug, Clone, Serialize)]
pub struct Filter {
    pub kinds: Vec<i32>,
    #[serde(rename = "#p")]
    pub recipients: Vec<String>,
    #[serde(rename = "#t")]
    pub types: Vec<String>,
    pub since: i64,
}

impl Filter {
    pub fn for_variant(variant: TxVariant, identity: &str, since: i64) -> Self {
        Filter {
            kinds: vec![REQUEST_KIND],
            recipients: vec![identity.to_string()],
            types: vec![variant.start_tag().to_string()],
            since,
        }
    }

    pub fn matches(&self, event: &SignedEvent) -> bool {
        self.kinds.contains(&event.kind)
            && event
                .p_tags()
                .first()
                .map(|p| self.recipients.iter().any(|r| r == p))
                .unwrap_or(false)
            && event
                .type_tag()
                .map(|t| self.types.iter().any(|ty| ty == t))
                .unwrap_or(false)
            && event.created_at >= self.since
    }
}

/// An outgoing event template, published to the outbox for the external
/// signer to sign and transmit. Tag lists are assembled complete at
/// construction; nothing appends to them afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingEvent {
    pub kind: i32,
    pub created_at: i64,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl OutgoingEvent {
    /// Success outcome: standard tag set plus every `e` tag carried over from
    /// the request, content echoing the request content.
    pub fn outcome_ok(
        variant: TxVariant,
        sender: &str,
        receiver: &str,
        request: &SignedEvent,
        content: String,
    ) -> Self {
        let mut tags = vec![
            vec!["p".to_string(), sender.to_string()],
            vec!["p".to_string(), receiver.to_string()],
            vec!["e".to_string(), request.id.clone()],
            vec!["t".to_string(), variant.ok_tag().to_string()],
        ];
        for carried in request.e_tags() {
            tags.push(vec!["e".to_string(), carried.to_string()]);
        }
        OutgoingEvent {
            kind: REQUEST_KIND,
            created_at: Utc::now().timestamp(),
            tags,
            content,
        }
    }

    /// Error outcome carrying the stable rejection reason.
    pub fn outcome_error(
        variant: TxVariant,
        sender: &str,
        receiver: Option<&str>,
        request_id: &str,
        reason: &str,
    ) -> Self {
        let mut tags = vec![vec!["p".to_string(), sender.to_string()]];
        if let Some(receiver) = receiver {
            tags.push(vec!["p".to_string(), receiver.to_string()]);
        }
        tags.push(vec!["e".to_string(), request_id.to_string()]);
        tags.push(vec!["t".to_string(), variant.error_tag().to_string()]);
        OutgoingEvent {
            kind: REQUEST_KIND,
            created_at: Utc::now().timestamp(),
            tags,
            content: json!({ "messages": [reason] }).to_string(),
        }
    }

    /// Balance announcement for one (account, token), addressed by a stable
    /// `d` tag so late subscribers see only the current value.
    pub fn balance_announcement(
        account: &str,
        token_name: &str,
        amount: &Decimal,
        trigger_event_id: &str,
    ) -> Self {
        OutgoingEvent {
            kind: BALANCE_KIND,
            created_at: Utc::now().timestamp(),
            tags: vec![
                vec!["p".to_string(), account.to_string()],
                vec!["d".to_string(), format!("balance:{token_name}:{account}")],
                vec!["e".to_string(), trigger_event_id.to_string()],
                vec!["amount".to_string(), amount.normalize().to_string()],
            ],
            content: "{}".to_string(),
        }
    }
}
