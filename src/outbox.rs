use async_trait::async_trait;
use std::time::Instant;
use tracing::debug;

use crate::errors::{LedgerError, Result};
use crate::metrics::OUTBOX_PUBLISH_DURATION;
use crate::wire::OutgoingEvent;

/// One-way sink for fully-formed outgoing events. The external signer picks
/// them up, signs, and transmits; the engine treats delivery as best-effort.
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn publish(&self, event: &OutgoingEvent) -> Result<()>;
}

pub struct NatsOutbox {
    client: async_nats::Client,
    subject: String,
}

impl NatsOutbox {
    pub fn new(client: async_nats::Client, subject_prefix: &str) -> Self {
        NatsOutbox {
            client,
            subject: format!("{subject_prefix}.outbox.events"),
        }
    }
}

#[async_trait]
impl Outbox for NatsOutbox {
    async fn publish(&self, event: &OutgoingEvent) -> Result<()> {
        let start = Instant::now();
        let payload = serde_json::to_vec(event)?;

        self.client
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| LedgerError::Nats(format!("Failed to publish event: {e}")))?;

        OUTBOX_PUBLISH_DURATION
            .with_label_values(&[&event.kind.to_string()])
            .observe(start.elapsed().as_secs_f64());

        debug!("Published kind {} event to {}", event.kind, self.subject);

        Ok(())
    }
}
