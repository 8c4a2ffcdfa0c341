//! Event ingest adapter. One subscription per transaction variant; every
//! matching event becomes an independent unit of work on the engine.

use chrono::Utc;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::errors::{LedgerError, Result};
use crate::metrics::REQUESTS_RECEIVED_TOTAL;
use crate::models::TxVariant;
use crate::wire::{Filter, SignedEvent};

pub struct IngestAdapter {
    client: async_nats::Client,
    engine: Arc<Engine>,
    identity: String,
    subject_prefix: String,
    freshness_window_secs: i64,
    shutdown: watch::Receiver<bool>,
}

impl IngestAdapter {
    pub fn new(
        client: async_nats::Client,
        engine: Arc<Engine>,
        identity: String,
        subject_prefix: String,
        freshness_window_secs: i64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        IngestAdapter {
            client,
            engine,
            identity,
            subject_prefix,
            freshness_window_secs,
            shutdown,
        }
    }

    /// Spawn one consumer task per variant. Tasks exit on shutdown.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        TxVariant::ALL
            .into_iter()
            .map(|variant| {
                let adapter = self.clone();
                tokio::spawn(async move { adapter.consume_variant(variant).await })
            })
            .collect()
    }

    async fn consume_variant(&self, variant: TxVariant) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.consume_once(variant).await {
                Ok(()) => break, // clean exit on shutdown
                Err(e) => {
                    error!(
                        "{} consumer error: {}. Restarting in 5 seconds...",
                        variant.short_name(),
                        e
                    );
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
                        _ = shutdown.wait_for(|stop| *stop) => break,
                    }
                }
            }
        }

        info!("{} consumer stopped", variant.short_name());
    }

    async fn consume_once(&self, variant: TxVariant) -> Result<()> {
        let subject = format!("{}.requests.{}", self.subject_prefix, variant.short_name());
        let mut subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| LedgerError::Nats(format!("subscribe failed: {e}")))?;

        info!("Subscribed to {}", subject);

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
                message = subscriber.next() => {
                    let message = match message {
                        Some(message) => message,
                        None => return Err(LedgerError::Nats("subscription ended".to_string())),
                    };

                    match serde_json::from_slice::<SignedEvent>(&message.payload) {
                        Ok(event) => self.dispatch(variant, event),
                        Err(e) => warn!("Failed to parse inbound event on {}: {}", subject, e),
                    }
                }
            }
        }
    }

    /// Re-apply the subscription filter locally, then hand the event to the
    /// engine as its own unit of work.
    fn dispatch(&self, variant: TxVariant, event: SignedEvent) {
        let since = Utc::now().timestamp() - self.freshness_window_secs;
        let filter = Filter::for_variant(variant, &self.identity, since);

        if !filter.matches(&event) {
            debug!("Dropping non-matching event {}", event.id);
            return;
        }

        REQUESTS_RECEIVED_TOTAL
            .with_label_values(&[variant.short_name()])
            .inc();

        let engine = self.engine.clone();
        tokio::spawn(async move {
            engine.process(variant, event).await;
        });
    }
}
