use dotenv::dotenv;
use ledger_engine::config::Config;
use ledger_engine::database::Database;
use ledger_engine::engine::Engine;
use ledger_engine::ingest::IngestAdapter;
use ledger_engine::outbox::NatsOutbox;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() {
    dotenv().ok();

    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let config = Config::from_env().expect("Failed to load configuration");
    config.validate().expect("Invalid configuration");

    info!("Starting ledger engine as {}", config.ledger.public_key);
    info!("Relays: {}", config.ledger.relays.join(", "));

    let db = Database::new(&config.database.url, config.database.max_connections)
        .await
        .expect("Failed to connect to database");

    db.verify_seeded()
        .await
        .expect("Ledger schema is not migrated and seeded");

    let nats = async_nats::connect(&config.nats.url)
        .await
        .expect("Failed to connect to NATS");
    info!("Connected to NATS at {}", config.nats.url);

    let outbox = Arc::new(NatsOutbox::new(nats.clone(), &config.nats.subject_prefix));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine = Arc::new(Engine::new(
        db.clone(),
        outbox,
        config.ledger.minter_public_key.clone(),
        config.ledger.max_retries,
        Duration::from_millis(config.ledger.republish_interval_ms),
        shutdown_rx.clone(),
    ));

    let ingest = Arc::new(IngestAdapter::new(
        nats,
        engine,
        config.ledger.public_key.clone(),
        config.nats.subject_prefix.clone(),
        config.ledger.freshness_window_secs,
        shutdown_rx,
    ));

    let consumers = ingest.start();
    info!("Ledger engine ready; consumers running");

    wait_for_signal().await;
    info!("Shutdown signal received; draining in-flight work");

    shutdown_tx.send(true).ok();
    for handle in consumers {
        handle.await.ok();
    }

    // Give spawned units a moment to commit or abort cleanly.
    tokio::time::sleep(Duration::from_millis(250)).await;
    info!("Ledger engine stopped");
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
