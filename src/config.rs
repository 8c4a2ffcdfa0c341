use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub nats: NatsConfig,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NatsConfig {
    pub url: String,
    pub subject_prefix: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LedgerConfig {
    /// This ledger's public identity on the substrate.
    pub public_key: String,
    /// The single identity authorised to mint and burn.
    pub minter_public_key: String,
    /// Relay endpoints the external relay client fans in from.
    pub relays: Vec<String>,
    pub max_retries: u32,
    pub republish_interval_ms: u64,
    pub freshness_window_secs: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            .set_default("server.port", 8080)?
            .set_default("database.max_connections", 10)?
            .set_default("nats.url", "nats://127.0.0.1:4222")?
            .set_default("nats.subject_prefix", "ledger")?
            .set_default("ledger.relays", Vec::<String>::new())?
            .set_default("ledger.max_retries", 10)?
            .set_default("ledger.republish_interval_ms", 1000)?
            .set_default("ledger.freshness_window_secs", 86_000)?;

        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder
                .add_source(File::with_name(&format!("config/{}", environment)).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("LEDGER_ENGINE")
                .separator("__")
                .list_separator(","),
        );

        // Well-known environment variables
        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", db_url)?;
        }

        if let Ok(nats_url) = env::var("NATS_URL") {
            builder = builder.set_override("nats.url", nats_url)?;
        }

        if let Ok(public_key) = env::var("NOSTR_PUBLIC_KEY") {
            builder = builder.set_override("ledger.public_key", public_key)?;
        }

        if let Ok(minter) = env::var("MINTER_PUBLIC_KEY") {
            builder = builder.set_override("ledger.minter_public_key", minter)?;
        }

        if let Ok(relays) = env::var("NOSTR_RELAYS") {
            let relays: Vec<String> = relays
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
            builder = builder.set_override("ledger.relays", relays)?;
        }

        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL is required".to_string());
        }

        if self.nats.url.is_empty() {
            return Err("NATS URL is required".to_string());
        }

        if self.ledger.public_key.is_empty() {
            return Err("Ledger public key (NOSTR_PUBLIC_KEY) is required".to_string());
        }

        if self.ledger.minter_public_key.is_empty() {
            return Err("Minter public key (MINTER_PUBLIC_KEY) is required".to_string());
        }

        if self.ledger.relays.is_empty() {
            return Err("At least one relay (NOSTR_RELAYS) is required".to_string());
        }

        if self.ledger.max_retries == 0 {
            return Err("max_retries must be at least 1".to_string());
        }

        Ok(())
    }
}
