//! `attune sweep` — Physically remove expired conversation ledgers.

use std::sync::Arc;

use attune_config::AppConfig;
use attune_core::ledger::LedgerStore;
use attune_ledger::{LedgerSettings, NaiveSummarizer, SqliteLedger};

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    let settings = LedgerSettings {
        retention_days: config.ledger.retention_days,
        ..LedgerSettings::default()
    };
    let ledger =
        SqliteLedger::new(&config.database.url, settings, Arc::new(NaiveSummarizer)).await?;

    let removed = ledger.sweep_expired().await?;
    println!("Swept {removed} expired ledgers from {}", config.database.url);

    Ok(())
}
