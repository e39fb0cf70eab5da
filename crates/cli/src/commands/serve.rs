//! `attune serve` — Start the HTTP API server.

use std::sync::Arc;

use attune_assembler::{
    AssemblerSettings, AuditWriter, ContextAssembler, SqliteAudit,
};
use attune_config::AppConfig;
use attune_gateway::ApiState;
use attune_inference::HttpInference;
use attune_knowledge::SqliteLinks;
use attune_ledger::{LedgerSettings, NaiveSummarizer, SqliteLedger};

pub async fn run(port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    let url = &config.database.url;
    let ledger_settings = LedgerSettings {
        retention_days: config.ledger.retention_days,
        summarize_every: config.ledger.summarize_every,
        summary_source_window: config.ledger.summary_source_window,
        recent_window: config.ledger.recent_window,
        append_retries: config.ledger.append_retries,
    };

    // All stores share one database file; each keeps its own small pool.
    let ledger = Arc::new(
        SqliteLedger::new(url, ledger_settings, Arc::new(NaiveSummarizer)).await?,
    );
    let examples = Arc::new(attune_curator::SqliteExamples::new(url).await?);
    let links = Arc::new(SqliteLinks::new(url).await?);
    let audit = Arc::new(SqliteAudit::new(url).await?);

    let (writer, _audit_task) = AuditWriter::spawn(
        audit.clone(),
        config.assembler.audit_buffer,
        config.assembler.audit_retries,
    );
    let assembler = ContextAssembler::new(
        ledger.clone(),
        examples.clone(),
        links.clone(),
        writer,
        AssemblerSettings {
            ranked_limit: config.curator.ranked_limit,
            turn_deadline_secs: config.assembler.turn_deadline_secs,
        },
    );
    let inference = Arc::new(HttpInference::new(
        &config.inference.base_url,
        config.inference.timeout_secs,
    ));

    println!("Attune Gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Database:  {url}");
    println!("   Inference: {}", config.inference.base_url);

    let state = Arc::new(ApiState {
        assembler,
        inference,
        ledger,
        examples,
        links,
        audit,
        export_limit: config.curator.export_limit,
    });
    attune_gateway::serve(state, &config.gateway.host, config.gateway.port).await?;

    Ok(())
}
