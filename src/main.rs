#![deny(unused)]
//! Knowledge Hub - Secure Enterprise LLM Gateway
//!
//! Authenticates, validates and meters chat requests before routing them to
//! the configured LLM providers, and keeps an audit trail of every request.

use std::sync::Arc;
use std::time::Duration;

use knowledge_hub_core::config::AppConfig;
use knowledge_hub_gateway::{ChatPipeline, GatewayServer};
use knowledge_hub_governance::{
    AuditRecorder, AuditStore, FileAuditStore, InMemoryAuditStore, TracingAuditSink,
};

/// Users idle this long lose their quota entry.
const QUOTA_IDLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Finished requests stay queryable by id this long.
const REQUEST_TTL: Duration = Duration::from_secs(60 * 60);
const CONVERSATION_IDLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const PRUNE_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    // Initialize tracing
    knowledge_hub_governance::configure_tracing(&config.logging)?;

    tracing::info!("Starting Knowledge Hub v{}", env!("CARGO_PKG_VERSION"));

    // =========================================================================
    // Observability (Metrics)
    // =========================================================================
    let metrics_handle = knowledge_hub_governance::setup_metrics_recorder()?;

    // =========================================================================
    // Audit trail
    // =========================================================================
    let mut recorder = AuditRecorder::new().with_sink(Arc::new(TracingAuditSink));

    let audit_store: Arc<dyn AuditStore> = match &config.audit.file_path {
        Some(path) => {
            tracing::info!(path = %path, "Initializing file audit store");
            Arc::new(FileAuditStore::new(path))
        }
        None => {
            tracing::info!("Initializing in-memory audit store");
            Arc::new(InMemoryAuditStore::new())
        }
    };
    recorder = recorder.with_sink(audit_store.clone());

    // =========================================================================
    // Pipeline: auth, validation, quota, providers
    // =========================================================================
    let pipeline = ChatPipeline::from_config(&config, recorder)?;

    tracing::info!(
        providers = pipeline.router().registry().len(),
        requests_per_minute = config.quota.requests_per_minute,
        daily_token_limit = config.quota.daily_token_limit,
        "Chat pipeline initialized"
    );

    let ledger = pipeline.ledger().clone();
    let requests = pipeline.requests().clone();
    let conversations = pipeline.conversations().clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            let quotas = ledger.prune_idle(QUOTA_IDLE_TTL);
            let finished = requests.prune_older_than(REQUEST_TTL);
            let idle = conversations.prune_idle(CONVERSATION_IDLE_TTL);
            if quotas + finished + idle > 0 {
                tracing::debug!(
                    quotas,
                    requests = finished,
                    conversations = idle,
                    "Pruned expired state"
                );
            }
        }
    });

    // =========================================================================
    // Gateway
    // =========================================================================
    let server = GatewayServer::new(config.server.clone(), pipeline)
        .with_audit_store(audit_store)
        .with_metrics(metrics_handle);

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "Gateway initialized"
    );

    server.run().await?;

    Ok(())
}
