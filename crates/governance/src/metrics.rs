//! Prometheus metrics.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use knowledge_hub_core::{Error, Result};

/// Install the Prometheus recorder and return the render handle.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::internal(format!("Failed to install Prometheus recorder: {}", e)))?;

    tracing::info!("Prometheus metrics recorder initialized");
    Ok(handle)
}

/// HTTP request count and latency.
pub fn track_request(method: &str, path: &str, status: u16, latency_sec: f64) {
    metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string()
    )
    .record(latency_sec);
}

/// Chat pipeline outcome, labelled with the audit status.
pub fn track_chat_outcome(status: &str) {
    metrics::counter!("chat_requests_total", "status" => status.to_string()).increment(1);
}

pub fn track_tokens(provider: &str, model: &str, prompt: u64, completion: u64) {
    for (kind, count) in [("prompt", prompt), ("completion", completion)] {
        metrics::counter!(
            "llm_token_usage_total",
            "provider" => provider.to_string(),
            "model" => model.to_string(),
            "type" => kind
        )
        .increment(count);
    }
}

pub fn track_guardrail_rejection(category: &str) {
    metrics::counter!("guardrail_rejections_total", "category" => category.to_string())
        .increment(1);
}
