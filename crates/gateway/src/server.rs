//! Axum-based HTTP server for the gateway.

use axum::{
    extract::{rejection::JsonRejection, Json, MatchedPath, Path, Query, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Extension, Router,
};
use futures::{Stream, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use knowledge_hub_core::config::ServerConfig;
use knowledge_hub_core::{ChatRequest, Error, ProviderDescriptor, Result, Role, StreamChunk};
use knowledge_hub_governance::{summarize, track_request, AuditFilter, AuditRecord, AuditStore};

use crate::error::ApiError;
use crate::pipeline::{ChatOutcome, ChatPipeline, ChatStream};

/// Header carrying the client credential.
pub const API_KEY_HEADER: &str = "x-api-key";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const PROCESS_TIME_HEADER: &str = "x-process-time";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: ChatPipeline,
    /// Queryable audit store backing `/audit`.
    pub audit_store: Option<Arc<dyn AuditStore>>,
    pub environment: String,
}

/// Id assigned to every inbound request by the request-context middleware.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Gateway server.
pub struct GatewayServer {
    config: ServerConfig,
    state: AppState,
    metrics_handle: Option<PrometheusHandle>,
}

impl GatewayServer {
    pub fn new(config: ServerConfig, pipeline: ChatPipeline) -> Self {
        Self {
            config,
            state: AppState {
                pipeline,
                audit_store: None,
                environment: std::env::var("HUB_ENV").unwrap_or_else(|_| "development".to_string()),
            },
            metrics_handle: None,
        }
    }

    /// Expose an audit store on the admin endpoints.
    pub fn with_audit_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.state.audit_store = Some(store);
        self
    }

    /// Set metrics handle.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Build the Axum router.
    pub fn build_router(&self) -> Router {
        let mut router = Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/chat", post(chat_handler))
            .route("/chat/budget/:user_id", get(budget_handler))
            .route("/chat/:id", get(chat_status_handler).delete(delete_conversation_handler))
            .route("/audit", get(audit_handler))
            .route("/audit/summary", get(audit_summary_handler))
            .with_state(Arc::new(self.state.clone()));

        if let Some(handle) = &self.metrics_handle {
            let handle = handle.clone();
            router = router.route("/metrics", get(move || async move { handle.render() }));
        }

        router
            .layer(middleware::from_fn(request_context))
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer(&self.config.allowed_origins))
    }

    /// Run the server until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::internal(format!("Failed to bind {}: {}", addr, e)))?;

        tracing::info!(addr = %addr, "Gateway server starting");

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::internal(format!("Server error: {}", e)))?;

        tracing::info!("Gateway server stopped");
        Ok(())
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Assigns the request id, logs start and finish, and stamps the
/// `X-Request-ID` / `X-Process-Time` headers on every response.
async fn request_context(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    req.extensions_mut().insert(RequestId(request_id.clone()));

    tracing::info!(request_id = %request_id, method = %method, path = %path, "Request started");
    let started = Instant::now();

    let mut response = next.run(req).await;

    let elapsed = started.elapsed().as_secs_f64();
    let status = response.status().as_u16();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{:.6}", elapsed)) {
        headers.insert(HeaderName::from_static(PROCESS_TIME_HEADER), value);
    }

    track_request(&method, &path, status, elapsed);
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms = (elapsed * 1000.0) as u64,
        "Request finished"
    );
    response
}

fn credential(headers: &HeaderMap) -> Option<&str> {
    headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok())
}

// =============================================================================
// Response Types
// =============================================================================

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub version: String,
    pub environment: String,
}

/// Readiness response.
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub timestamp: String,
    pub dependencies: serde_json::Value,
    pub providers: Vec<ProviderDescriptor>,
}

/// Audit query response.
#[derive(Debug, Serialize)]
pub struct AuditResponse {
    pub count: usize,
    pub records: Vec<AuditRecord>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "name": "Knowledge Hub Gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "operational",
        "health": "/health",
    }))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        environment: state.environment.clone(),
    })
}

async fn liveness_handler() -> impl IntoResponse {
    Json(json!({ "status": "alive" }))
}

/// Ready while at least one provider can take a call.
async fn readiness_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.pipeline.router().registry();
    let ready = registry.any_available();

    let body = ReadinessResponse {
        status: if ready { "ready" } else { "not_ready" }.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        dependencies: json!({
            "llm_provider": if ready { "healthy" } else { "unavailable" },
            "audit_store": if state.audit_store.is_some() { "healthy" } else { "not_configured" },
        }),
        providers: registry.descriptors(),
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> std::result::Result<Response, ApiError> {
    let cred = credential(&headers);
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            state
                .pipeline
                .reject_malformed(&request_id, cred, &rejection.body_text())
                .await
                .map_err(|e| ApiError::new(e, &request_id))?;
            return Err(ApiError::malformed_body(rejection, &request_id));
        }
    };

    match state.pipeline.submit(&request_id, cred, request).await {
        Ok(ChatOutcome::Completed(reply)) => {
            Ok((StatusCode::ACCEPTED, Json(reply)).into_response())
        }
        Ok(ChatOutcome::Streaming(stream)) => Ok(sse_response(stream).into_response()),
        Err(e) => Err(ApiError::new(e, request_id)),
    }
}

/// `chunk` events, then one `done` or `error` event.
fn sse_response(
    stream: ChatStream,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let request_id = stream.request_id;
    let events = stream
        .chunks
        .map(move |chunk| Ok::<_, Infallible>(chunk_event(&request_id, chunk)));
    Sse::new(events).keep_alive(KeepAlive::default())
}

fn chunk_event(request_id: &str, chunk: StreamChunk) -> Event {
    match chunk {
        StreamChunk::Delta { text } => Event::default()
            .event("chunk")
            .data(json!({ "delta": text }).to_string()),
        StreamChunk::Done {
            provider,
            model,
            tokens,
            ..
        } => Event::default().event("done").data(
            json!({
                "request_id": request_id,
                "provider": provider,
                "model": model,
                "tokens_used": tokens.total_tokens,
            })
            .to_string(),
        ),
        StreamChunk::Error { message, .. } => Event::default().event("error").data(
            json!({
                "error": "stream_error",
                "message": message,
                "request_id": request_id,
            })
            .to_string(),
        ),
    }
}

async fn chat_status_handler(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    state
        .pipeline
        .request_status(credential(&headers), &id)
        .map(Json)
        .map_err(|e| ApiError::new(e, request_id))
}

/// `?user_id=` on a conversation delete.
#[derive(Debug, Default, Deserialize)]
pub struct ConversationOwner {
    pub user_id: Option<String>,
}

async fn delete_conversation_handler(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Query(owner): Query<ConversationOwner>,
) -> std::result::Result<StatusCode, ApiError> {
    state
        .pipeline
        .delete_conversation(
            &request_id,
            credential(&headers),
            &conversation_id,
            owner.user_id.as_deref(),
        )
        .await
        .map_err(|e| ApiError::new(e, &request_id))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn budget_handler(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    state
        .pipeline
        .budget(credential(&headers), &user_id)
        .map(Json)
        .map_err(|e| ApiError::new(e, request_id))
}

async fn audit_handler(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Query(filter): Query<AuditFilter>,
) -> std::result::Result<Json<AuditResponse>, ApiError> {
    let records = query_audit(&state, credential(&headers), filter)
        .await
        .map_err(|e| ApiError::new(e, request_id))?;
    Ok(Json(AuditResponse {
        count: records.len(),
        records,
    }))
}

async fn audit_summary_handler(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let records = query_audit(&state, credential(&headers), AuditFilter::default())
        .await
        .map_err(|e| ApiError::new(e, request_id))?;
    Ok(Json(summarize(&records)))
}

/// Admin-only read of the audit store.
async fn query_audit(
    state: &AppState,
    credential: Option<&str>,
    filter: AuditFilter,
) -> Result<Vec<AuditRecord>> {
    let ctx = state.pipeline.authorize(credential, Role::Admin)?;
    let store = state
        .audit_store
        .as_ref()
        .ok_or_else(|| Error::NotFound("audit store is not configured".to_string()))?;
    tracing::info!(subject = %ctx.subject, user_filter = ?filter.user_id, "Audit query");
    store.query(filter).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use knowledge_hub_core::TokenUsage;

    #[tokio::test]
    async fn test_liveness_handler() {
        let response = liveness_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_cors_layer_accepts_origin_list() {
        // Invalid header values are skipped rather than rejected.
        let _ = cors_layer(&["https://hub.example.com".to_string(), "bad\norigin".to_string()]);
        let _ = cors_layer(&["*".to_string()]);
    }

    #[test]
    fn test_credential_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(credential(&headers), None);
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("secret"));
        assert_eq!(credential(&headers), Some("secret"));
    }

    #[test]
    fn test_done_event_builds() {
        // Event has no public accessors; building must not panic on JSON payloads.
        let _ = chunk_event(
            "req-1",
            StreamChunk::Done {
                provider: "mock".into(),
                model: "gpt-4".into(),
                tokens: TokenUsage::new(10, 20),
                attempts: vec![],
            },
        );
        let _ = chunk_event("req-1", StreamChunk::error("provider \"down\""));
        let _ = chunk_event("req-1", StreamChunk::delta("line one\nline two"));
    }
}
