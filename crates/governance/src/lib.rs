#![deny(unused)]
//! Request governance for the Knowledge Hub gateway.
//!
//! This crate provides:
//! - API key authentication and role checks
//! - Request validation and prompt-injection detection
//! - Per-user rate limits and token budgets
//! - Audit recording
//! - Tracing and metrics setup

pub mod audit;
pub mod auth;
pub mod guardrails;
pub mod metrics;
pub mod quota;
pub mod tracing_layer;
pub mod validator;

pub use audit::{
    summarize, AttemptedProvider, AuditFilter, AuditRecord, AuditRecorder, AuditSink, AuditStatus,
    AuditStore, AuditSummary, FileAuditStore, InMemoryAuditStore, TracingAuditSink,
    CHAT_REQUEST_EVENT,
};
pub use auth::{require_role, ApiKeyAuthenticator};
pub use guardrails::{InjectionDetector, InjectionRule, DEFAULT_RULES};
pub use metrics::{
    setup_metrics_recorder, track_chat_outcome, track_guardrail_rejection, track_request,
    track_tokens,
};
pub use quota::{QuotaLedger, QuotaPolicy};
pub use tracing_layer::configure_tracing;
pub use validator::RequestValidator;
