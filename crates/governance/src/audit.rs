//! Audit trail for compliance and observability.
//!
//! Every request produces exactly one [`AuditRecord`]. Records are written
//! through [`AuditRecorder`], which fans out to any number of sinks and never
//! fails the caller: a sink error is logged and swallowed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use knowledge_hub_core::{Error, ProviderAttempt, Result};

pub const AUDIT_VERSION: &str = "1.0";
/// Event type of chat requests, the only records counted by [`summarize`].
pub const CHAT_REQUEST_EVENT: &str = "chat_request";

/// Final status of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Completed,
    RejectedAuth,
    RejectedValidation,
    RateLimited,
    BudgetExceeded,
    Failed,
    Timeout,
    Deleted,
    Cancelled,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::RejectedAuth => "rejected_auth",
            Self::RejectedValidation => "rejected_validation",
            Self::RateLimited => "rate_limited",
            Self::BudgetExceeded => "budget_exceeded",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Deleted => "deleted",
            Self::Cancelled => "cancelled",
        }
    }

    /// Rejected by governance before any provider was called.
    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            Self::RejectedAuth | Self::RejectedValidation | Self::RateLimited | Self::BudgetExceeded
        )
    }
}

/// Provider tried during routing, reduced to its error class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptedProvider {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
}

impl From<&ProviderAttempt> for AttemptedProvider {
    fn from(attempt: &ProviderAttempt) -> Self {
        Self {
            provider: attempt.provider.clone(),
            error_class: attempt.error.as_ref().map(|_| {
                serde_json::to_value(attempt.outcome)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "failed".to_string())
            }),
        }
    }
}

/// A single immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub user_id: String,
    pub role: String,
    pub request_id: String,
    pub action: String,
    pub status: AuditStatus,
    pub audit_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempted_providers: Vec<AttemptedProvider>,
}

impl AuditRecord {
    pub fn new(
        event_type: impl Into<String>,
        action: impl Into<String>,
        user_id: impl Into<String>,
        role: impl Into<String>,
        request_id: impl Into<String>,
        status: AuditStatus,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            user_id: user_id.into(),
            role: role.into(),
            request_id: request_id.into(),
            action: action.into(),
            status,
            audit_version: AUDIT_VERSION.to_string(),
            conversation_id: None,
            model: None,
            provider: None,
            tokens_used: None,
            latency_ms: None,
            cost_usd: None,
            injection_category: None,
            quota_decision: None,
            rejection_stage: None,
            rejection_reason: None,
            attempted_providers: Vec::new(),
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Routing and usage detail of a completed call.
    pub fn with_usage(
        mut self,
        provider: impl Into<String>,
        model: impl Into<String>,
        tokens_used: u64,
        cost_usd: f64,
    ) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self.tokens_used = Some(tokens_used);
        self.cost_usd = Some(cost_usd);
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_rejection(mut self, stage: impl Into<String>, reason: impl Into<String>) -> Self {
        self.rejection_stage = Some(stage.into());
        self.rejection_reason = Some(reason.into());
        self
    }

    pub fn with_injection_category(mut self, category: impl Into<String>) -> Self {
        self.injection_category = Some(category.into());
        self
    }

    pub fn with_quota_decision(mut self, decision: impl Into<String>) -> Self {
        self.quota_decision = Some(decision.into());
        self
    }

    pub fn with_attempts(mut self, attempts: &[ProviderAttempt]) -> Self {
        self.attempted_providers = attempts.iter().map(AttemptedProvider::from).collect();
        self
    }
}

/// Filter for querying audit records.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    pub user_id: Option<String>,
    pub action: Option<String>,
    pub status: Option<AuditStatus>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, record: &AuditRecord) -> bool {
        self.user_id.as_ref().map_or(true, |u| &record.user_id == u)
            && self.action.as_ref().map_or(true, |a| &record.action == a)
            && self.status.map_or(true, |s| record.status == s)
    }

    /// Newest first, truncated to `limit`.
    fn apply<'a>(
        &self,
        records: impl DoubleEndedIterator<Item = &'a AuditRecord>,
    ) -> Vec<AuditRecord> {
        let matching = records.rev().filter(|r| self.matches(r)).cloned();
        match self.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }
}

/// Destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, record: &AuditRecord) -> Result<()>;
}

/// Sink that can also answer queries.
#[async_trait]
pub trait AuditStore: AuditSink {
    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditRecord>>;
}

// =============================================================================
// Sinks
// =============================================================================

/// Emits each record as structured fields on the `audit` tracing target.
///
/// With the JSON formatter flattening events, every record is one flat JSON
/// object. Attempted providers are logged as `provider:error_class` pairs.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write(&self, record: &AuditRecord) -> Result<()> {
        let attempted = record
            .attempted_providers
            .iter()
            .map(|a| match &a.error_class {
                Some(class) => format!("{}:{}", a.provider, class),
                None => a.provider.clone(),
            })
            .collect::<Vec<_>>()
            .join(",");

        tracing::info!(
            target: "audit",
            timestamp = %record.timestamp.to_rfc3339(),
            event_type = %record.event_type,
            user_id = %record.user_id,
            role = %record.role,
            request_id = %record.request_id,
            action = %record.action,
            status = record.status.as_str(),
            audit_version = %record.audit_version,
            conversation_id = record.conversation_id.as_deref(),
            model = record.model.as_deref(),
            provider = record.provider.as_deref(),
            tokens_used = record.tokens_used,
            latency_ms = record.latency_ms,
            cost_usd = record.cost_usd,
            injection_category = record.injection_category.as_deref(),
            quota_decision = record.quota_decision.as_deref(),
            rejection_stage = record.rejection_stage.as_deref(),
            rejection_reason = record.rejection_reason.as_deref(),
            attempted_providers = (!attempted.is_empty()).then_some(attempted.as_str()),
            "audit_event"
        );
        Ok(())
    }
}

/// In-memory store used by tests and the admin audit endpoints.
#[derive(Default)]
pub struct InMemoryAuditStore {
    records: RwLock<Vec<AuditRecord>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// All records, oldest first.
    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }

    pub async fn summary(&self) -> AuditSummary {
        summarize(&self.records.read().await)
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditStore {
    async fn write(&self, record: &AuditRecord) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditRecord>> {
        let records = self.records.read().await;
        Ok(filter.apply(records.iter()))
    }
}

/// Append-only JSON-lines file.
pub struct FileAuditStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileAuditStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for FileAuditStore {
    async fn write(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::storage(format!("open {}: {}", self.path.display(), e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::storage(format!("write {}: {}", self.path.display(), e)))?;
        file.flush()
            .await
            .map_err(|e| Error::storage(format!("flush {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for FileAuditStore {
    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::storage(format!("read {}: {}", self.path.display(), e))),
        };

        let mut records = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<AuditRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(error = %e, "Skipping malformed audit line"),
            }
        }
        Ok(filter.apply(records.iter()))
    }
}

// =============================================================================
// Recorder
// =============================================================================

/// Fans each record out to every sink. Never fails the caller.
#[derive(Clone, Default)]
pub struct AuditRecorder {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub async fn record(&self, record: AuditRecord) {
        for sink in &self.sinks {
            if let Err(e) = sink.write(&record).await {
                tracing::warn!(
                    request_id = %record.request_id,
                    error = %e,
                    "Audit sink failed to write record"
                );
            }
        }
    }
}

// =============================================================================
// Summary
// =============================================================================

/// Aggregate view over a set of audit records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditSummary {
    pub total_requests: usize,
    pub completed: usize,
    pub blocked: usize,
    pub failed: usize,
    pub guardrail_hits: HashMap<String, usize>,
    pub unique_users: usize,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

/// Summarize chat requests. Other events, such as deletions, are skipped.
pub fn summarize(records: &[AuditRecord]) -> AuditSummary {
    let mut summary = AuditSummary::default();
    let mut users = HashSet::new();

    for record in records.iter().filter(|r| r.event_type == CHAT_REQUEST_EVENT) {
        summary.total_requests += 1;
        users.insert(record.user_id.as_str());
        match record.status {
            AuditStatus::Completed => summary.completed += 1,
            AuditStatus::Failed | AuditStatus::Timeout => summary.failed += 1,
            status if status.is_blocked() => summary.blocked += 1,
            _ => {}
        }
        if let Some(category) = &record.injection_category {
            *summary.guardrail_hits.entry(category.clone()).or_insert(0) += 1;
        }
        summary.total_tokens += record.tokens_used.unwrap_or(0);
        summary.total_cost_usd += record.cost_usd.unwrap_or(0.0);
    }

    summary.unique_users = users.len();
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use knowledge_hub_core::AttemptOutcome;

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn write(&self, _record: &AuditRecord) -> Result<()> {
            Err(Error::storage("disk full"))
        }
    }

    fn record(user: &str, status: AuditStatus) -> AuditRecord {
        let request_id = uuid::Uuid::new_v4().to_string();
        AuditRecord::new(CHAT_REQUEST_EVENT, "chat", user, "user", request_id, status)
    }

    /// Collects formatted log output.
    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Captured {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn test_in_memory_query() {
        let store = InMemoryAuditStore::new();
        store.write(&record("alice", AuditStatus::Completed)).await.unwrap();
        store.write(&record("bob", AuditStatus::RateLimited)).await.unwrap();
        store.write(&record("alice", AuditStatus::RejectedValidation)).await.unwrap();

        let alice = store
            .query(AuditFilter {
                user_id: Some("alice".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(alice.len(), 2);
        // Newest first
        assert_eq!(alice[0].status, AuditStatus::RejectedValidation);

        let limited = store
            .query(AuditFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_fail_recorder() {
        let store = Arc::new(InMemoryAuditStore::new());
        let recorder = AuditRecorder::new()
            .with_sink(Arc::new(FailingSink))
            .with_sink(store.clone());

        recorder.record(record("alice", AuditStatus::Completed)).await;
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_file_store_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuditStore::new(dir.path().join("audit.jsonl"));

        store.write(&record("alice", AuditStatus::Completed)).await.unwrap();
        store.write(&record("bob", AuditStatus::Deleted)).await.unwrap();

        let content = tokio::fs::read_to_string(store.path()).await.unwrap();
        assert_eq!(content.lines().count(), 2);
        let first: serde_json::Value =
            serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first["status"], "completed");
        assert_eq!(first["audit_version"], AUDIT_VERSION);
        assert!(first.get("model").is_none());

        let deleted = store
            .query(AuditFilter {
                status: Some(AuditStatus::Deleted),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].user_id, "bob");
    }

    #[test]
    fn test_attempts_keep_error_class_only() {
        let attempts = vec![
            ProviderAttempt {
                provider: "azure".into(),
                outcome: AttemptOutcome::TimedOut,
                error: Some("connect timeout to 10.0.0.5".into()),
                latency_ms: 30_000,
            },
            ProviderAttempt {
                provider: "openai".into(),
                outcome: AttemptOutcome::Succeeded,
                error: None,
                latency_ms: 800,
            },
        ];
        let record = record("alice", AuditStatus::Completed).with_attempts(&attempts);
        assert_eq!(record.attempted_providers[0].error_class.as_deref(), Some("timed_out"));
        assert_eq!(record.attempted_providers[1].error_class, None);
    }

    #[tokio::test]
    async fn test_tracing_sink_logs_flat_fields() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_writer(captured.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let attempts = vec![ProviderAttempt {
            provider: "openai".into(),
            outcome: AttemptOutcome::Failed,
            error: Some("503".into()),
            latency_ms: 12,
        }];
        let record = record("alice", AuditStatus::Failed)
            .with_conversation("conv_1")
            .with_rejection("routing", "provider_unavailable")
            .with_attempts(&attempts);
        TracingAuditSink.write(&record).await.unwrap();

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let line: serde_json::Value = serde_json::from_str(output.lines().next().unwrap()).unwrap();
        assert_eq!(line["target"], "audit");
        assert_eq!(line["message"], "audit_event");
        assert_eq!(line["user_id"], "alice");
        assert_eq!(line["status"], "failed");
        assert_eq!(line["conversation_id"], "conv_1");
        assert_eq!(line["rejection_reason"], "provider_unavailable");
        assert_eq!(line["attempted_providers"], "openai:failed");
        assert!(line.get("audit").is_none());
        assert!(line.get("model").is_none());
    }

    #[test]
    fn test_summarize() {
        let records = vec![
            record("alice", AuditStatus::Completed).with_usage("mock", "mock", 30, 0.0015),
            record("alice", AuditStatus::RejectedValidation)
                .with_injection_category("instruction-override"),
            record("bob", AuditStatus::RateLimited),
            record("carol", AuditStatus::Failed),
            AuditRecord::new(
                "conversation_delete",
                "delete_conversation",
                "dave",
                "user",
                "req-del",
                AuditStatus::Deleted,
            ),
        ];
        let summary = summarize(&records);
        assert_eq!(summary.total_requests, 4);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.blocked, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.unique_users, 3);
        assert_eq!(summary.total_tokens, 30);
        assert_eq!(summary.guardrail_hits.get("instruction-override"), Some(&1));
    }
}
