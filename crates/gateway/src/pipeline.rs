//! Chat request pipeline.
//!
//! `Received → Authenticated → Validated → Admitted → Routed → Completed`.
//! Any stage may reject; a rejection skips everything downstream but is
//! still audited. Quota admission happens before, and consumption after, the
//! provider call, so no lock is held while waiting on the network.

use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use knowledge_hub_core::config::AppConfig;
use knowledge_hub_core::prompts::build_chat_messages;
use knowledge_hub_core::{
    AdmissionDecision, AuthContext, BudgetDecision, ChatMessage, ChatRequest, CompletionResult,
    Error, ProviderAttempt, QuotaSnapshot, Result, Role, StreamChunk, TokenUsage,
};
use knowledge_hub_governance::{
    require_role, track_chat_outcome, track_guardrail_rejection, track_tokens, ApiKeyAuthenticator,
    AuditRecord, AuditRecorder, AuditStatus, QuotaLedger, QuotaPolicy, RequestValidator,
    CHAT_REQUEST_EVENT,
};
use knowledge_hub_model_gateway::{build_router, ChunkStream, ProviderRouter};

use crate::store::{ConversationStore, RequestRecord, RequestStatus, RequestStore};

pub const CHAT_EVENT: &str = CHAT_REQUEST_EVENT;
pub const CHAT_ACTION: &str = "chat";
pub const DELETE_EVENT: &str = "conversation_delete";
pub const DELETE_ACTION: &str = "delete_conversation";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const UNKNOWN: &str = "unknown";

/// Remaining quota, returned with every completed chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub requests_remaining: u32,
    pub tokens_remaining: u64,
}

/// Answer to a non-streamed chat request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub status: RequestStatus,
    pub request_id: String,
    pub conversation_id: String,
    pub message: String,
    pub model: String,
    pub provider: String,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub processing_time_ms: u64,
    pub rate_limit: RateLimitInfo,
}

/// A streamed answer. Chunks end with `Done` or `Error`.
pub struct ChatStream {
    pub request_id: String,
    pub conversation_id: String,
    pub requests_remaining: u32,
    pub chunks: ChunkStream,
}

pub enum ChatOutcome {
    Completed(ChatReply),
    Streaming(ChatStream),
}

/// Identity of an admitted request, carried to whichever stage finishes it.
#[derive(Debug, Clone)]
struct Admitted {
    request_id: String,
    user_id: String,
    role: Role,
    conversation_id: String,
    question: String,
    requests_remaining: u32,
    started: Instant,
}

impl Admitted {
    fn audit(&self, status: AuditStatus) -> AuditRecord {
        AuditRecord::new(
            CHAT_EVENT,
            CHAT_ACTION,
            &self.user_id,
            self.role.as_str(),
            &self.request_id,
            status,
        )
        .with_conversation(&self.conversation_id)
        .with_latency(elapsed_ms(self.started))
    }
}

/// Composes authentication, validation, quota, routing and audit.
#[derive(Clone)]
pub struct ChatPipeline {
    authenticator: Arc<ApiKeyAuthenticator>,
    validator: Arc<RequestValidator>,
    ledger: Arc<QuotaLedger>,
    router: ProviderRouter,
    audit: AuditRecorder,
    requests: Arc<RequestStore>,
    conversations: Arc<ConversationStore>,
    request_timeout: Duration,
}

impl ChatPipeline {
    pub fn new(
        authenticator: ApiKeyAuthenticator,
        ledger: Arc<QuotaLedger>,
        router: ProviderRouter,
        audit: AuditRecorder,
    ) -> Self {
        Self {
            authenticator: Arc::new(authenticator),
            validator: Arc::new(RequestValidator::new()),
            ledger,
            router,
            audit,
            requests: Arc::new(RequestStore::new()),
            conversations: Arc::new(ConversationStore::default()),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Wire every component from configuration.
    pub fn from_config(config: &AppConfig, audit: AuditRecorder) -> Result<Self> {
        let ledger = Arc::new(QuotaLedger::new(QuotaPolicy::from(&config.quota)));
        let pipeline = Self::new(
            ApiKeyAuthenticator::from_config(&config.auth),
            ledger,
            build_router(config)?,
            audit,
        )
        .with_request_timeout(Duration::from_millis(config.router.request_timeout_ms));
        Ok(pipeline)
    }

    pub fn with_validator(mut self, validator: RequestValidator) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn router(&self) -> &ProviderRouter {
        &self.router
    }

    pub fn requests(&self) -> &Arc<RequestStore> {
        &self.requests
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub fn authenticate(&self, credential: Option<&str>) -> Result<AuthContext> {
        self.authenticator.authenticate(credential)
    }

    /// Authenticate and require a role.
    pub fn authorize(&self, credential: Option<&str>, role: Role) -> Result<AuthContext> {
        let ctx = self.authenticate(credential)?;
        require_role(&ctx, role)?;
        Ok(ctx)
    }

    /// Run one chat request through the pipeline.
    pub async fn submit(
        &self,
        request_id: &str,
        credential: Option<&str>,
        request: ChatRequest,
    ) -> Result<ChatOutcome> {
        let started = Instant::now();
        let rejected = |status: AuditStatus, stage: &str, reason: String| {
            AuditRecord::new(
                CHAT_EVENT,
                CHAT_ACTION,
                &request.user_id,
                &request.role,
                request_id,
                status,
            )
            .with_conversation(&request.conversation_id)
            .with_rejection(stage, reason)
            .with_latency(elapsed_ms(started))
        };

        if let Err(e) = self.authenticator.authenticate(credential) {
            tracing::warn!(request_id = %request_id, "Chat request failed authentication");
            self.emit(rejected(
                AuditStatus::RejectedAuth,
                "authentication",
                "invalid_credentials".into(),
            ))
            .await;
            return Err(e);
        }

        let verdict = self.validator.validate(&request);
        if let Some(reason) = verdict.reason {
            let detail = verdict.detail.unwrap_or_else(|| reason.to_string());
            tracing::warn!(
                request_id = %request_id,
                user_id = %request.user_id,
                reason = %reason,
                "Chat request failed validation"
            );
            let mut record =
                rejected(AuditStatus::RejectedValidation, "validation", reason.to_string());
            if let Some(category) = reason.injection_category() {
                track_guardrail_rejection(category.as_str());
                record = record.with_injection_category(category.as_str());
            }
            self.reject(record).await;
            return Err(Error::ValidationFailed { reason, detail });
        }

        let principal = self
            .validator
            .principal(&request)
            .ok_or_else(|| Error::internal("accepted request without a valid role"))?;
        let user_id = principal.user_id.as_str();

        let requests_remaining = match self.ledger.try_admit(user_id) {
            AdmissionDecision::Admitted { requests_remaining } => requests_remaining,
            AdmissionDecision::RateLimited {
                requests_remaining,
                retry_after_secs,
            } => {
                tracing::warn!(
                    request_id = %request_id,
                    user_id = %user_id,
                    retry_after_secs,
                    "Rate limit exceeded"
                );
                self.reject(
                    rejected(AuditStatus::RateLimited, "rate_limit", "too_many_requests".into())
                        .with_quota_decision("rate_limited"),
                )
                .await;
                return Err(Error::RateLimited {
                    requests_remaining,
                    retry_after_secs,
                });
            }
        };

        if let BudgetDecision::BudgetExceeded {
            tokens_used_today,
            daily_limit,
        } = self.ledger.check_budget(user_id)
        {
            tracing::warn!(
                request_id = %request_id,
                user_id = %user_id,
                tokens_used_today,
                daily_limit,
                "Daily token budget exhausted"
            );
            let record = rejected(
                AuditStatus::BudgetExceeded,
                "token_budget",
                "daily_budget_exhausted".into(),
            )
            .with_quota_decision("budget_exceeded");
            self.reject(record).await;
            return Err(Error::BudgetExceeded {
                used: tokens_used_today,
                limit: daily_limit,
            });
        }

        let admitted = Admitted {
            request_id: request_id.to_string(),
            user_id: principal.user_id.clone(),
            role: principal.role,
            conversation_id: request.conversation_id.clone(),
            question: request.message.trim().to_string(),
            requests_remaining,
            started,
        };
        let messages = build_chat_messages(
            &admitted.question,
            &self
                .conversations
                .history(&admitted.user_id, &admitted.conversation_id),
        );
        let hint = model_hint(&request);

        self.requests.insert(RequestRecord::processing(
            request_id,
            &admitted.conversation_id,
            &admitted.user_id,
        ));
        tracing::info!(
            request_id = %request_id,
            user_id = %admitted.user_id,
            role = %admitted.role,
            conversation_id = %admitted.conversation_id,
            stream = request.stream,
            "Chat request admitted"
        );

        if request.stream {
            return Ok(ChatOutcome::Streaming(self.start_stream(admitted, messages, hint)));
        }

        let routed = tokio::time::timeout(
            self.request_timeout,
            self.router.complete(&messages, hint.as_deref()),
        )
        .await;

        match routed {
            Ok(Ok(result)) => Ok(ChatOutcome::Completed(self.complete(&admitted, result).await)),
            Ok(Err(e)) => {
                self.fail(&admitted, AuditStatus::Failed, &e, &[]).await;
                Err(e)
            }
            Err(_) => {
                let e = Error::Timeout(format!(
                    "request exceeded {}ms",
                    self.request_timeout.as_millis()
                ));
                self.fail(&admitted, AuditStatus::Timeout, &e, &[]).await;
                Err(e)
            }
        }
    }

    /// Audit a chat body that could not be parsed. Credentials are checked
    /// first so a bad key is reported as such.
    pub async fn reject_malformed(
        &self,
        request_id: &str,
        credential: Option<&str>,
        detail: &str,
    ) -> Result<()> {
        let record = |status: AuditStatus, stage: &str, reason: &str| {
            AuditRecord::new(CHAT_EVENT, CHAT_ACTION, UNKNOWN, UNKNOWN, request_id, status)
                .with_rejection(stage, reason)
        };

        if let Err(e) = self.authenticator.authenticate(credential) {
            tracing::warn!(request_id = %request_id, "Chat request failed authentication");
            self.emit(record(AuditStatus::RejectedAuth, "authentication", "invalid_credentials"))
                .await;
            return Err(e);
        }

        tracing::warn!(request_id = %request_id, detail = %detail, "Malformed chat request body");
        self.emit(record(AuditStatus::RejectedValidation, "validation", "malformed_body"))
            .await;
        Ok(())
    }

    /// Status of a previously submitted request.
    pub fn request_status(
        &self,
        credential: Option<&str>,
        request_id: &str,
    ) -> Result<RequestRecord> {
        self.authenticate(credential)?;
        self.requests
            .get(request_id)
            .ok_or_else(|| Error::NotFound(format!("request '{}'", request_id)))
    }

    /// Current token budget of a user.
    pub fn budget(&self, credential: Option<&str>, user_id: &str) -> Result<QuotaSnapshot> {
        self.authenticate(credential)?;
        Ok(self.ledger.peek(user_id))
    }

    /// Purge a conversation's content. The audit trail is left untouched and
    /// the deletion itself is audited.
    ///
    /// With a `user_id` only that user's conversation is removed. Removing an
    /// id for every user requires the admin key.
    pub async fn delete_conversation(
        &self,
        request_id: &str,
        credential: Option<&str>,
        conversation_id: &str,
        user_id: Option<&str>,
    ) -> Result<()> {
        let record = |user: &str, role: &str, status: AuditStatus| {
            AuditRecord::new(DELETE_EVENT, DELETE_ACTION, user, role, request_id, status)
                .with_conversation(conversation_id)
        };

        let ctx = match self.authenticate(credential) {
            Ok(ctx) => ctx,
            Err(e) => {
                self.audit
                    .record(
                        record(UNKNOWN, UNKNOWN, AuditStatus::RejectedAuth)
                            .with_rejection("authentication", "invalid_credentials"),
                    )
                    .await;
                return Err(e);
            }
        };

        let removed = match user_id {
            Some(user) => usize::from(self.conversations.remove(user, conversation_id).is_some()),
            None if ctx.role == Role::Admin => self.conversations.remove_all(conversation_id).len(),
            None => {
                tracing::warn!(
                    request_id = %request_id,
                    conversation_id = %conversation_id,
                    "Conversation delete without an owner"
                );
                self.audit
                    .record(
                        record(ctx.subject.as_str(), ctx.role.as_str(), AuditStatus::RejectedAuth)
                            .with_rejection("authorization", "user_id_required"),
                    )
                    .await;
                return Err(Error::forbidden(
                    "deleting a conversation for every user requires the admin key",
                ));
            }
        };
        let purged = self.requests.purge_conversation(conversation_id, user_id);
        tracing::info!(
            request_id = %request_id,
            conversation_id = %conversation_id,
            removed,
            purged_requests = purged,
            "Conversation deleted"
        );

        self.audit
            .record(record(
                user_id.unwrap_or(ctx.subject.as_str()),
                ctx.role.as_str(),
                AuditStatus::Deleted,
            ))
            .await;
        Ok(())
    }

    /// Audit a rejected request and keep its status for later lookup.
    async fn reject(&self, record: AuditRecord) {
        let mut entry = RequestRecord::rejected(
            &record.request_id,
            record.conversation_id.as_deref().unwrap_or_default(),
            &record.user_id,
            record.rejection_stage.as_deref().unwrap_or_default(),
        );
        entry.processing_time_ms = record.latency_ms;
        self.requests.insert(entry);
        self.emit(record).await;
    }

    async fn emit(&self, record: AuditRecord) {
        track_chat_outcome(record.status.as_str());
        self.audit.record(record).await;
    }

    /// Consume tokens, store the exchange and audit success.
    async fn complete(&self, admitted: &Admitted, result: CompletionResult) -> ChatReply {
        let tokens = result.tokens_used();
        let budget =
            self.record_usage(admitted, &result.provider_used, &result.model, result.tokens);
        self.conversations.append_exchange(
            &admitted.user_id,
            &admitted.conversation_id,
            &admitted.question,
            &result.text,
        );

        let processing_time_ms = elapsed_ms(admitted.started);
        self.requests.update(&admitted.request_id, |r| {
            r.status = RequestStatus::Completed;
            r.message = Some(result.text.clone());
            r.model = Some(result.model.clone());
            r.provider = Some(result.provider_used.clone());
            r.tokens_used = Some(tokens);
            r.processing_time_ms = Some(processing_time_ms);
        });

        self.emit(
            admitted
                .audit(AuditStatus::Completed)
                .with_usage(&result.provider_used, &result.model, tokens, result.cost_estimate_usd)
                .with_attempts(&result.attempts)
                .with_quota_decision(quota_label(&budget)),
        )
        .await;

        tracing::info!(
            request_id = %admitted.request_id,
            user_id = %admitted.user_id,
            provider = %result.provider_used,
            model = %result.model,
            tokens,
            processing_time_ms,
            "Chat request completed"
        );

        ChatReply {
            status: RequestStatus::Completed,
            request_id: admitted.request_id.clone(),
            conversation_id: admitted.conversation_id.clone(),
            message: result.text,
            model: result.model,
            provider: result.provider_used,
            tokens_used: tokens,
            cost_usd: result.cost_estimate_usd,
            processing_time_ms,
            rate_limit: RateLimitInfo {
                requests_remaining: admitted.requests_remaining,
                tokens_remaining: tokens_remaining(&budget),
            },
        }
    }

    fn record_usage(
        &self,
        admitted: &Admitted,
        provider: &str,
        model: &str,
        usage: TokenUsage,
    ) -> BudgetDecision {
        track_tokens(provider, model, usage.prompt_tokens, usage.completion_tokens);
        let budget = self.ledger.try_consume(&admitted.user_id, usage.total_tokens);
        if !budget.is_within() {
            tracing::warn!(
                request_id = %admitted.request_id,
                user_id = %admitted.user_id,
                tokens_used_today = budget.tokens_used_today(),
                "Token budget already exhausted when usage was recorded"
            );
        }
        budget
    }

    /// Audit a failed call. `attempts` are the providers tried, unless the
    /// error already carries them.
    async fn fail(
        &self,
        admitted: &Admitted,
        status: AuditStatus,
        error: &Error,
        attempts: &[ProviderAttempt],
    ) {
        tracing::error!(
            request_id = %admitted.request_id,
            user_id = %admitted.user_id,
            error = %error,
            "Chat request failed"
        );
        let request_status = if status == AuditStatus::Cancelled {
            RequestStatus::Cancelled
        } else {
            RequestStatus::Failed
        };
        self.requests.update(&admitted.request_id, |r| {
            r.status = request_status;
            r.processing_time_ms = Some(elapsed_ms(admitted.started));
        });

        let attempts = match error {
            Error::AllProvidersFailed { attempts } => attempts.as_slice(),
            _ => attempts,
        };
        let record = admitted
            .audit(status)
            .with_rejection("routing", error.category())
            .with_attempts(attempts);
        self.emit(record).await;
    }

    fn start_stream(
        &self,
        admitted: Admitted,
        messages: Vec<ChatMessage>,
        hint: Option<String>,
    ) -> ChatStream {
        let upstream = self.router.stream(messages, hint);
        let cancel = CancellationToken::new();
        let (tx, chunks) = ChunkStream::channel(cancel.clone());

        let stream = ChatStream {
            request_id: admitted.request_id.clone(),
            conversation_id: admitted.conversation_id.clone(),
            requests_remaining: admitted.requests_remaining,
            chunks,
        };

        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.forward(admitted, upstream, tx, cancel).await;
        });
        stream
    }

    /// Relay router chunks to the client. The stream is settled (usage,
    /// history, audit) before its terminal chunk is forwarded.
    async fn forward(
        self,
        admitted: Admitted,
        mut upstream: ChunkStream,
        tx: mpsc::Sender<StreamChunk>,
        cancel: CancellationToken,
    ) {
        let deadline = tokio::time::Instant::now() + self.request_timeout;
        let mut text = String::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                _ = tokio::time::sleep_until(deadline) => {
                    upstream.cancel();
                    let e = Error::Timeout(format!(
                        "stream exceeded {}ms",
                        self.request_timeout.as_millis()
                    ));
                    self.fail(&admitted, AuditStatus::Timeout, &e, &[]).await;
                    let _ = tx.send(StreamChunk::error("The request timed out")).await;
                    return;
                }
                chunk = upstream.next() => Some(chunk),
            };

            let chunk = match next {
                None => {
                    upstream.cancel();
                    self.fail(&admitted, AuditStatus::Cancelled, &Error::Cancelled, &[]).await;
                    return;
                }
                Some(None) => StreamChunk::error("The model provider stream ended unexpectedly"),
                Some(Some(chunk)) => chunk,
            };

            match &chunk {
                StreamChunk::Delta { text: delta } => text.push_str(delta),
                StreamChunk::Done {
                    provider,
                    model,
                    tokens,
                    attempts,
                } => {
                    self.settle_stream(&admitted, provider, model, *tokens, attempts, &text)
                        .await;
                }
                StreamChunk::Error { message, attempts } => {
                    let e = Error::provider(message.clone());
                    self.fail(&admitted, AuditStatus::Failed, &e, attempts).await;
                }
            }

            let terminal = chunk.is_terminal();
            if tx.send(chunk).await.is_err() {
                if !terminal {
                    upstream.cancel();
                    self.fail(&admitted, AuditStatus::Cancelled, &Error::Cancelled, &[]).await;
                }
                return;
            }
            if terminal {
                return;
            }
        }
    }

    async fn settle_stream(
        &self,
        admitted: &Admitted,
        provider: &str,
        model: &str,
        usage: TokenUsage,
        attempts: &[ProviderAttempt],
        text: &str,
    ) {
        let budget = self.record_usage(admitted, provider, model, usage);
        let cost = self.router.estimate_cost(model, usage.total_tokens);
        self.conversations.append_exchange(
            &admitted.user_id,
            &admitted.conversation_id,
            &admitted.question,
            text,
        );

        let processing_time_ms = elapsed_ms(admitted.started);
        self.requests.update(&admitted.request_id, |r| {
            r.status = RequestStatus::Completed;
            r.message = Some(text.to_string());
            r.model = Some(model.to_string());
            r.provider = Some(provider.to_string());
            r.tokens_used = Some(usage.total_tokens);
            r.processing_time_ms = Some(processing_time_ms);
        });

        self.emit(
            admitted
                .audit(AuditStatus::Completed)
                .with_usage(provider, model, usage.total_tokens, cost)
                .with_attempts(attempts)
                .with_quota_decision(quota_label(&budget)),
        )
        .await;
        tracing::info!(
            request_id = %admitted.request_id,
            provider = %provider,
            tokens = usage.total_tokens,
            processing_time_ms,
            "Chat stream completed"
        );
    }
}

/// Optional `metadata.model` preference.
fn model_hint(request: &ChatRequest) -> Option<String> {
    request
        .metadata
        .as_ref()?
        .get("model")?
        .as_str()
        .map(str::to_string)
}

fn quota_label(budget: &BudgetDecision) -> &'static str {
    match budget {
        BudgetDecision::Within { .. } => "within_budget",
        BudgetDecision::BudgetExceeded { .. } => "budget_exceeded",
    }
}

fn tokens_remaining(budget: &BudgetDecision) -> u64 {
    match budget {
        BudgetDecision::Within {
            tokens_remaining, ..
        } => *tokens_remaining,
        BudgetDecision::BudgetExceeded { .. } => 0,
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
