//! Ordered failover across providers.
//!
//! A call walks the registry's call order. Each attempt is bounded by the
//! attempt timeout, and a failure or timeout moves on to the next provider.
//! The first success wins. When nothing succeeds the caller gets
//! `AllProvidersFailed` with one entry per attempt.

use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use knowledge_hub_core::config::RouterConfig;
use knowledge_hub_core::{
    AttemptOutcome, ChatMessage, CompletionResult, CompletionStatus, Error, LlmProvider,
    ProviderAttempt, Result, StreamChunk, TextStream, TokenUsage,
};

use crate::pricing::PricingRegistry;
use crate::providers::ProviderRegistry;
use crate::stream::ChunkStream;

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub attempt_timeout: Duration,
    /// Pause before trying the next provider.
    pub retry_delay: Duration,
    /// Model requested when the caller passes no hint.
    pub default_model: Option<String>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            retry_delay: Duration::ZERO,
            default_model: None,
        }
    }
}

impl From<&RouterConfig> for RouterSettings {
    fn from(config: &RouterConfig) -> Self {
        Self {
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            default_model: Some(config.default_model.clone()).filter(|m| !m.is_empty()),
        }
    }
}

/// Settles one attempt against the registry. Dropping it unsettled gives the
/// trial slot back.
struct AttemptGuard {
    registry: Arc<ProviderRegistry>,
    name: String,
    settled: bool,
}

impl AttemptGuard {
    fn new(registry: Arc<ProviderRegistry>, name: String) -> Self {
        Self {
            registry,
            name,
            settled: false,
        }
    }

    fn succeed(mut self) {
        self.registry.record_success(&self.name);
        self.settled = true;
    }

    fn fail(mut self) {
        self.registry.record_failure(&self.name);
        self.settled = true;
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.release(&self.name);
        }
    }
}

fn track_attempt(provider: &str, outcome: AttemptOutcome) {
    let outcome = match outcome {
        AttemptOutcome::Succeeded => "succeeded",
        AttemptOutcome::Failed => "failed",
        AttemptOutcome::TimedOut => "timed_out",
    };
    metrics::counter!(
        "provider_attempts_total",
        "provider" => provider.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Routes completions to the first provider that answers.
#[derive(Clone)]
pub struct ProviderRouter {
    registry: Arc<ProviderRegistry>,
    pricing: Arc<PricingRegistry>,
    settings: RouterSettings,
}

impl ProviderRouter {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            pricing: Arc::new(PricingRegistry::with_defaults()),
            settings: RouterSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: RouterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_pricing(mut self, pricing: PricingRegistry) -> Self {
        self.pricing = Arc::new(pricing);
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub fn estimate_cost(&self, model: &str, tokens: u64) -> f64 {
        self.pricing.estimate_cost(model, tokens)
    }

    fn effective_hint<'a>(&'a self, model_hint: Option<&'a str>) -> Option<&'a str> {
        model_hint.or(self.settings.default_model.as_deref())
    }

    /// Complete a chat, failing over across providers.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        model_hint: Option<&str>,
    ) -> Result<CompletionResult> {
        let hint = self.effective_hint(model_hint);
        let started = Instant::now();
        let mut attempts: Vec<ProviderAttempt> = Vec::new();

        for candidate in self.registry.call_order() {
            let name = candidate.name().to_string();
            if !self.registry.try_acquire(&name) {
                tracing::debug!(provider = %name, "Skipping provider, circuit open");
                continue;
            }
            let guard = AttemptGuard::new(self.registry.clone(), name.clone());

            if !attempts.is_empty() && !self.settings.retry_delay.is_zero() {
                tokio::time::sleep(self.settings.retry_delay).await;
            }

            tracing::debug!(provider = %name, model = ?hint, "Calling provider");
            let attempt_started = Instant::now();
            let outcome = tokio::time::timeout(
                self.settings.attempt_timeout,
                candidate.provider.complete(messages, hint),
            )
            .await;
            let latency_ms = elapsed_ms(attempt_started);

            match outcome {
                Ok(Ok(response)) => {
                    guard.succeed();
                    track_attempt(&name, AttemptOutcome::Succeeded);
                    attempts.push(ProviderAttempt {
                        provider: name.clone(),
                        outcome: AttemptOutcome::Succeeded,
                        error: None,
                        latency_ms,
                    });

                    let cost = self.estimate_cost(&response.model, response.usage.total_tokens);
                    tracing::info!(
                        provider = %name,
                        model = %response.model,
                        tokens = response.usage.total_tokens,
                        latency_ms,
                        attempts = attempts.len(),
                        "Provider call succeeded"
                    );
                    return Ok(CompletionResult {
                        text: response.content,
                        tokens: response.usage,
                        provider_used: name,
                        model: response.model,
                        latency_ms: elapsed_ms(started),
                        cost_estimate_usd: cost,
                        status: CompletionStatus::Completed,
                        attempts,
                    });
                }
                Ok(Err(e)) if !e.is_retryable() => return Err(e),
                Ok(Err(e)) => {
                    guard.fail();
                    track_attempt(&name, AttemptOutcome::Failed);
                    tracing::warn!(
                        provider = %name,
                        error = %e,
                        latency_ms,
                        "Provider call failed"
                    );
                    attempts.push(ProviderAttempt {
                        provider: name,
                        outcome: AttemptOutcome::Failed,
                        error: Some(e.to_string()),
                        latency_ms,
                    });
                }
                Err(_) => {
                    guard.fail();
                    track_attempt(&name, AttemptOutcome::TimedOut);
                    tracing::warn!(
                        provider = %name,
                        timeout_ms = self.settings.attempt_timeout.as_millis() as u64,
                        "Provider call timed out"
                    );
                    attempts.push(ProviderAttempt {
                        provider: name,
                        outcome: AttemptOutcome::TimedOut,
                        error: Some(format!(
                            "timed out after {}ms",
                            self.settings.attempt_timeout.as_millis()
                        )),
                        latency_ms,
                    });
                }
            }
        }

        tracing::error!(attempts = attempts.len(), "All providers failed");
        Err(Error::AllProvidersFailed { attempts })
    }

    /// Stream a chat completion.
    ///
    /// A producer task forwards provider deltas into a bounded channel.
    /// Failover happens only while no chunk has been delivered; after that an
    /// upstream failure ends the stream with a `StreamChunk::Error`.
    pub fn stream(&self, messages: Vec<ChatMessage>, model_hint: Option<String>) -> ChunkStream {
        let cancel = CancellationToken::new();
        let (tx, stream) = ChunkStream::channel(cancel.clone());
        let router = self.clone();
        tokio::spawn(async move {
            router.produce(messages, model_hint, tx, cancel).await;
        });
        stream
    }

    async fn produce(
        self,
        messages: Vec<ChatMessage>,
        model_hint: Option<String>,
        tx: mpsc::Sender<StreamChunk>,
        cancel: CancellationToken,
    ) {
        let hint = model_hint.or_else(|| self.settings.default_model.clone());
        let mut attempts: Vec<ProviderAttempt> = Vec::new();

        for candidate in self.registry.call_order() {
            if cancel.is_cancelled() {
                return;
            }
            let name = candidate.name().to_string();
            if !self.registry.try_acquire(&name) {
                continue;
            }
            let guard = AttemptGuard::new(self.registry.clone(), name.clone());

            if !attempts.is_empty() && !self.settings.retry_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.settings.retry_delay) => {}
                }
            }

            let attempt_started = Instant::now();
            let opened = tokio::select! {
                _ = cancel.cancelled() => return,
                opened = tokio::time::timeout(
                    self.settings.attempt_timeout,
                    open_stream(candidate.provider.as_ref(), &messages, hint.as_deref()),
                ) => opened,
            };

            let (mut upstream, first) = match opened {
                Ok(Ok(opened)) => opened,
                Ok(Err(e)) if !e.is_retryable() => {
                    track_attempt(&name, AttemptOutcome::Failed);
                    tracing::warn!(provider = %name, error = %e, "Provider rejected the stream");
                    attempts.push(ProviderAttempt {
                        provider: name,
                        outcome: AttemptOutcome::Failed,
                        error: Some(e.to_string()),
                        latency_ms: elapsed_ms(attempt_started),
                    });
                    let chunk = StreamChunk::Error {
                        message: "The model provider rejected the request".to_string(),
                        attempts,
                    };
                    send(&tx, &cancel, chunk).await;
                    return;
                }
                Ok(Err(e)) => {
                    guard.fail();
                    track_attempt(&name, AttemptOutcome::Failed);
                    tracing::warn!(
                        provider = %name,
                        error = %e,
                        "Provider stream failed before first chunk"
                    );
                    attempts.push(ProviderAttempt {
                        provider: name,
                        outcome: AttemptOutcome::Failed,
                        error: Some(e.to_string()),
                        latency_ms: elapsed_ms(attempt_started),
                    });
                    continue;
                }
                Err(_) => {
                    guard.fail();
                    track_attempt(&name, AttemptOutcome::TimedOut);
                    tracing::warn!(
                        provider = %name,
                        "Provider stream timed out before first chunk"
                    );
                    attempts.push(ProviderAttempt {
                        provider: name,
                        outcome: AttemptOutcome::TimedOut,
                        error: Some(format!(
                            "timed out after {}ms",
                            self.settings.attempt_timeout.as_millis()
                        )),
                        latency_ms: elapsed_ms(attempt_started),
                    });
                    continue;
                }
            };

            let model = candidate.provider.resolve_model(hint.as_deref());
            let mut text = String::new();

            if let Some(first) = first {
                text.push_str(&first);
                if !send(&tx, &cancel, StreamChunk::delta(first)).await {
                    return;
                }
            }

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(provider = %name, "Stream cancelled by consumer");
                        return;
                    }
                    next = tokio::time::timeout(
                        self.settings.attempt_timeout,
                        upstream.next(),
                    ) => next,
                };

                let (outcome, error, message) = match next {
                    Ok(Some(Ok(delta))) => {
                        if delta.is_empty() {
                            continue;
                        }
                        text.push_str(&delta);
                        if !send(&tx, &cancel, StreamChunk::delta(delta)).await {
                            return;
                        }
                        continue;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        tracing::warn!(provider = %name, error = %e, "Provider stream interrupted");
                        (
                            AttemptOutcome::Failed,
                            e.to_string(),
                            "The model provider stream was interrupted",
                        )
                    }
                    Err(_) => {
                        tracing::warn!(provider = %name, "Provider stream stalled");
                        (
                            AttemptOutcome::TimedOut,
                            format!("stalled for {}ms", self.settings.attempt_timeout.as_millis()),
                            "The model provider stopped responding",
                        )
                    }
                };

                guard.fail();
                track_attempt(&name, outcome);
                attempts.push(ProviderAttempt {
                    provider: name,
                    outcome,
                    error: Some(error),
                    latency_ms: elapsed_ms(attempt_started),
                });
                send(
                    &tx,
                    &cancel,
                    StreamChunk::Error {
                        message: message.to_string(),
                        attempts,
                    },
                )
                .await;
                return;
            }

            guard.succeed();
            track_attempt(&name, AttemptOutcome::Succeeded);
            attempts.push(ProviderAttempt {
                provider: name.clone(),
                outcome: AttemptOutcome::Succeeded,
                error: None,
                latency_ms: elapsed_ms(attempt_started),
            });
            let tokens = TokenUsage::estimate(&messages, &text);
            tracing::info!(
                provider = %name,
                model = %model,
                tokens = tokens.total_tokens,
                attempts = attempts.len(),
                "Provider stream completed"
            );
            send(
                &tx,
                &cancel,
                StreamChunk::Done {
                    provider: name,
                    model,
                    tokens,
                    attempts,
                },
            )
            .await;
            return;
        }

        tracing::error!(attempts = attempts.len(), "All providers failed to stream");
        send(
            &tx,
            &cancel,
            StreamChunk::Error {
                message: "All model providers are currently unavailable".to_string(),
                attempts,
            },
        )
        .await;
    }
}

/// Open a provider stream and wait for its first delta.
async fn open_stream(
    provider: &dyn LlmProvider,
    messages: &[ChatMessage],
    model_hint: Option<&str>,
) -> Result<(TextStream, Option<String>)> {
    let mut upstream = provider.stream(messages, model_hint).await?;
    loop {
        match upstream.next().await {
            Some(Ok(delta)) if delta.is_empty() => continue,
            Some(Ok(delta)) => return Ok((upstream, Some(delta))),
            Some(Err(e)) => return Err(e),
            None => return Ok((upstream, None)),
        }
    }
}

/// Deliver a chunk unless the consumer has gone away.
async fn send(
    tx: &mpsc::Sender<StreamChunk>,
    cancel: &CancellationToken,
    chunk: StreamChunk,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(chunk) => sent.is_ok(),
    }
}
