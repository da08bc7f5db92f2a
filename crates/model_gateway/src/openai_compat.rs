//! OpenAI-compatible HTTP provider (Azure OpenAI deployments, self-hosted
//! gateways) with native SSE streaming.

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;

use knowledge_hub_core::config::AzureProviderConfig;
use knowledge_hub_core::{
    ChatMessage, Error, LlmProvider, ProviderResponse, Result, TextStream, TokenUsage,
};

/// How the credential is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `api-key: <key>` (Azure)
    ApiKeyHeader,
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatibleConfig {
    pub name: String,
    /// Full chat-completions URL.
    pub url: String,
    pub api_key: Option<Secret<String>>,
    pub auth_style: AuthStyle,
    pub default_model: String,
    /// Generic model names mapped to the names this endpoint serves.
    pub model_map: Vec<(String, String)>,
}

impl OpenAiCompatibleConfig {
    /// Azure OpenAI deployment.
    pub fn azure(
        endpoint: &str,
        api_key: Option<Secret<String>>,
        deployment: &str,
        api_version: &str,
    ) -> Self {
        Self {
            name: "azure".to_string(),
            url: format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                endpoint.trim_end_matches('/'),
                deployment,
                api_version
            ),
            api_key,
            auth_style: AuthStyle::ApiKeyHeader,
            default_model: deployment.to_string(),
            model_map: vec![
                ("gpt-4".into(), "gpt-4".into()),
                ("gpt-4o".into(), "gpt-4o".into()),
                ("gpt-3.5-turbo".into(), "gpt-35-turbo".into()),
            ],
        }
    }

    pub fn from_azure_config(config: &AzureProviderConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| Error::config("providers.azure.endpoint is required"))?;
        Ok(Self::azure(
            endpoint,
            config.api_key.clone(),
            &config.deployment,
            &config.api_version,
        ))
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    model: Option<String>,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// One SSE line, framing removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Buffers partial lines across network chunks.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns the events of every complete line.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(event) = Self::parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Parse whatever is left once the byte stream ends.
    pub fn flush(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        Self::parse_line(&rest)
    }

    fn parse_line(line: &str) -> Option<SseEvent> {
        let line = line.trim();
        let data = line.strip_prefix("data:")?.trim_start();
        match data {
            "" => None,
            "[DONE]" => Some(SseEvent::Done),
            json => Some(SseEvent::Data(json.to_string())),
        }
    }
}

fn parse_delta(json: &str) -> Option<Result<String>> {
    match serde_json::from_str::<StreamEvent>(json) {
        Ok(event) => event
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta)
            .and_then(|d| d.content)
            .filter(|c| !c.is_empty())
            .map(Ok),
        Err(e) => {
            tracing::warn!(error = %e, "Skipping unparseable stream event");
            None
        }
    }
}

struct SseState<S> {
    bytes: Pin<Box<S>>,
    parser: SseLineBuffer,
    pending: VecDeque<Result<String>>,
    finished: bool,
}

/// Turn a response byte stream into a stream of text deltas.
pub fn sse_text_stream<S, B>(bytes: S, provider: String) -> TextStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = SseState {
        bytes: Box::pin(bytes),
        parser: SseLineBuffer::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold((state, provider), |(mut state, provider)| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, (state, provider)));
            }
            if state.finished {
                return None;
            }

            let events = match state.bytes.next().await {
                Some(Ok(chunk)) => state.parser.feed(chunk.as_ref()),
                Some(Err(e)) => {
                    state.finished = true;
                    let e = Error::provider(format!("{} stream read error: {}", provider, e));
                    state.pending.push_back(Err(e));
                    continue;
                }
                None => {
                    state.finished = true;
                    state.parser.flush().into_iter().collect()
                }
            };

            for event in events {
                match event {
                    SseEvent::Data(json) => {
                        if let Some(delta) = parse_delta(&json) {
                            state.pending.push_back(delta);
                        }
                    }
                    SseEvent::Done => state.finished = true,
                }
            }
        }
    })
    .boxed()
}

/// Provider speaking the OpenAI chat-completions protocol over HTTP.
pub struct OpenAiCompatibleProvider {
    config: OpenAiCompatibleConfig,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: OpenAiCompatibleConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn request(
        &self,
        model: &str,
        messages: &[ChatMessage],
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let builder = self.client.post(&self.config.url).json(&CompletionRequest {
            model,
            messages,
            stream,
        });
        match (&self.config.api_key, self.config.auth_style) {
            (Some(key), AuthStyle::Bearer) => builder.bearer_auth(key.expose_secret()),
            (Some(key), AuthStyle::ApiKeyHeader) => builder.header("api-key", key.expose_secret()),
            (None, _) => builder,
        }
    }

    async fn send(
        &self,
        model: &str,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<reqwest::Response> {
        let response = self
            .request(model, messages, stream)
            .send()
            .await
            .map_err(|e| Error::provider(format!("{} request failed: {}", self.config.name, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                provider = %self.config.name,
                status = %status,
                body = %body,
                "Provider returned an error"
            );
            return Err(Error::provider(format!(
                "{} returned HTTP {}",
                self.config.name, status
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn resolve_model(&self, model_hint: Option<&str>) -> String {
        let Some(hint) = model_hint else {
            return self.config.default_model.clone();
        };
        if hint.contains('/') {
            return hint.rsplit('/').next().unwrap_or(hint).to_string();
        }
        self.config
            .model_map
            .iter()
            .find(|(generic, _)| generic == hint)
            .map(|(_, mapped)| mapped.clone())
            .unwrap_or_else(|| self.config.default_model.clone())
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        model_hint: Option<&str>,
    ) -> Result<ProviderResponse> {
        let model = self.resolve_model(model_hint);
        let response = self.send(&model, messages, false).await?;

        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| {
                Error::provider(format!("{} returned an invalid body: {}", self.config.name, e))
            })?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider(format!("{} returned no choices", self.config.name)))?;
        let content = choice.message.and_then(|m| m.content).unwrap_or_default();

        Ok(ProviderResponse {
            usage: body
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
                .unwrap_or_else(|| TokenUsage::estimate(messages, &content)),
            content,
            model: body.model.unwrap_or(model),
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
        })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        model_hint: Option<&str>,
    ) -> Result<TextStream> {
        let model = self.resolve_model(model_hint);
        let response = self.send(&model, messages, true).await?;
        Ok(sse_text_stream(response.bytes_stream(), self.config.name.clone()))
    }
}
