//! Rig-backed providers (OpenAI, Anthropic).
//!
//! API keys are read by Rig from `OPENAI_API_KEY` / `ANTHROPIC_API_KEY`.

use async_trait::async_trait;

use knowledge_hub_core::{ChatMessage, Error, LlmProvider, ProviderResponse, Result, TokenUsage};

use rig::client::{CompletionClient, ProviderClient};
use rig::completion::Prompt;

/// Backend reached through Rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RigBackend {
    OpenAI,
    Anthropic,
}

impl RigBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
        }
    }

    pub fn api_key_var(&self) -> &'static str {
        match self {
            Self::OpenAI => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAI => "gpt-4o-mini",
            Self::Anthropic => "claude-3-5-sonnet-20241022",
        }
    }

    /// Whether a generic model name belongs to this backend's family.
    fn serves(&self, model: &str) -> bool {
        match self {
            Self::OpenAI => ["gpt-", "o1", "o3"].iter().any(|p| model.starts_with(p)),
            Self::Anthropic => model.starts_with("claude"),
        }
    }

    /// Whether the API key variable is present.
    pub fn is_available(&self) -> bool {
        std::env::var(self.api_key_var()).is_ok()
    }
}

/// Provider wrapping a Rig agent.
pub struct RigProvider {
    backend: RigBackend,
    model: String,
}

impl RigProvider {
    pub fn new(backend: RigBackend, model: Option<String>) -> Self {
        Self {
            backend,
            model: model.unwrap_or_else(|| backend.default_model().to_string()),
        }
    }

    pub fn openai(model: Option<String>) -> Self {
        Self::new(RigBackend::OpenAI, model)
    }

    pub fn anthropic(model: Option<String>) -> Self {
        Self::new(RigBackend::Anthropic, model)
    }

    pub fn backend(&self) -> RigBackend {
        self.backend
    }

    /// System messages become the preamble; the rest is a transcript.
    fn split_messages(messages: &[ChatMessage]) -> (Option<String>, String) {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .collect();
        let preamble = (!system.is_empty()).then(|| system.join("\n\n"));

        let turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != "system").collect();
        let prompt = match turns.as_slice() {
            [single] if single.role == "user" => single.content.clone(),
            _ => {
                let mut prompt = String::new();
                for msg in turns {
                    let speaker = match msg.role.as_str() {
                        "user" => "User",
                        "assistant" => "Assistant",
                        other => other,
                    };
                    prompt.push_str(&format!("{}: {}\n\n", speaker, msg.content));
                }
                prompt
            }
        };

        (preamble, prompt)
    }

    async fn call_openai(
        &self,
        model: &str,
        preamble: Option<&str>,
        prompt: &str,
    ) -> Result<String> {
        use rig::providers::openai;

        let client = openai::Client::from_env();
        let mut agent_builder = client.agent(model);
        if let Some(system) = preamble {
            agent_builder = agent_builder.preamble(system);
        }
        let agent = agent_builder.build();

        agent
            .prompt(prompt)
            .await
            .map_err(|e| Error::provider(format!("OpenAI error: {}", e)))
    }

    async fn call_anthropic(
        &self,
        model: &str,
        preamble: Option<&str>,
        prompt: &str,
    ) -> Result<String> {
        use rig::providers::anthropic;

        let client = anthropic::Client::from_env();
        let mut agent_builder = client.agent(model);
        if let Some(system) = preamble {
            agent_builder = agent_builder.preamble(system);
        }
        let agent = agent_builder.build();

        agent
            .prompt(prompt)
            .await
            .map_err(|e| Error::provider(format!("Anthropic error: {}", e)))
    }
}

#[async_trait]
impl LlmProvider for RigProvider {
    fn name(&self) -> &str {
        self.backend.name()
    }

    fn resolve_model(&self, model_hint: Option<&str>) -> String {
        match model_hint {
            Some(hint) if self.backend.serves(hint) => hint.to_string(),
            _ => self.model.clone(),
        }
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        model_hint: Option<&str>,
    ) -> Result<ProviderResponse> {
        // Rig panics on a missing key, so check first
        if !self.backend.is_available() {
            return Err(Error::provider(format!("{} not set", self.backend.api_key_var())));
        }

        let model = self.resolve_model(model_hint);
        let (preamble, prompt) = Self::split_messages(messages);

        tracing::debug!(
            provider = self.backend.name(),
            model = %model,
            prompt_len = prompt.len(),
            "Calling LLM"
        );

        let preamble = preamble.as_deref();
        let content = match self.backend {
            RigBackend::OpenAI => self.call_openai(&model, preamble, &prompt).await?,
            RigBackend::Anthropic => self.call_anthropic(&model, preamble, &prompt).await?,
        };

        Ok(ProviderResponse {
            usage: TokenUsage::estimate(messages, &content),
            content,
            model,
            finish_reason: "stop".to_string(),
        })
    }
}
