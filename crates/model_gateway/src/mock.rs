//! Offline provider used when no real provider is configured.

use async_trait::async_trait;

use knowledge_hub_core::{ChatMessage, LlmProvider, ProviderResponse, Result, TokenUsage};

pub const MOCK_PROVIDER: &str = "mock";

/// Deterministic provider echoing the last user message.
///
/// Always answers `[MOCK] <message>` with a fixed usage of 10 prompt and
/// 20 completion tokens.
#[derive(Debug, Clone)]
pub struct MockProvider {
    name: String,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::named(MOCK_PROVIDER)
    }

    /// Mock registered under another name, for routing tests.
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve_model(&self, model_hint: Option<&str>) -> String {
        model_hint.unwrap_or(MOCK_PROVIDER).to_string()
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        model_hint: Option<&str>,
    ) -> Result<ProviderResponse> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("");

        Ok(ProviderResponse {
            content: format!("[MOCK] {}", last_user),
            model: self.resolve_model(model_hint),
            usage: TokenUsage::new(10, 20),
            finish_reason: "stop".to_string(),
        })
    }
}
