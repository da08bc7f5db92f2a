//! Model provider traits.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::Result;
use crate::types::{ChatMessage, ProviderResponse};

/// Lazy sequence of text deltas produced by a provider.
pub type TextStream = BoxStream<'static, Result<String>>;

/// A single LLM backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stable provider name used for routing, health and audit.
    fn name(&self) -> &str;

    /// Provider-specific model used for a requested model name.
    fn resolve_model(&self, model_hint: Option<&str>) -> String {
        model_hint.unwrap_or(self.name()).to_string()
    }

    /// Generate a chat completion.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        model_hint: Option<&str>,
    ) -> Result<ProviderResponse>;

    /// Stream a chat completion.
    ///
    /// Providers without native streaming fall back to a full completion
    /// replayed word by word.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        model_hint: Option<&str>,
    ) -> Result<TextStream> {
        let response = self.complete(messages, model_hint).await?;
        Ok(stream::iter(split_words(&response.content)).map(Ok).boxed())
    }
}

/// Split text into whitespace-preserving word chunks.
pub fn split_words(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch.is_whitespace() {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
