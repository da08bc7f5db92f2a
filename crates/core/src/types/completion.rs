use serde::{Deserialize, Serialize};

// =============================================================================
// Model Interaction Types
// =============================================================================

/// Chat message sent to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role (system, user, assistant).
    pub role: String,
    /// Message content.
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Token usage reported (or estimated) for a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Rough estimate at four characters per token, used when a provider
    /// does not report usage.
    pub fn estimate(messages: &[ChatMessage], completion: &str) -> Self {
        let prompt_chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
        Self::new(
            (prompt_chars as u64).div_ceil(4),
            (completion.chars().count() as u64).div_ceil(4),
        )
    }
}

/// Raw answer from a single provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: String,
    /// Model that actually served the call.
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: String,
}

/// Terminal status of a completion as seen by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    Failed,
    RateLimited,
    BudgetExceeded,
}

/// How one provider attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

/// One step of the failover loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub provider: String,
    pub outcome: AttemptOutcome,
    /// Error class, never the raw provider message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

/// Result of routing a completion through the provider list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResult {
    pub text: String,
    pub tokens: TokenUsage,
    pub provider_used: String,
    pub model: String,
    pub latency_ms: u64,
    pub cost_estimate_usd: f64,
    pub status: CompletionStatus,
    pub attempts: Vec<ProviderAttempt>,
}

impl CompletionResult {
    pub fn tokens_used(&self) -> u64 {
        self.tokens.total_tokens
    }
}

/// One element of a streamed answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Partial text.
    Delta { text: String },
    /// Explicit end marker.
    Done {
        provider: String,
        model: String,
        tokens: TokenUsage,
        /// Every provider tried, the serving one last.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attempts: Vec<ProviderAttempt>,
    },
    /// Stream ended abnormally. Carries a safe message only.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attempts: Vec<ProviderAttempt>,
    },
}

impl StreamChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            attempts: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_estimate() {
        let messages = vec![ChatMessage::user("12345678")];
        let usage = TokenUsage::estimate(&messages, "abcde");
        assert_eq!(usage.prompt_tokens, 2);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, 4);
    }

    #[test]
    fn test_stream_chunk_terminal() {
        assert!(!StreamChunk::delta("hi").is_terminal());
        assert!(StreamChunk::error("x").is_terminal());
    }

    #[test]
    fn test_terminal_chunk_attempts_skipped_when_empty() {
        let json = serde_json::to_value(StreamChunk::error("boom")).unwrap();
        assert!(json.get("attempts").is_none());

        let chunk = StreamChunk::Error {
            message: "boom".into(),
            attempts: vec![ProviderAttempt {
                provider: "azure".into(),
                outcome: AttemptOutcome::Failed,
                error: Some("provider_unavailable".into()),
                latency_ms: 12,
            }],
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["attempts"][0]["provider"], "azure");
    }
}
