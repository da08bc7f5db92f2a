use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// =============================================================================
// Request Types
// =============================================================================

/// Inbound chat request as submitted by the client.
///
/// `role` stays a raw string here; turning it into a [`crate::Role`] is the
/// validator's job so that an unknown role is a validation outcome rather than
/// a parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub role: String,
    pub message: String,
    pub conversation_id: String,
    /// Deliver the answer as a chunk stream.
    #[serde(default)]
    pub stream: bool,
    /// Optional caller metadata (department, project, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl ChatRequest {
    pub fn new(
        user_id: impl Into<String>,
        role: impl Into<String>,
        message: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            role: role.into(),
            message: message.into(),
            conversation_id: conversation_id.into(),
            stream: false,
            metadata: None,
        }
    }

    /// Request a streamed answer.
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// Family of prompt-injection technique a rule detects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InjectionCategory {
    InstructionOverride,
    SystemPromptExtraction,
    RoleManipulation,
    MarkupInjection,
    ProtocolInjection,
    CodeExecution,
}

impl InjectionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstructionOverride => "instruction-override",
            Self::SystemPromptExtraction => "system-prompt-extraction",
            Self::RoleManipulation => "role-manipulation",
            Self::MarkupInjection => "markup-injection",
            Self::ProtocolInjection => "protocol-injection",
            Self::CodeExecution => "code-execution",
        }
    }
}

impl fmt::Display for InjectionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the validator refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "category", rename_all = "snake_case")]
pub enum RejectionReason {
    InjectionPatternMatched(InjectionCategory),
    TooLong,
    InvalidRole,
    InvalidId,
}

impl RejectionReason {
    /// Injection category, when the rejection came from the rule table.
    pub fn injection_category(&self) -> Option<InjectionCategory> {
        match self {
            Self::InjectionPatternMatched(category) => Some(*category),
            _ => None,
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InjectionPatternMatched(category) => {
                write!(f, "injection_pattern_matched({})", category)
            }
            Self::TooLong => f.write_str("too_long"),
            Self::InvalidRole => f.write_str("invalid_role"),
            Self::InvalidId => f.write_str("invalid_id"),
        }
    }
}

/// Outcome of validating one request. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationVerdict {
    pub accepted: bool,
    pub reason: Option<RejectionReason>,
    /// Human-readable detail, safe to return to the caller.
    pub detail: Option<String>,
}

impl ValidationVerdict {
    pub fn accept() -> Self {
        Self {
            accepted: true,
            reason: None,
            detail: None,
        }
    }

    pub fn reject(reason: RejectionReason, detail: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
            detail: Some(detail.into()),
        }
    }

    pub fn injection_category(&self) -> Option<InjectionCategory> {
        self.reason.and_then(|r| r.injection_category())
    }
}
