//! Structural and content validation of inbound chat requests.

use regex::Regex;

use knowledge_hub_core::{ChatRequest, Principal, RejectionReason, Role, ValidationVerdict};

use crate::guardrails::InjectionDetector;

pub const MAX_MESSAGE_CHARS: usize = 2000;
pub const MIN_ID_CHARS: usize = 3;
pub const MAX_ID_CHARS: usize = 64;

/// Validates identifiers, role, message length and content.
///
/// Checks run in a fixed order and the first failure decides the verdict:
/// ids, role, length, then the injection rule table.
#[derive(Debug, Clone)]
pub struct RequestValidator {
    id_pattern: Regex,
    detector: InjectionDetector,
    max_message_chars: usize,
}

impl RequestValidator {
    pub fn new() -> Self {
        Self::with_detector(InjectionDetector::new())
    }

    pub fn with_detector(detector: InjectionDetector) -> Self {
        Self {
            id_pattern: Regex::new(r"^[A-Za-z0-9@._-]+$").expect("id pattern compiles"),
            detector,
            max_message_chars: MAX_MESSAGE_CHARS,
        }
    }

    pub fn validate(&self, request: &ChatRequest) -> ValidationVerdict {
        for (field, value) in [
            ("user_id", &request.user_id),
            ("conversation_id", &request.conversation_id),
        ] {
            if let Some(detail) = self.check_id(field, value) {
                return ValidationVerdict::reject(RejectionReason::InvalidId, detail);
            }
        }

        if request.role.parse::<Role>().is_err() {
            return ValidationVerdict::reject(
                RejectionReason::InvalidRole,
                format!(
                    "role must be one of user, admin, analyst, viewer (got '{}')",
                    request.role
                ),
            );
        }

        let message = request.message.trim();
        if message.is_empty() {
            return ValidationVerdict::reject(
                RejectionReason::TooLong,
                "message cannot be empty or whitespace only",
            );
        }
        let chars = message.chars().count();
        if chars > self.max_message_chars {
            return ValidationVerdict::reject(
                RejectionReason::TooLong,
                format!("message is {} characters, limit is {}", chars, self.max_message_chars),
            );
        }

        if let Some(category) = self.detector.detect(message) {
            return ValidationVerdict::reject(
                RejectionReason::InjectionPatternMatched(category),
                "message contains suspicious patterns, please rephrase your query",
            );
        }

        ValidationVerdict::accept()
    }

    /// Build the acting principal from an accepted request.
    pub fn principal(&self, request: &ChatRequest) -> Option<Principal> {
        request
            .role
            .parse::<Role>()
            .ok()
            .map(|role| Principal::new(request.user_id.clone(), role))
    }

    fn check_id(&self, field: &str, value: &str) -> Option<String> {
        let len = value.chars().count();
        if !(MIN_ID_CHARS..=MAX_ID_CHARS).contains(&len) {
            return Some(format!(
                "{} must be {}-{} characters",
                field, MIN_ID_CHARS, MAX_ID_CHARS
            ));
        }
        if !self.id_pattern.is_match(value) {
            return Some(format!(
                "{} contains invalid characters; only alphanumeric, @, ., -, and _ are allowed",
                field
            ));
        }
        None
    }
}

impl Default for RequestValidator {
    fn default() -> Self {
        Self::new()
    }
}
