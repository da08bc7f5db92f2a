//! Prompt-injection guardrail.
//!
//! Detection is driven by an ordered rule table: each rule pairs an
//! [`InjectionCategory`] with a case-insensitive pattern, and the first rule
//! that matches decides the category. Patterns use word boundaries so that
//! ordinary prose ("systematic prompting", "medieval (") passes.

use regex::{Regex, RegexBuilder};

use knowledge_hub_core::{Error, InjectionCategory, Result};

/// Built-in rules, in evaluation order.
pub const DEFAULT_RULES: &[(InjectionCategory, &str)] = &[
    // Instruction override
    (
        InjectionCategory::InstructionOverride,
        concat!(
            r"\bignore\s+(?:all\s+)?(?:the\s+)?(?:previous|above|prior|earlier|all)\s+",
            r"(?:\w+\s+)?instructions?\b",
        ),
    ),
    (
        InjectionCategory::InstructionOverride,
        r"\bdisregard\s+(?:all\s+)?(?:the\s+)?(?:previous|above|prior|earlier)\b",
    ),
    (
        InjectionCategory::InstructionOverride,
        r"\bforget\s+(?:everything|all)\b.{0,40}?\b(?:instructions?|rules?|guidelines?|told)\b",
    ),
    // System prompt extraction
    (InjectionCategory::SystemPromptExtraction, r"\bsystem\s*prompts?\b"),
    (
        InjectionCategory::SystemPromptExtraction,
        concat!(
            r"\b(?:reveal|show|print|display|repeat|output)\s+(?:me\s+)?(?:all\s+)?your\s+",
            r"(?:system\s+|initial\s+|original\s+|hidden\s+)?(?:prompt|instructions)\b",
        ),
    ),
    // Role manipulation
    (InjectionCategory::RoleManipulation, r"\byou\s+are\s+now\b"),
    (InjectionCategory::RoleManipulation, r"\bpretend\s+(?:you\s+are|to\s+be)\b"),
    (InjectionCategory::RoleManipulation, r"\bact\s+as\s+(?:if|a|an)\b"),
    // Markup injection
    (InjectionCategory::MarkupInjection, r"<\s*script\b"),
    (InjectionCategory::MarkupInjection, r"<\s*iframe\b"),
    (InjectionCategory::MarkupInjection, r"<[^>]*\bon[a-z]+\s*="),
    // Protocol injection
    (InjectionCategory::ProtocolInjection, r"\bjavascript\s*:"),
    (InjectionCategory::ProtocolInjection, r"\bvbscript\s*:"),
    (InjectionCategory::ProtocolInjection, r"\bdata\s*:\s*text/html"),
    // Code execution
    (InjectionCategory::CodeExecution, r"\beval\s*\("),
    (InjectionCategory::CodeExecution, r"\bexec\s*\("),
    (InjectionCategory::CodeExecution, r"\b__import__\s*\("),
    (InjectionCategory::CodeExecution, r"\bos\s*\.\s*system\s*\("),
];

/// One compiled detection rule.
#[derive(Debug, Clone)]
pub struct InjectionRule {
    pub category: InjectionCategory,
    pattern: Regex,
}

impl InjectionRule {
    /// Compile a case-insensitive rule.
    pub fn new(category: InjectionCategory, pattern: &str) -> Result<Self> {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::config(format!("invalid injection rule '{}': {}", pattern, e)))?;
        Ok(Self { category, pattern })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

/// Ordered rule-table detector.
#[derive(Debug, Clone)]
pub struct InjectionDetector {
    rules: Vec<InjectionRule>,
}

impl InjectionDetector {
    /// Detector with the built-in rule table.
    pub fn new() -> Self {
        Self::from_table(DEFAULT_RULES).expect("built-in injection rules compile")
    }

    /// Build a detector from a `(category, pattern)` table.
    pub fn from_table(table: &[(InjectionCategory, &str)]) -> Result<Self> {
        let rules = table
            .iter()
            .map(|(category, pattern)| InjectionRule::new(*category, pattern))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Append a rule after the existing ones.
    pub fn with_rule(mut self, rule: InjectionRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Category of the first matching rule, if any.
    pub fn detect(&self, text: &str) -> Option<InjectionCategory> {
        self.rules
            .iter()
            .find(|rule| rule.is_match(text))
            .map(|rule| rule.category)
    }

    pub fn rules(&self) -> &[InjectionRule] {
        &self.rules
    }
}

impl Default for InjectionDetector {
    fn default() -> Self {
        Self::new()
    }
}
