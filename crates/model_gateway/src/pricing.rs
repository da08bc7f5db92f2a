//! Cost estimation per model family.

use serde::{Deserialize, Serialize};

/// Fallback price when no family matches, in USD per 1K tokens.
pub const DEFAULT_COST_PER_1K: f64 = 0.01;

/// Blended price for one model family (prompt and completion averaged).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Substring identifying the family, e.g. `gpt-4o`.
    pub family: String,
    /// Cost per 1K tokens in USD.
    pub cost_per_1k: f64,
}

impl ModelPricing {
    pub fn new(family: impl Into<String>, cost_per_1k: f64) -> Self {
        Self {
            family: family.into(),
            cost_per_1k,
        }
    }

    pub fn estimate_cost(&self, tokens: u64) -> f64 {
        (tokens as f64 / 1000.0) * self.cost_per_1k
    }
}

/// Ordered price table. The most specific family wins.
#[derive(Debug, Clone)]
pub struct PricingRegistry {
    models: Vec<ModelPricing>,
    fallback_per_1k: f64,
}

impl PricingRegistry {
    pub fn new() -> Self {
        Self {
            models: Vec::new(),
            fallback_per_1k: DEFAULT_COST_PER_1K,
        }
    }

    /// Table with approximate public list prices.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ModelPricing::new("gpt-4", 0.045));
        registry.register(ModelPricing::new("gpt-4o", 0.03));
        registry.register(ModelPricing::new("gpt-3.5-turbo", 0.00175));
        registry.register(ModelPricing::new("gpt-35-turbo", 0.00175));
        registry.register(ModelPricing::new("claude-2", 0.008));
        registry.register(ModelPricing::new("gemini-pro", 0.001));
        registry
    }

    pub fn register(&mut self, pricing: ModelPricing) {
        self.models.retain(|m| m.family != pricing.family);
        self.models.push(pricing);
    }

    /// Pricing entry for a model, matching on the bare model name.
    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        let base = model.rsplit('/').next().unwrap_or(model).to_lowercase();
        self.models
            .iter()
            .filter(|m| base.contains(&m.family))
            .max_by_key(|m| m.family.len())
    }

    /// Estimated USD cost of `tokens` on `model`.
    pub fn estimate_cost(&self, model: &str, tokens: u64) -> f64 {
        match self.get(model) {
            Some(pricing) => pricing.estimate_cost(tokens),
            None => (tokens as f64 / 1000.0) * self.fallback_per_1k,
        }
    }
}

impl Default for PricingRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
