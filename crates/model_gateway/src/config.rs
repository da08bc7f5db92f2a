//! Provider setup from application configuration.

use std::sync::Arc;

use knowledge_hub_core::config::AppConfig;
use knowledge_hub_core::{LlmProvider, Result};

use crate::mock::MockProvider;
use crate::openai_compat::{OpenAiCompatibleConfig, OpenAiCompatibleProvider};
use crate::pricing::PricingRegistry;
use crate::providers::{HealthPolicy, ProviderRegistry};
use crate::rig_client::{RigBackend, RigProvider};
use crate::router::{ProviderRouter, RouterSettings};

/// Providers enabled in the configuration, in priority order:
/// Azure, then OpenAI, then Anthropic.
///
/// A provider whose credentials are missing is skipped with a warning. When
/// nothing usable remains the offline [`MockProvider`] is used.
pub fn configured_providers(config: &AppConfig) -> Result<Vec<Arc<dyn LlmProvider>>> {
    let mut providers: Vec<Arc<dyn LlmProvider>> = Vec::new();
    let p = &config.providers;

    if p.azure.enabled {
        if p.azure.api_key.is_some() {
            let azure = OpenAiCompatibleConfig::from_azure_config(&p.azure)?;
            providers.push(Arc::new(OpenAiCompatibleProvider::new(azure)?));
            tracing::info!(provider = "azure", status = "available", "LLM provider initialized");
        } else {
            tracing::warn!(provider = "azure", "providers.azure.api_key not set, provider skipped");
        }
    }

    for (backend, settings) in [
        (RigBackend::OpenAI, &p.openai),
        (RigBackend::Anthropic, &p.anthropic),
    ] {
        if !settings.enabled {
            continue;
        }
        if backend.is_available() {
            providers.push(Arc::new(RigProvider::new(backend, settings.model.clone())));
            tracing::info!(
                provider = backend.name(),
                status = "available",
                "LLM provider initialized"
            );
        } else {
            tracing::warn!(
                provider = backend.name(),
                "{} not set, provider skipped",
                backend.api_key_var()
            );
        }
    }

    if providers.is_empty() {
        tracing::warn!(
            status = "no_providers",
            "No LLM providers configured, running in offline mock mode"
        );
        providers.push(Arc::new(MockProvider::new()));
    }

    Ok(providers)
}

/// Build the router with its registry, health policy and timeouts.
pub fn build_router(config: &AppConfig) -> Result<ProviderRouter> {
    let mut registry = ProviderRegistry::new(HealthPolicy::from(&config.router));
    for provider in configured_providers(config)? {
        registry.register(provider);
    }

    Ok(ProviderRouter::new(Arc::new(registry))
        .with_settings(RouterSettings::from(&config.router))
        .with_pricing(PricingRegistry::with_defaults()))
}
