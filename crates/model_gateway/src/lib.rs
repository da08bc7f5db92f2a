#![deny(unused)]
//! Model gateway for the Knowledge Hub.
//!
//! This crate provides:
//! - Ordered provider failover with per-attempt timeouts
//! - Provider health tracking and circuit breaker
//! - Streaming with cancellation
//! - Rig and OpenAI-compatible providers, plus an offline mock
//! - Cost estimation

pub mod config;
pub mod mock;
pub mod openai_compat;
pub mod pricing;
pub mod providers;
pub mod rig_client;
pub mod router;
pub mod stream;

pub use config::{build_router, configured_providers};
pub use mock::{MockProvider, MOCK_PROVIDER};
pub use openai_compat::{OpenAiCompatibleConfig, OpenAiCompatibleProvider};
pub use pricing::{ModelPricing, PricingRegistry};
pub use providers::{HealthPolicy, ProviderRegistry, ProviderStatus};
pub use rig_client::{RigBackend, RigProvider};
pub use router::{ProviderRouter, RouterSettings};
pub use stream::ChunkStream;
