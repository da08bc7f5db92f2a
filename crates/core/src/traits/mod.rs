//! Core traits.
//!
//! - `llm`: provider capability consumed by the model gateway

pub mod llm;

pub use llm::*;
