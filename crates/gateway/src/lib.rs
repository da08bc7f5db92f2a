#![deny(unused)]
//! HTTP entry point for the Knowledge Hub.
//!
//! This crate provides the chat pipeline that composes the governance and
//! model gateway crates, the per-key request and conversation stores, and
//! the axum server exposing them.

pub mod error;
pub mod pipeline;
pub mod server;
pub mod store;

pub use error::ApiError;
pub use pipeline::{ChatOutcome, ChatPipeline, ChatReply, ChatStream, RateLimitInfo};
pub use server::{AppState, GatewayServer, RequestId};
pub use store::{ConversationStore, RequestRecord, RequestStatus, RequestStore};
