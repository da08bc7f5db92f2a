#![deny(unused)]
//! Core types, traits, and error definitions for the Knowledge Hub gateway.
//!
//! This crate provides the building blocks shared by the governance,
//! model gateway and HTTP layers.

pub mod clock;
pub mod config;
pub mod error;
pub mod prompts;
pub mod traits;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use traits::*;
pub use types::*;
