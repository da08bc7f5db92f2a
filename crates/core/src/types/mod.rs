//! Core type definitions for the gateway.
//!
//! Broken down into submodules by pipeline concern.

pub mod completion;
pub mod principal;
pub mod provider;
pub mod quota;
pub mod request;

pub use completion::*;
pub use principal::*;
pub use provider::*;
pub use quota::*;
pub use request::*;
