//! # xg-core
//!
//! Shared building blocks for the exchange gateway crates:
//!
//! - **Error types** (`error`): the `XgError` taxonomy via thiserror
//! - **Configuration** (`config`): JSON config deserialization with defaults
//! - **Logging** (`logging`): tracing-based structured logging
//! - **Rate limiting** (`rate_limit`): token-paced gate for outbound commands

pub mod config;
pub mod error;
pub mod logging;
pub mod rate_limit;

pub use error::{Result, XgError};
pub use rate_limit::RateLimiter;
