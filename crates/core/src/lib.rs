//! Shared domain primitives for the render orchestration engine.
//!
//! - [`types`]: identifier, timestamp and reference aliases.
//! - [`error`]: [`CoreError`](error::CoreError), the cross-crate domain error.
//! - [`hashing`]: segment fingerprints and idempotency keys.
//! - [`taxonomy`]: generation error codes and failure classification.
//! - [`retry`]: polling backoff policy.
//! - [`config`]: [`EngineConfig`](config::EngineConfig) and execution modes.

pub mod config;
pub mod error;
pub mod hashing;
pub mod retry;
pub mod taxonomy;
pub mod types;
