//! Resilient LLM invocation layer.
//!
//! A thin provider client (Ollama or any OpenAI-compatible chat endpoint)
//! wrapped with the reliability machinery the review pipeline needs:
//!
//! - per-attempt timeout and transient-aware retries with jittered backoff,
//! - bounded-concurrency batch fan-out with aggregate stats,
//! - a JSON repair cascade that turns almost-JSON model output into values
//!   conforming to the caller's schema (its serde type).
//!
//! Cancellation is cooperative: every blocking operation is a Tokio future,
//! so callers bound whole invocations with `tokio::time::timeout` (the
//! worker's job budget does exactly that) and dropped futures abort their
//! in-flight HTTP requests.
//!
//! No `async-trait` and no `Box<dyn ...>`: backends are enum-dispatched.

pub mod config;
pub mod error_handler;
pub mod repair;
pub mod resilient;
pub mod services;

pub use config::llm_model_config::LlmModelConfig;
pub use config::llm_provider::LlmProvider;
pub use error_handler::AiLlmError;
pub use resilient::{BatchStats, Invoked, ResilientLlmClient, RetryPolicy};
