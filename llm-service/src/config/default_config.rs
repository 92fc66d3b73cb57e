//! Environment-driven defaults for the LLM client.
//!
//! Read once at startup:
//! - `LLM_PROVIDER`        — "ollama" | "openai" (required)
//! - `LLM_MODEL`           — model identifier (required)
//! - `LLM_ENDPOINT`        — inference endpoint URL (required)
//! - `LLM_API_KEY`         — API key (required for OpenAI-compatible)
//! - `LLM_MAX_TOKENS`      — optional generation cap
//! - `LLM_TEMPERATURE`     — optional sampling temperature
//! - `LLM_TIMEOUT_SECS`    — per-attempt timeout (default 60)
//! - `LLM_MAX_ATTEMPTS`    — retry budget (default 3)
//! - `LLM_BATCH_CONCURRENCY` — batch fan-out bound (default 4)

use crate::config::llm_model_config::LlmModelConfig;
use crate::config::llm_provider::LlmProvider;
use crate::error_handler::{
    ConfigError, env_opt_u32, env_opt_u64, must_env, validate_http_endpoint,
};
use crate::resilient::RetryPolicy;

/// Loads the model config from the environment.
pub fn model_config_from_env() -> Result<LlmModelConfig, ConfigError> {
    let provider_raw = must_env("LLM_PROVIDER")?;
    let provider = LlmProvider::parse(&provider_raw)
        .ok_or(ConfigError::UnsupportedProvider(provider_raw))?;

    let endpoint = must_env("LLM_ENDPOINT")?;
    validate_http_endpoint("LLM_ENDPOINT", &endpoint)?;

    let api_key = std::env::var("LLM_API_KEY").ok().filter(|v| !v.is_empty());
    if matches!(provider, LlmProvider::OpenAi) && api_key.is_none() {
        return Err(ConfigError::MissingVar("LLM_API_KEY"));
    }

    Ok(LlmModelConfig {
        provider,
        model: must_env("LLM_MODEL")?,
        endpoint,
        api_key,
        max_tokens: env_opt_u32("LLM_MAX_TOKENS")?,
        temperature: None,
        top_p: None,
        timeout_secs: env_opt_u64("LLM_TIMEOUT_SECS")?,
    })
}

/// Loads the retry/batch policy from the environment.
pub fn retry_policy_from_env() -> Result<RetryPolicy, ConfigError> {
    let mut policy = RetryPolicy::default();
    if let Some(n) = env_opt_u32("LLM_MAX_ATTEMPTS")? {
        policy.max_attempts = n.max(1);
    }
    if let Some(n) = env_opt_u32("LLM_BATCH_CONCURRENCY")? {
        policy.batch_concurrency = (n as usize).max(1);
    }
    Ok(policy)
}
