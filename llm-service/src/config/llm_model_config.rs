use crate::config::llm_provider::LlmProvider;

/// Configuration for an LLM model invocation.
///
/// Contains both general and provider-specific parameters; extend as needed
/// to support new backends.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmModelConfig {
    /// The LLM provider/backend.
    pub provider: LlmProvider,

    /// Model identifier string (e.g., `"gpt-4o-mini"`, `"qwen2.5-coder:7b"`).
    pub model: String,

    /// Inference endpoint (local server or remote API URL).
    pub endpoint: String,

    /// Optional API key for providers that require authentication.
    pub api_key: Option<String>,

    /// Maximum number of tokens to generate.
    pub max_tokens: Option<u32>,

    /// Sampling temperature.
    pub temperature: Option<f32>,

    /// Nucleus sampling parameter.
    pub top_p: Option<f32>,

    /// Per-attempt request timeout in seconds (default 60).
    pub timeout_secs: Option<u64>,
}
