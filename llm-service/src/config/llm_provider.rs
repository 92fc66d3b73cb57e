use std::fmt;

/// Represents the provider (backend) used for LLM inference.
///
/// Adding more providers in the future (e.g., Anthropic, Mistral API) is a
/// matter of extending this enum and the service dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmProvider {
    /// Local Ollama runtime for on-device inference.
    Ollama,
    /// Any OpenAI-compatible chat-completions API.
    OpenAi,
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmProvider::Ollama => write!(f, "ollama"),
            LlmProvider::OpenAi => write!(f, "openai"),
        }
    }
}

impl LlmProvider {
    /// Parses a provider name as used in `LLM_PROVIDER`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(LlmProvider::Ollama),
            "openai" | "openai-compatible" => Some(LlmProvider::OpenAi),
            _ => None,
        }
    }
}
