//! OpenAI-compatible chat service.
//!
//! Minimal, non-streaming client around the chat-completions REST API.
//! The endpoint is derived from `LlmModelConfig::endpoint`:
//! - POST {endpoint}/v1/chat/completions
//!
//! Constructor validation:
//! - `cfg.provider` must be `LlmProvider::OpenAi`
//! - `cfg.api_key` must be present
//! - `cfg.endpoint` must start with http:// or https://

use std::time::{Duration, Instant};

use reqwest::header;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::{llm_model_config::LlmModelConfig, llm_provider::LlmProvider};
use crate::error_handler::{AiLlmError, ConfigError, make_snippet};

/// Thin client for an OpenAI-compatible chat API.
///
/// Constructed from a complete [`LlmModelConfig`]; internally keeps a
/// preconfigured `reqwest::Client` with timeout and default headers.
#[derive(Debug)]
pub struct OpenAiService {
    client: reqwest::Client,
    cfg: LlmModelConfig,
    url_chat: String,
}

impl OpenAiService {
    /// Creates a new [`OpenAiService`] from the given config.
    pub fn new(cfg: LlmModelConfig) -> Result<Self, AiLlmError> {
        if cfg.provider != LlmProvider::OpenAi {
            return Err(ConfigError::UnsupportedProvider(cfg.provider.to_string()).into());
        }

        let api_key = cfg
            .api_key
            .clone()
            .ok_or(ConfigError::MissingVar("LLM_API_KEY"))?;

        let endpoint = cfg.endpoint.trim();
        if endpoint.is_empty()
            || !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            return Err(ConfigError::InvalidFormat {
                var: "LLM_ENDPOINT",
                reason: "must start with http:// or https://",
            }
            .into());
        }

        let timeout = cfg
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(60));

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| AiLlmError::Decode(format!("invalid API key header: {e}")))?,
        );
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        let base = endpoint.trim_end_matches('/').to_string();
        let url_chat = format!("{}/v1/chat/completions", base);

        info!(
            provider = %cfg.provider,
            model = %cfg.model,
            endpoint = %cfg.endpoint,
            timeout_secs = cfg.timeout_secs.unwrap_or(60),
            "OpenAiService initialized"
        );

        Ok(Self {
            client,
            cfg,
            url_chat,
        })
    }

    /// Performs a non-streaming chat completion.
    ///
    /// # Errors
    /// - [`AiLlmError::HttpStatus`] for non-2xx responses
    /// - [`AiLlmError::Transport`] for client/network failures
    /// - [`AiLlmError::Decode`] if the JSON cannot be parsed or no choices
    ///   are returned
    pub async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, AiLlmError> {
        let started = Instant::now();
        let body = ChatCompletionRequest::from_cfg(&self.cfg, prompt, system);

        debug!(
            model = %self.cfg.model,
            prompt_len = prompt.len(),
            has_system = system.is_some(),
            "POST {}", self.url_chat
        );

        let resp = self.client.post(&self.url_chat).json(&body).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let url = self.url_chat.clone();
            let text = resp.text().await.unwrap_or_default();
            let snippet = make_snippet(&text);

            error!(
                %status,
                %url,
                %snippet,
                model = %self.cfg.model,
                latency_ms = started.elapsed().as_millis(),
                "chat completion returned non-success status"
            );

            return Err(AiLlmError::HttpStatus {
                status,
                url,
                snippet,
            });
        }

        let out: ChatCompletionResponse = resp.json().await.map_err(|e| {
            AiLlmError::Decode(format!(
                "serde error: {e}; expected `choices[0].message.content`"
            ))
        })?;

        let content = out
            .choices
            .into_iter()
            .find_map(|c| c.message.content)
            .ok_or_else(|| AiLlmError::Decode("empty `choices` in response".into()))?;

        info!(
            model = %self.cfg.model,
            latency_ms = started.elapsed().as_millis(),
            "chat completion completed"
        );

        Ok(content)
    }
}

/* ===========================================================================
HTTP payloads
======================================================================== */

/// Minimal request body for `/v1/chat/completions` (non-streaming).
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

impl<'a> ChatCompletionRequest<'a> {
    fn from_cfg(cfg: &'a LlmModelConfig, prompt: &'a str, system: Option<&'a str>) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(sys) = system {
            messages.push(ChatMessage {
                role: "system",
                content: sys,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });

        Self {
            model: &cfg.model,
            messages,
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            max_tokens: cfg.max_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageOut,
}

#[derive(Debug, Deserialize)]
struct ChatMessageOut {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LlmModelConfig {
        LlmModelConfig {
            provider: LlmProvider::OpenAi,
            model: "gpt-4o-mini".into(),
            endpoint: "https://api.openai.com".into(),
            api_key: Some("sk-test".into()),
            max_tokens: Some(1024),
            temperature: Some(0.2),
            top_p: None,
            timeout_secs: Some(60),
        }
    }

    #[test]
    fn constructor_validates_provider_and_key() {
        assert!(OpenAiService::new(cfg()).is_ok());

        let mut bad = cfg();
        bad.api_key = None;
        assert!(OpenAiService::new(bad).is_err());

        let mut bad = cfg();
        bad.provider = LlmProvider::Ollama;
        assert!(OpenAiService::new(bad).is_err());

        let mut bad = cfg();
        bad.endpoint = "api.openai.com".into();
        assert!(OpenAiService::new(bad).is_err());
    }

    #[test]
    fn request_shape_includes_system_first() {
        let c = cfg();
        let req = ChatCompletionRequest::from_cfg(&c, "review this", Some("you are a reviewer"));
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, "system");
        assert_eq!(req.messages[1].role, "user");
        assert_eq!(req.max_tokens, Some(1024));
    }
}
