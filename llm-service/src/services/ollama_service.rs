//! Lightweight Ollama service for text generation.
//!
//! Thin client for the local Ollama API:
//! - `POST {endpoint}/api/generate` — synchronous text generation
//!   (`stream=false`)
//!
//! Uses the universal [`LlmModelConfig`] and ensures the selected provider
//! is [`LlmProvider::Ollama`].

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::{llm_model_config::LlmModelConfig, llm_provider::LlmProvider};
use crate::error_handler::{AiLlmError, ConfigError, make_snippet};

/// Thin client for Ollama. Reuses an HTTP client with a configurable
/// timeout.
#[derive(Debug)]
pub struct OllamaService {
    client: reqwest::Client,
    cfg: LlmModelConfig,
    url_generate: String,
}

impl OllamaService {
    /// Creates a new [`OllamaService`] from the given config.
    pub fn new(cfg: LlmModelConfig) -> Result<Self, AiLlmError> {
        if cfg.provider != LlmProvider::Ollama {
            return Err(ConfigError::UnsupportedProvider(cfg.provider.to_string()).into());
        }

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

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let url_generate = format!("{}/api/generate", endpoint.trim_end_matches('/'));

        info!(
            provider = %cfg.provider,
            model = %cfg.model,
            endpoint = %cfg.endpoint,
            timeout_secs = cfg.timeout_secs.unwrap_or(60),
            "OllamaService initialized"
        );

        Ok(Self {
            client,
            cfg,
            url_generate,
        })
    }

    /// Calls `POST /api/generate` with a combined system+user prompt.
    pub async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, AiLlmError> {
        let started = Instant::now();
        let full_prompt = match system {
            Some(sys) => format!("{}\n\n{}", sys, prompt),
            None => prompt.to_string(),
        };

        let req = GenerateRequest {
            model: &self.cfg.model,
            prompt: full_prompt,
            stream: false,
        };

        debug!(
            model = %self.cfg.model,
            prompt_len = prompt.len(),
            "POST {}", self.url_generate
        );

        let resp = self
            .client
            .post(&self.url_generate)
            .json(&req)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let url = self.url_generate.clone();
            let text = resp.text().await.unwrap_or_default();
            let snippet = make_snippet(&text);

            error!(
                %status,
                %url,
                %snippet,
                model = %self.cfg.model,
                latency_ms = started.elapsed().as_millis(),
                "generate returned non-success status"
            );

            return Err(AiLlmError::HttpStatus {
                status,
                url,
                snippet,
            });
        }

        let out: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| AiLlmError::Decode(format!("serde error: {e}; expected `response`")))?;

        info!(
            model = %self.cfg.model,
            latency_ms = started.elapsed().as_millis(),
            "generation completed"
        );

        Ok(out.response)
    }
}

/* ===========================================================================
HTTP payloads
======================================================================== */

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_validates_endpoint() {
        let cfg = LlmModelConfig {
            provider: LlmProvider::Ollama,
            model: "qwen2.5-coder:7b".into(),
            endpoint: "http://127.0.0.1:11434".into(),
            api_key: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            timeout_secs: None,
        };
        assert!(OllamaService::new(cfg.clone()).is_ok());

        let mut bad = cfg;
        bad.endpoint = "127.0.0.1:11434".into();
        assert!(OllamaService::new(bad).is_err());
    }
}
