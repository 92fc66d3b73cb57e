//! Resilient invocation wrapper: timeout, retries, batch fan-out.
//!
//! Wraps a provider backend (enum dispatch, no trait objects) with:
//! - per-attempt timeout (default 60 s, from `LlmModelConfig::timeout_secs`),
//! - exponential backoff with jitter for transient failures (network, 5xx,
//!   429, timeout) up to the retry budget (default 3 attempts),
//! - the JSON repair cascade applied to every raw completion,
//! - bounded-concurrency batch fan-out (default 4) with aggregate stats.
//!
//! Schema violations are never retried here: the model answered, it just
//! answered badly — the processor aborts only the offending batch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::llm_model_config::LlmModelConfig;
use crate::config::llm_provider::LlmProvider;
use crate::error_handler::AiLlmError;
use crate::repair::repair_to;
use crate::services::{ollama_service::OllamaService, open_ai_service::OpenAiService};

/// Retry and fan-out knobs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per invocation (first call included).
    pub max_attempts: u32,
    /// Base backoff delay before the second attempt.
    pub base_delay_ms: u64,
    /// Backoff ceiling.
    pub max_delay_ms: u64,
    /// Concurrent in-flight prompts per batch.
    pub batch_concurrency: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            batch_concurrency: 4,
        }
    }
}

/// One successful invocation with its reliability metadata.
#[derive(Debug, Clone)]
pub struct Invoked<T> {
    /// Schema-conforming value.
    pub value: T,
    /// Repair strategies that were needed (empty = clean output).
    pub repairs: Vec<&'static str>,
    /// Attempts consumed (1 = no retry).
    pub attempts: u32,
    /// Wall-clock time across all attempts.
    pub elapsed: Duration,
}

/// Aggregate counters for one batch fan-out.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BatchStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Prompts whose output needed at least one repair strategy.
    pub repaired: usize,
    /// Attempts beyond the first, summed over all prompts.
    pub retries: usize,
    pub elapsed_ms: u128,
}

/// Provider backend, enum-dispatched.
#[derive(Debug)]
enum LlmBackend {
    Ollama(OllamaService),
    OpenAi(OpenAiService),
}

impl LlmBackend {
    async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, AiLlmError> {
        match self {
            LlmBackend::Ollama(s) => s.generate(prompt, system).await,
            LlmBackend::OpenAi(s) => s.generate(prompt, system).await,
        }
    }
}

/// The resilient client. Construct once, wrap in `Arc`, pass clones around.
#[derive(Debug)]
pub struct ResilientLlmClient {
    backend: LlmBackend,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl ResilientLlmClient {
    /// Builds the backend for the configured provider.
    pub fn new(cfg: LlmModelConfig, policy: RetryPolicy) -> Result<Self, AiLlmError> {
        let attempt_timeout = Duration::from_secs(cfg.timeout_secs.unwrap_or(60));
        let backend = match cfg.provider {
            LlmProvider::Ollama => LlmBackend::Ollama(OllamaService::new(cfg)?),
            LlmProvider::OpenAi => LlmBackend::OpenAi(OpenAiService::new(cfg)?),
        };
        Ok(Self {
            backend,
            policy,
            attempt_timeout,
        })
    }

    /// Single invocation: prompt in, schema-conforming `T` out.
    ///
    /// Retries transient failures with jittered exponential backoff; runs
    /// the repair cascade on every completion. Dropping the returned future
    /// aborts the in-flight HTTP request, which is how callers cancel.
    pub async fn invoke<T: DeserializeOwned>(
        &self,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<Invoked<T>, AiLlmError> {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let res = tokio::time::timeout(
                self.attempt_timeout,
                self.backend.generate(prompt, system),
            )
            .await;

            let err = match res {
                Ok(Ok(raw)) => {
                    return match repair_to::<T>(&raw) {
                        Ok((value, repairs)) => {
                            if !repairs.is_empty() {
                                debug!(?repairs, attempt, "output repaired");
                            }
                            Ok(Invoked {
                                value,
                                repairs,
                                attempts: attempt,
                                elapsed: started.elapsed(),
                            })
                        }
                        Err(e) => Err(e),
                    };
                }
                Ok(Err(e)) => e,
                Err(_) => AiLlmError::Timeout {
                    secs: self.attempt_timeout.as_secs(),
                },
            };

            if !err.is_transient() || attempt >= self.policy.max_attempts {
                return Err(err);
            }

            let delay = self.backoff_delay(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient LLM failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Fan-out over `prompts` with bounded concurrency.
    ///
    /// Results keep prompt order. A failed prompt occupies its slot with an
    /// error; the batch itself never fails wholesale.
    pub async fn invoke_batch<T>(
        self: Arc<Self>,
        prompts: Vec<String>,
        system: Option<String>,
    ) -> (Vec<Result<Invoked<T>, AiLlmError>>, BatchStats)
    where
        T: DeserializeOwned + Send + 'static,
    {
        let started = Instant::now();
        let sem = Arc::new(Semaphore::new(self.policy.batch_concurrency.max(1)));
        let total = prompts.len();

        let mut futs = Vec::with_capacity(total);
        for prompt in prompts {
            let client = Arc::clone(&self);
            let sem = Arc::clone(&sem);
            let system = system.clone();
            futs.push(tokio::spawn(async move {
                // Owned permit keeps the bound across the whole invocation,
                // retries included.
                let _permit = sem.acquire_owned().await;
                client.invoke::<T>(&prompt, system.as_deref()).await
            }));
        }

        let mut results = Vec::with_capacity(total);
        for f in futs {
            match f.await {
                Ok(r) => results.push(r),
                Err(e) => results.push(Err(AiLlmError::Decode(format!("join error: {e}")))),
            }
        }

        let mut stats = BatchStats {
            total,
            elapsed_ms: started.elapsed().as_millis(),
            ..Default::default()
        };
        for r in &results {
            match r {
                Ok(inv) => {
                    stats.succeeded += 1;
                    if !inv.repairs.is_empty() {
                        stats.repaired += 1;
                    }
                    stats.retries += inv.attempts.saturating_sub(1) as usize;
                }
                Err(_) => stats.failed += 1,
            }
        }
        debug!(
            total = stats.total,
            succeeded = stats.succeeded,
            failed = stats.failed,
            repaired = stats.repaired,
            elapsed_ms = stats.elapsed_ms as u64,
            "batch completed"
        );

        (results, stats)
    }

    /// Exponential backoff with jitter. Jitter is derived from the clock's
    /// sub-second noise so no RNG dependency is needed.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .policy
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(6))
            .min(self.policy.max_delay_ms);
        let jitter_span = (exp / 4).max(1);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0);
        Duration::from_millis(exp + nanos % jitter_span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ResilientLlmClient {
        ResilientLlmClient::new(
            LlmModelConfig {
                provider: LlmProvider::Ollama,
                model: "test".into(),
                endpoint: "http://127.0.0.1:11434".into(),
                api_key: None,
                max_tokens: None,
                temperature: None,
                top_p: None,
                timeout_secs: Some(5),
            },
            RetryPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn backoff_grows_and_caps() {
        let c = client();
        let d1 = c.backoff_delay(1);
        let d3 = c.backoff_delay(3);
        assert!(d1 >= Duration::from_millis(1_000));
        assert!(d3 >= Duration::from_millis(4_000));
        // Ceiling plus at most 25% jitter.
        assert!(c.backoff_delay(10) <= Duration::from_millis(10_000));
    }

    #[test]
    fn batch_stats_counting() {
        let mut stats = BatchStats {
            total: 3,
            ..Default::default()
        };
        let results: Vec<Result<Invoked<serde_json::Value>, AiLlmError>> = vec![
            Ok(Invoked {
                value: serde_json::json!({}),
                repairs: vec!["balance-braces"],
                attempts: 2,
                elapsed: Duration::from_millis(10),
            }),
            Ok(Invoked {
                value: serde_json::json!({}),
                repairs: vec![],
                attempts: 1,
                elapsed: Duration::from_millis(10),
            }),
            Err(AiLlmError::Schema("bad".into())),
        ];
        for r in &results {
            match r {
                Ok(inv) => {
                    stats.succeeded += 1;
                    if !inv.repairs.is_empty() {
                        stats.repaired += 1;
                    }
                    stats.retries += inv.attempts.saturating_sub(1) as usize;
                }
                Err(_) => stats.failed += 1,
            }
        }
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.repaired, 1);
        assert_eq!(stats.retries, 1);
    }
}
