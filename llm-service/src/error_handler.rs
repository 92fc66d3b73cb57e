//! Error types and validation helpers for `llm-service`.
//!
//! All error messages include the suffix `[LLM Service]` so bubbled-up
//! errors can be attributed to this library. The split the pipeline cares
//! about is transient (retry locally, then job-level retry) versus schema
//! (abort only the offending batch): see [`AiLlmError::is_transient`].

use reqwest::StatusCode;
use thiserror::Error;

/// Convenient result alias for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root error type for LLM invocations.
#[derive(Debug, Error)]
pub enum AiLlmError {
    /// Transport-level failure (DNS, connect, reset, body read).
    #[error("[LLM Service] transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success HTTP status from the provider.
    #[error("[LLM Service] unexpected HTTP status {status} from {url}: {snippet}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        snippet: String,
    },

    /// A single attempt exceeded its timeout.
    #[error("[LLM Service] attempt timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The provider answered but the payload had an unexpected shape.
    #[error("[LLM Service] failed to decode response: {0}")]
    Decode(String),

    /// Output stayed unparseable or schema-violating after every repair.
    #[error("[LLM Service] output does not conform to schema after repairs: {0}")]
    Schema(String),

    /// Configuration problem detected at client construction.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AiLlmError {
    /// Whether the retry loop should try again: network errors, 5xx,
    /// explicit rate-limit signals, and timeouts. 4xx other than 429 and
    /// schema violations are not retried.
    pub fn is_transient(&self) -> bool {
        match self {
            AiLlmError::Transport(e) => e.status().is_none_or(|s| {
                s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS
            }),
            AiLlmError::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            AiLlmError::Timeout { .. } => true,
            AiLlmError::Decode(_) | AiLlmError::Schema(_) | AiLlmError::Config(_) => false,
        }
    }
}

/// Error enum for environment/config-driven setup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing or empty.
    #[error("[LLM Service] missing required environment variable: {0}")]
    MissingVar(&'static str),

    /// A number failed to parse (limits, timeouts).
    #[error("[LLM Service] invalid number in {var}: {reason}")]
    InvalidNumber {
        var: &'static str,
        reason: &'static str,
    },

    /// Unsupported provider in `LLM_PROVIDER`.
    #[error("[LLM Service] unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// Value had the wrong format (e.g., invalid URL).
    #[error("[LLM Service] invalid format in {var}: {reason}")]
    InvalidFormat {
        var: &'static str,
        reason: &'static str,
    },
}

/* ------------------------ Env helpers ------------------------ */

/// Fetches a required, non-empty environment variable.
pub fn must_env(name: &'static str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingVar(name)),
    }
}

/// Parses an optional `u32` from env (`Ok(None)` if unset/empty).
pub fn env_opt_u32(name: &'static str) -> Result<Option<u32>> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => {
            v.parse::<u32>()
                .map(Some)
                .map_err(|_| ConfigError::InvalidNumber {
                    var: name,
                    reason: "expected u32",
                })
        }
        _ => Ok(None),
    }
}

/// Parses an optional `u64` from env (`Ok(None)` if unset/empty).
pub fn env_opt_u64(name: &'static str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => {
            v.parse::<u64>()
                .map(Some)
                .map_err(|_| ConfigError::InvalidNumber {
                    var: name,
                    reason: "expected u64",
                })
        }
        _ => Ok(None),
    }
}

/// Validates that an HTTP endpoint starts with `http://` or `https://`.
pub fn validate_http_endpoint(var: &'static str, value: &str) -> Result<()> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::InvalidFormat {
            var,
            reason: "must start with http:// or https://",
        })
    }
}

/// Short snippet of a response body for error messages and logs.
pub fn make_snippet(body: &str) -> String {
    const MAX: usize = 300;
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX {
        trimmed.to_string()
    } else {
        let mut s: String = trimmed.chars().take(MAX).collect();
        s.push('…');
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let e = AiLlmError::HttpStatus {
            status: StatusCode::BAD_GATEWAY,
            url: "u".into(),
            snippet: String::new(),
        };
        assert!(e.is_transient());

        let e = AiLlmError::HttpStatus {
            status: StatusCode::TOO_MANY_REQUESTS,
            url: "u".into(),
            snippet: String::new(),
        };
        assert!(e.is_transient());

        let e = AiLlmError::HttpStatus {
            status: StatusCode::UNAUTHORIZED,
            url: "u".into(),
            snippet: String::new(),
        };
        assert!(!e.is_transient());

        assert!(AiLlmError::Timeout { secs: 60 }.is_transient());
        assert!(!AiLlmError::Schema("bad".into()).is_transient());
    }

    #[test]
    fn snippet_truncates() {
        let long = "x".repeat(1000);
        let s = make_snippet(&long);
        assert!(s.chars().count() <= 301);
        assert!(s.ends_with('…'));
    }
}
