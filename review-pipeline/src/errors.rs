//! Crate-wide error hierarchy for the review pipeline.
//!
//! Goals:
//! - Single root `Error` for all public functions.
//! - Forge-aware mapping (401→permanent, 429→transient, 5xx→transient).
//! - A `is_retryable` classification the worker uses to route failures into
//!   job-level retry versus discard.
//! - No dynamic dispatch, ergonomic `?` via `From` impls.

use thiserror::Error;

/// Convenient alias for crate-wide results.
pub type PipelineResult<T> = Result<T, Error>;

/// Root error type for the review-pipeline crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration problems (missing credentials, malformed connector).
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Webhook signature invalid.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// Payload does not match the event kind it claims to be.
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// Forge (GitHub/GitLab/Bitbucket) call failure.
    #[error(transparent)]
    Forge(#[from] ForgeError),

    /// LLM invocation failure (transient or schema).
    #[error(transparent)]
    Llm(#[from] llm_service::AiLlmError),

    /// Store failure (queue, events, registry).
    #[error(transparent)]
    Store(#[from] review_store::errors::StoreError),

    /// Lease lost or job vanished mid-flight.
    #[error("state error: {0}")]
    State(String),

    /// Deadline or attempt budget exceeded.
    #[error("budget exceeded: {0}")]
    Budget(String),

    /// A requested (path, side, line) does not land in any diff hunk.
    #[error(transparent)]
    Position(#[from] PositionError),
}

impl Error {
    /// Whether the worker should schedule a job-level retry for this error.
    ///
    /// Transient forge/LLM failures and exhausted deadlines retry; payload,
    /// signature, config, schema, and permanent forge errors do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Forge(f) => f.is_transient(),
            Error::Llm(e) => e.is_transient(),
            Error::Store(review_store::errors::StoreError::Db(_)) => true,
            Error::Budget(_) => true,
            _ => false,
        }
    }
}

/// Forge call failure, split by retry semantics.
#[derive(Debug, Error)]
pub enum ForgeError {
    /// 5xx, 429, or transport-level trouble: worth retrying.
    #[error("transient forge error: {0}")]
    Transient(String),

    /// 4xx (other than 429) with an unchanging body: never retried.
    #[error("permanent forge error: status {status}: {detail}")]
    Permanent { status: u16, detail: String },

    /// Timeout at transport level.
    #[error("forge timeout")]
    Timeout,

    /// Unexpected/invalid shape of a forge response.
    #[error("invalid forge response: {0}")]
    InvalidResponse(String),
}

impl ForgeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ForgeError::Transient(_) | ForgeError::Timeout)
    }

    /// Maps an HTTP status + body snippet into the right variant.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        match status {
            429 | 500..=599 => ForgeError::Transient(format!("status {status}")),
            _ => ForgeError::Permanent {
                status,
                detail: detail.into(),
            },
        }
    }
}

impl From<reqwest::Error> for ForgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return ForgeError::Timeout;
        }
        if let Some(status) = e.status() {
            return ForgeError::from_status(status.as_u16(), e.to_string());
        }
        ForgeError::Transient(format!("network error: {e}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Forge(ForgeError::from(e))
    }
}

/// Webhook signature verification failure.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("missing signature header {0}")]
    MissingHeader(&'static str),

    #[error("malformed signature header")]
    Malformed,

    #[error("signature mismatch")]
    Mismatch,
}

/// Payload conversion failure. Providers fail fast on shape mismatch
/// rather than filling defaults.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field `{0}` in {1} payload")]
    MissingField(&'static str, &'static str),

    #[error("payload shape does not match event `{event}`: {detail}")]
    ShapeMismatch { event: String, detail: String },
}

/// Configuration and setup errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing provider token for connector {0}")]
    MissingToken(String),

    #[error("connector {0} is disabled")]
    ConnectorDisabled(String),

    #[error("invalid base api url: {0}")]
    InvalidBaseUrl(String),

    #[error("invalid merge request url: {0}")]
    InvalidMrUrl(String),
}

/// Anchor resolution failure from the diff engine.
#[derive(Debug, Error)]
pub enum PositionError {
    /// The line is outside every hunk; the output layer degrades such a
    /// comment to the summary instead of dropping it.
    #[error("line {line} ({side}) of {path} is outside every diff hunk")]
    UnanchorableLine {
        path: String,
        side: &'static str,
        line: u32,
    },

    #[error("file {0} is not part of the diff")]
    UnknownFile(String),

    /// Side not valid for the file's status (new side on a deleted file,
    /// old side on an added file).
    #[error("side {side} not valid for {path} ({status})")]
    InvalidSide {
        path: String,
        side: &'static str,
        status: &'static str,
    },
}
