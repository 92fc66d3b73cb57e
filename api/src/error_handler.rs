//! Public application error type and its HTTP mapping.
//!
//! The webhook contract is strict about two bodies:
//! - invalid signature → 401 `{"error":"invalid_signature"}`
//! - backpressure → 503 `{"error":"backpressure"}`
//!
//! Everything else uses the `{error, message}` envelope.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use review_pipeline::errors::Error as PipelineError;
use review_store::errors::StoreError;

/// Public application error type.
#[derive(Debug, Error)]
pub enum AppError {
    // --- Boot / config ---
    #[error("missing required environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("failed to bind listener")]
    Bind(#[source] std::io::Error),

    #[error("server error")]
    Server(#[source] std::io::Error),

    // --- Request / routing ---
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Webhook signature rejected.
    #[error("invalid signature")]
    InvalidSignature,

    /// Queue depth above the watermark; manual triggers are shed.
    #[error("queue is over capacity")]
    Backpressure,

    /// Enqueue (or another store write) failed; the forge will retry.
    #[error("storage error: {0}")]
    Storage(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::MissingEnv(_) => StatusCode::INTERNAL_SERVER_ERROR, // startup-only
            AppError::Bind(_) | AppError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidSignature => StatusCode::UNAUTHORIZED,
            AppError::Backpressure => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            AppError::MissingEnv(_) => "MISSING_ENV",
            AppError::Bind(_) => "BIND_ERROR",
            AppError::Server(_) => "SERVER_ERROR",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::InvalidSignature => "invalid_signature",
            AppError::Backpressure => "backpressure",
            AppError::Storage(_) => "STORAGE_ERROR",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // The webhook contract bodies carry no message field.
        let message = match self {
            AppError::InvalidSignature | AppError::Backpressure => None,
            ref other => Some(other.to_string()),
        };
        let body = ErrorBody {
            error: self.error_code(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

/// Handy result alias used across handlers.
pub type AppResult<T> = Result<T, AppError>;

impl From<review_pipeline::errors::ConversionError> for AppError {
    fn from(err: review_pipeline::errors::ConversionError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => AppError::NotFound(what),
            other => AppError::Storage(other.to_string()),
        }
    }
}

/// Conversion/signature failures surface in the webhook response; the rest
/// is server-side.
impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Signature(_) => AppError::InvalidSignature,
            PipelineError::Conversion(e) => AppError::BadRequest(e.to_string()),
            PipelineError::Config(e) => AppError::BadRequest(e.to_string()),
            PipelineError::Store(e) => e.into(),
            other => AppError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_error_maps_to_exact_contract() {
        let resp = AppError::InvalidSignature.into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn pipeline_errors_map_by_kind() {
        use review_pipeline::errors::{ConversionError, SignatureError};

        let app: AppError = PipelineError::Signature(SignatureError::Mismatch).into();
        assert!(matches!(app, AppError::InvalidSignature));

        let app: AppError =
            PipelineError::Conversion(ConversionError::MissingField("x", "github")).into();
        assert!(matches!(app, AppError::BadRequest(_)));
    }
}
