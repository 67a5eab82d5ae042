//! Typed error hierarchy. Each subsystem gets its own `thiserror` enum;
//! [`EngineError`] composes them for the HTTP boundary, where `.code()`
//! maps to the spec's error-envelope symbols.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
  #[error("Unsupported file type: {0}")]
  UnsupportedType(String),
  #[error("File has no extension")]
  NoExtension,
  #[error("File is {actual_mb:.2}MB, exceeds limit of {max_mb:.2}MB")]
  TooLarge { actual_mb: f64, max_mb: f64 },
  #[error("Invalid file size")]
  InvalidSize,
}

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("lancedb error: {0}")]
  Lance(#[from] lancedb::Error),
  #[error("arrow error: {0}")]
  Arrow(#[from] arrow::error::ArrowError),
  #[error("record not found: {0}")]
  NotFound(String),
  #[error("invalid input: {0}")]
  InvalidInput(String),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
  #[error("no embedding provider configured")]
  NoProvider,
  #[error("request failed: {0}")]
  Request(#[from] reqwest::Error),
  #[error("provider error: {0}")]
  Provider(String),
  #[error("device unavailable: {0:?}")]
  DeviceUnavailable(crate::config::EmbedDevice),
  #[error("request timed out")]
  Timeout,
}

#[derive(Debug, Error)]
pub enum PipelineError {
  #[error(transparent)]
  Validation(#[from] ValidationError),
  #[error(transparent)]
  Store(#[from] StoreError),
  #[error(transparent)]
  Embedding(#[from] EmbeddingError),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  #[error("parse error: {0}")]
  Parse(String),
  #[error("invalid state transition: {0}")]
  InvalidTransition(String),
  #[error("status error: {0}")]
  Status(#[from] crate::status::StatusError),
  #[error("cancelled")]
  Cancelled,
  #[error("stage '{0}' timed out")]
  StageTimeout(&'static str),
  #[error("internal: {0}")]
  Internal(String),
}

/// Top-level error the HTTP layer converts into the spec's error envelope.
#[derive(Debug, Error)]
pub enum EngineError {
  #[error("document not found: {0}")]
  DocumentNotFound(String),
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  #[error(transparent)]
  Validation(#[from] ValidationError),
  #[error(transparent)]
  Store(#[from] StoreError),
  #[error(transparent)]
  Embedding(#[from] EmbeddingError),
  #[error(transparent)]
  Pipeline(#[from] PipelineError),
  #[error("internal server error: {0}")]
  Internal(String),
}

impl EngineError {
  /// Symbol used in the `{error, code, details?}` envelope (SPEC_FULL.md §6).
  pub fn code(&self) -> &'static str {
    match self {
      EngineError::DocumentNotFound(_) => "DOCUMENT_NOT_FOUND",
      EngineError::InvalidRequest(_) => "INVALID_REQUEST",
      EngineError::Validation(ValidationError::UnsupportedType(_)) => "UNSUPPORTED_FORMAT",
      EngineError::Validation(ValidationError::TooLarge { .. }) => "FILE_TOO_LARGE",
      EngineError::Validation(_) => "INVALID_REQUEST",
      EngineError::Store(_) => "STORE_UNAVAILABLE",
      EngineError::Embedding(_) => "EMBED_UNAVAILABLE",
      EngineError::Pipeline(PipelineError::Validation(ValidationError::UnsupportedType(_))) => "UNSUPPORTED_FORMAT",
      EngineError::Pipeline(PipelineError::Validation(ValidationError::TooLarge { .. })) => "FILE_TOO_LARGE",
      EngineError::Pipeline(PipelineError::Validation(_)) => "INVALID_REQUEST",
      EngineError::Pipeline(PipelineError::Status(_)) => "INVALID_REQUEST",
      EngineError::Pipeline(PipelineError::Store(_)) => "STORE_UNAVAILABLE",
      EngineError::Pipeline(PipelineError::Embedding(_)) => "EMBED_UNAVAILABLE",
      EngineError::Pipeline(_) | EngineError::Internal(_) => "SERVER_ERROR",
    }
  }

  pub fn status_code(&self) -> u16 {
    match self {
      EngineError::DocumentNotFound(_) => 404,
      EngineError::InvalidRequest(_) | EngineError::Validation(_) => 400,
      EngineError::Store(_) | EngineError::Embedding(_) => 503,
      EngineError::Pipeline(PipelineError::Validation(_)) => 400,
      EngineError::Pipeline(PipelineError::Status(_)) => 400,
      EngineError::Pipeline(PipelineError::Store(_)) => 503,
      EngineError::Pipeline(PipelineError::Embedding(_)) => 503,
      EngineError::Pipeline(_) | EngineError::Internal(_) => 500,
    }
  }
}

/// Converts directly to the `{error, code, details?}` envelope (SPEC_FULL.md §6).
impl IntoResponse for EngineError {
  fn into_response(self) -> Response {
    let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({
      "error": self.to_string(),
      "code": self.code(),
    });
    (status, Json(body)).into_response()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pipeline_wrapped_validation_keeps_its_own_code() {
    let unsupported = EngineError::Pipeline(PipelineError::Validation(ValidationError::UnsupportedType("exe".into())));
    assert_eq!(unsupported.code(), "UNSUPPORTED_FORMAT");
    assert_eq!(unsupported.status_code(), 400);

    let too_large = EngineError::Pipeline(PipelineError::Validation(ValidationError::TooLarge { actual_mb: 100.0, max_mb: 50.0 }));
    assert_eq!(too_large.code(), "FILE_TOO_LARGE");
    assert_eq!(too_large.status_code(), 400);
  }

  #[test]
  fn pipeline_wrapped_status_error_is_a_client_error() {
    let wrapped = EngineError::Pipeline(PipelineError::Status(crate::status::StatusError::AlreadyActive("abc".into())));
    assert_eq!(wrapped.code(), "INVALID_REQUEST");
    assert_eq!(wrapped.status_code(), 400);
  }

  #[test]
  fn pipeline_internal_failure_is_still_server_error() {
    let internal = EngineError::Pipeline(PipelineError::Internal("worker panicked".into()));
    assert_eq!(internal.code(), "SERVER_ERROR");
    assert_eq!(internal.status_code(), 500);
  }
}
