use reqwest::StatusCode;
use serde_json::Value;

use crate::auth::RefreshError;

/// Errors returned by the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
  /// The caller canceled the request. Not logged as a failure and never retried.
  #[error("request canceled")]
  Canceled,
  #[error("request timed out")]
  Timeout,
  #[error("network error: {0}")]
  Network(#[source] reqwest::Error),
  #[error("server responded {status}: {message}")]
  Status {
    status: StatusCode,
    code: Option<String>,
    message: String,
    body: Value,
  },
  /// The session could not be refreshed; credentials were cleared.
  #[error("session expired: {0}")]
  SessionExpired(#[from] RefreshError),
  #[error("unexpected response body: {0}")]
  Decode(#[from] serde_json::Error),
  #[error("invalid request url: {0}")]
  Url(#[from] url::ParseError),
}

impl ApiError {
  pub(crate) fn from_transport(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      Self::Timeout
    } else {
      Self::Network(e)
    }
  }

  /// Build a status error from a non-success response body.
  pub(crate) fn from_response(status: StatusCode, body: Value) -> Self {
    Self::Status {
      status,
      code: error_code(&body),
      message: error_message(&body, status),
      body,
    }
  }

  pub fn is_canceled(&self) -> bool {
    matches!(self, Self::Canceled)
  }

  pub fn status(&self) -> Option<StatusCode> {
    match self {
      Self::Status { status, .. } => Some(*status),
      _ => None,
    }
  }

  pub fn code(&self) -> Option<&str> {
    match self {
      Self::Status { code, .. } => code.as_deref(),
      _ => None,
    }
  }
}

/// Error code from either `{"error": {"code": ..}}` or `{"code": ..}`.
pub(crate) fn error_code(body: &Value) -> Option<String> {
  body
    .pointer("/error/code")
    .or_else(|| body.get("code"))
    .and_then(Value::as_str)
    .map(String::from)
}

pub(crate) fn error_message(body: &Value, status: StatusCode) -> String {
  body
    .pointer("/error/message")
    .or_else(|| body.get("message"))
    .and_then(Value::as_str)
    .map(String::from)
    .or_else(|| body.as_str().filter(|s| !s.is_empty()).map(String::from))
    .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_nested_error_shape() {
    let err = ApiError::from_response(
      StatusCode::UNAUTHORIZED,
      json!({"error": {"code": "TOKEN_EXPIRED", "message": "jwt expired"}}),
    );
    assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
    assert_eq!(err.code(), Some("TOKEN_EXPIRED"));
    assert_eq!(err.to_string(), "server responded 401 Unauthorized: jwt expired");
  }

  #[test]
  fn test_flat_error_shape() {
    let body = json!({"code": "AUTHENTICATION_FAILED", "message": "bad token"});
    assert_eq!(error_code(&body).as_deref(), Some("AUTHENTICATION_FAILED"));
    assert_eq!(error_message(&body, StatusCode::UNAUTHORIZED), "bad token");
  }

  #[test]
  fn test_message_falls_back_to_reason() {
    assert_eq!(
      error_message(&Value::Null, StatusCode::BAD_GATEWAY),
      "Bad Gateway"
    );
    assert_eq!(
      error_message(&json!("upstream down"), StatusCode::BAD_GATEWAY),
      "upstream down"
    );
  }

  #[test]
  fn test_canceled_is_distinguishable() {
    assert!(ApiError::Canceled.is_canceled());
    assert!(!ApiError::Timeout.is_canceled());
  }
}
