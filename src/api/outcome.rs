use reqwest::StatusCode;
use serde_json::Value;

use super::error::{error_code, ApiError};
use super::request::ApiRequest;
use crate::auth::AuthSettings;

/// What the dispatcher should do with a response.
#[derive(Debug)]
pub enum Outcome {
  Success(Value),
  /// 401 with an expired/invalid-token code on a request not yet replayed
  RecoverableAuthFailure,
  /// 401 that must be surfaced: already replayed, public/refresh endpoint, or another cause
  TerminalAuthFailure(ApiError),
  /// 500 caused by an invalid `populate` relation; retry once without it
  SchemaRetry,
  Other(ApiError),
}

/// Classify a response for `request`.
pub fn classify(
  request: &ApiRequest,
  status: StatusCode,
  body: Value,
  settings: &AuthSettings,
) -> Outcome {
  if status.is_success() {
    return Outcome::Success(body);
  }

  if status == StatusCode::UNAUTHORIZED {
    let path = request.path.as_str();
    let recoverable = !request.retried_auth
      && path != settings.refresh_path
      && !settings.is_public(path)
      && settings.is_recoverable(error_code(&body).as_deref());

    return if recoverable {
      Outcome::RecoverableAuthFailure
    } else {
      Outcome::TerminalAuthFailure(ApiError::from_response(status, body))
    };
  }

  if status == StatusCode::INTERNAL_SERVER_ERROR
    && !request.retried_populate
    && request.has_populate()
    && mentions_populate(&body)
  {
    return Outcome::SchemaRetry;
  }

  Outcome::Other(ApiError::from_response(status, body))
}

fn mentions_populate(body: &Value) -> bool {
  let message = body
    .pointer("/error/message")
    .or_else(|| body.get("message"))
    .and_then(Value::as_str)
    .or_else(|| body.as_str());

  message.is_some_and(|m| m.to_lowercase().contains("populate"))
}
