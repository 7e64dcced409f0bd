use reqwest::Method;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::cache::Params;

/// An outgoing API call.
///
/// Retry markers are owned by the dispatcher: each recovery path may replay a
/// request at most once.
#[derive(Debug, Clone)]
pub struct ApiRequest {
  pub method: Method,
  pub path: String,
  pub query: Option<Params>,
  pub body: Option<Value>,
  pub cancel: Option<CancellationToken>,
  pub(crate) retried_auth: bool,
  pub(crate) retried_populate: bool,
}

impl ApiRequest {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: None,
      body: None,
      cancel: None,
      retried_auth: false,
      retried_populate: false,
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::GET, path)
  }

  pub fn post(path: impl Into<String>, body: Value) -> Self {
    Self::new(Method::POST, path).json(body)
  }

  pub fn put(path: impl Into<String>, body: Value) -> Self {
    Self::new(Method::PUT, path).json(body)
  }

  pub fn patch(path: impl Into<String>, body: Value) -> Self {
    Self::new(Method::PATCH, path).json(body)
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self::new(Method::DELETE, path)
  }

  pub fn query(mut self, params: Params) -> Self {
    self.query = Some(params);
    self
  }

  pub fn json(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  /// Abort the request (and any wait for a token refresh) when `token` is canceled.
  pub fn cancel_with(mut self, token: CancellationToken) -> Self {
    self.cancel = Some(token);
    self
  }

  pub fn is_mutation(&self) -> bool {
    matches!(
      self.method,
      Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
  }

  pub fn is_canceled(&self) -> bool {
    self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
  }

  pub(crate) fn has_populate(&self) -> bool {
    self
      .query
      .as_ref()
      .is_some_and(|q| q.keys().any(|k| is_populate_key(k)))
  }

  /// Drop every `populate` / `populate[...]` parameter. Returns whether any were removed.
  pub(crate) fn strip_populate(&mut self) -> bool {
    let Some(query) = self.query.as_mut() else {
      return false;
    };
    let before = query.len();
    query.retain(|k, _| !is_populate_key(k));
    query.len() != before
  }

  /// Flatten the query parameters into `key=value` pairs.
  ///
  /// Nested objects and arrays use bracket notation: `filters[city]=Lyon`, `sort[0]=name`.
  pub(crate) fn query_pairs(&self) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if let Some(query) = &self.query {
      for (key, value) in query {
        flatten(key.clone(), value, &mut pairs);
      }
    }
    pairs
  }
}

fn is_populate_key(key: &str) -> bool {
  key == "populate" || key.starts_with("populate[")
}

fn flatten(prefix: String, value: &Value, out: &mut Vec<(String, String)>) {
  match value {
    Value::Null => {}
    Value::String(s) => out.push((prefix, s.clone())),
    Value::Bool(_) | Value::Number(_) => out.push((prefix, value.to_string())),
    Value::Array(items) => {
      for (i, item) in items.iter().enumerate() {
        flatten(format!("{}[{}]", prefix, i), item, out);
      }
    }
    Value::Object(map) => {
      for (key, item) in map {
        flatten(format!("{}[{}]", prefix, key), item, out);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn params(value: Value) -> Params {
    match value {
      Value::Object(map) => map,
      _ => panic!("expected object"),
    }
  }

  #[test]
  fn test_mutation_methods() {
    assert!(!ApiRequest::get("/clients").is_mutation());
    assert!(ApiRequest::post("/clients", json!({})).is_mutation());
    assert!(ApiRequest::put("/clients/1", json!({})).is_mutation());
    assert!(ApiRequest::patch("/clients/1", json!({})).is_mutation());
    assert!(ApiRequest::delete("/clients/1").is_mutation());
  }

  #[test]
  fn test_query_pairs_flatten() {
    let request = ApiRequest::get("/clients").query(params(json!({
      "page": 2,
      "search": "acme",
      "filters": {"city": "Lyon"},
      "sort": ["name", "createdAt"],
      "skip": null,
    })));

    let mut pairs = request.query_pairs();
    pairs.sort();
    assert_eq!(
      pairs,
      vec![
        ("filters[city]".to_string(), "Lyon".to_string()),
        ("page".to_string(), "2".to_string()),
        ("search".to_string(), "acme".to_string()),
        ("sort[0]".to_string(), "name".to_string()),
        ("sort[1]".to_string(), "createdAt".to_string()),
      ]
    );
  }

  #[test]
  fn test_strip_populate() {
    let mut request = ApiRequest::get("/contracts").query(params(json!({
      "populate": "*",
      "populate[client]": true,
      "page": 1,
    })));

    assert!(request.has_populate());
    assert!(request.strip_populate());
    assert!(!request.has_populate());
    assert_eq!(request.query_pairs(), vec![("page".to_string(), "1".to_string())]);
    assert!(!request.strip_populate());
  }

  #[test]
  fn test_cancel_token() {
    let token = CancellationToken::new();
    let request = ApiRequest::get("/clients").cancel_with(token.clone());
    assert!(!request.is_canceled());
    token.cancel();
    assert!(request.is_canceled());
  }
}
