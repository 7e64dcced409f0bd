//! API client composing the credential coordinator and the response cache.

use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::{
  CookieJar, CredentialCoordinator, LoginBoundary, PersistedTokens, RefreshError, SqliteStore,
  TokenPair,
};
use crate::cache::{CacheOptions, Params, ResponseCache};
use crate::config::Config;

use super::error::{error_message, ApiError};
use super::invalidation::InvalidationRules;
use super::outcome::{classify, Outcome};
use super::request::ApiRequest;
use super::resource::ResourceId;

/// Authorization-aware API client with transparent read caching.
///
/// Reads go through the response cache; writes bypass it and, on success,
/// invalidate every cached view of the resource they touched.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: String,
  credentials: CredentialCoordinator,
  cache: Arc<ResponseCache>,
  invalidation: InvalidationRules,
}

impl ApiClient {
  pub fn new(config: &Config, credentials: CredentialCoordinator) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(config.timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url: config.api.base_url.trim_end_matches('/').to_string(),
      credentials,
      cache: Arc::new(ResponseCache::new(config.cache_settings())),
      invalidation: InvalidationRules::new(config.cache.related.clone()),
    })
  }

  /// Create a client whose session is persisted in the default data directory.
  pub fn open(config: &Config, boundary: Arc<dyn LoginBoundary>) -> Result<Self> {
    let cookies = CookieJar::open().map_err(|e| eyre!("Failed to open cookie jar: {}", e))?;
    let durable =
      SqliteStore::open().map_err(|e| eyre!("Failed to open token database: {}", e))?;
    let (access_max_age, refresh_max_age) = config.token_max_ages();
    let storage =
      PersistedTokens::new(cookies, durable).with_max_ages(access_max_age, refresh_max_age);

    let credentials = CredentialCoordinator::new(storage, boundary, config.auth_settings());
    Self::new(config, credentials)
  }

  pub fn cache(&self) -> &ResponseCache {
    &self.cache
  }

  pub fn credentials(&self) -> &CredentialCoordinator {
    &self.credentials
  }

  fn url_for(&self, path: &str) -> Result<url::Url, ApiError> {
    Ok(url::Url::parse(&format!("{}{}", self.base_url, path))?)
  }

  // ==========================================================================
  // Dispatch
  // ==========================================================================

  /// Send a request through the authorization pipeline, without caching.
  ///
  /// Attaches the bearer token, replays once after a token refresh, and
  /// replays once without `populate` after a populate relation error.
  pub async fn dispatch(&self, request: ApiRequest) -> Result<Value, ApiError> {
    let method = request.method.clone();
    let path = request.path.clone();
    let result = self.dispatch_inner(request).await;

    match &result {
      Err(e) if e.is_canceled() => debug!(%method, %path, "request canceled"),
      Err(e) => warn!(%method, %path, error = %e, "request failed"),
      Ok(_) => {}
    }
    result
  }

  async fn dispatch_inner(&self, mut request: ApiRequest) -> Result<Value, ApiError> {
    loop {
      if request.is_canceled() {
        return Err(ApiError::Canceled);
      }
      let bearer = self.credentials.bearer_for(&request.path);
      let (status, body) = self.execute(&request, bearer.as_deref()).await?;

      match classify(&request, status, body, self.credentials.settings()) {
        Outcome::Success(data) => return Ok(data),
        Outcome::RecoverableAuthFailure => {
          request.retried_auth = true;
          let http = self.http.clone();
          let refresh_url = self.url_for(&self.credentials.settings().refresh_path);
          let recovery = self.credentials.recover(bearer.as_deref(), move |refresh_token| {
            refresh_tokens(http, refresh_url, refresh_token)
          });
          until_canceled(&request, recovery).await??;
          debug!(path = %request.path, "replaying after refresh");
        }
        Outcome::SchemaRetry => {
          request.retried_populate = true;
          request.strip_populate();
          debug!(path = %request.path, "retrying without populate");
        }
        Outcome::TerminalAuthFailure(e) | Outcome::Other(e) => return Err(e),
      }
    }
  }

  async fn execute(
    &self,
    request: &ApiRequest,
    bearer: Option<&str>,
  ) -> Result<(StatusCode, Value), ApiError> {
    let mut builder = self
      .http
      .request(request.method.clone(), self.url_for(&request.path)?)
      .query(&request.query_pairs());
    if let Some(token) = bearer {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let send = async move {
      let response = builder.send().await.map_err(ApiError::from_transport)?;
      let status = response.status();
      let bytes = response.bytes().await.map_err(ApiError::from_transport)?;
      Ok::<_, ApiError>((status, parse_body(&bytes)))
    };

    until_canceled(request, send).await?
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// Cached GET of `request.path` with `request.query` as the cache parameters.
  pub async fn fetch(&self, request: ApiRequest, options: CacheOptions) -> Result<Value, ApiError> {
    let path = request.path.clone();
    let params = request.query.clone();
    self
      .cache
      .cached_request(&path, params.as_ref(), options, || self.dispatch(request))
      .await
  }

  pub async fn get<T: DeserializeOwned>(&self, path: &str, params: Option<Params>) -> Result<T, ApiError> {
    self.get_with(path, params, CacheOptions::default()).await
  }

  pub async fn get_with<T: DeserializeOwned>(
    &self,
    path: &str,
    params: Option<Params>,
    options: CacheOptions,
  ) -> Result<T, ApiError> {
    let mut request = ApiRequest::get(path);
    request.query = params;
    let data = self.fetch(request, options).await?;
    Ok(serde_json::from_value(data)?)
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  /// Send a write and invalidate the cached views it affects once it succeeds.
  pub async fn mutate(&self, request: ApiRequest) -> Result<Value, ApiError> {
    let path = request.path.clone();
    let data = self.dispatch(request).await?;

    for prefix in self.invalidation.prefixes_for(&path) {
      self.cache.invalidate_pattern(&prefix);
    }
    Ok(data)
  }

  /// Route a request: GETs through the cache, writes through [`Self::mutate`].
  ///
  /// Any other method is dispatched as is and leaves the cache untouched.
  pub async fn send(&self, request: ApiRequest) -> Result<Value, ApiError> {
    if request.is_mutation() {
      self.mutate(request).await
    } else if request.method == Method::GET {
      self.fetch(request, CacheOptions::default()).await
    } else {
      self.dispatch(request).await
    }
  }

  pub async fn post(&self, path: &str, body: Value) -> Result<Value, ApiError> {
    self.mutate(ApiRequest::post(path, body)).await
  }

  pub async fn put(&self, path: &str, body: Value) -> Result<Value, ApiError> {
    self.mutate(ApiRequest::put(path, body)).await
  }

  pub async fn patch(&self, path: &str, body: Value) -> Result<Value, ApiError> {
    self.mutate(ApiRequest::patch(path, body)).await
  }

  pub async fn delete(&self, path: &str) -> Result<Value, ApiError> {
    self.mutate(ApiRequest::delete(path)).await
  }

  /// Create a draft (POST to the collection) or update a persisted resource (PUT).
  pub async fn save(&self, collection: &str, id: &ResourceId, body: Value) -> Result<Value, ApiError> {
    debug!(collection, %id, draft = id.is_draft(), "saving resource");
    match id.item_path(collection) {
      Some(path) => self.put(&path, body).await,
      None => self.post(collection, body).await,
    }
  }

  // ==========================================================================
  // Session
  // ==========================================================================

  /// Exchange credentials for a token pair and start a session.
  pub async fn login(&self, email: &str, password: &str) -> Result<(), ApiError> {
    let request = ApiRequest::post(
      self.credentials.settings().login_path.clone(),
      json!({ "email": email, "password": password }),
    );
    let data = self.dispatch(request).await?;
    let pair: TokenPair = serde_json::from_value(data)?;

    self.cache.clear();
    self.credentials.set_tokens(pair);
    Ok(())
  }

  pub fn logout(&self) {
    self.credentials.clear_tokens();
    self.cache.clear();
  }
}

/// Await `fut` unless the request's cancellation token fires first.
async fn until_canceled<T>(request: &ApiRequest, fut: impl Future<Output = T>) -> Result<T, ApiError> {
  match &request.cancel {
    Some(token) => tokio::select! {
      biased;
      _ = token.cancelled() => Err(ApiError::Canceled),
      out = fut => Ok(out),
    },
    None => Ok(fut.await),
  }
}

fn parse_body(bytes: &[u8]) -> Value {
  if bytes.is_empty() {
    return Value::Null;
  }
  serde_json::from_slice(bytes)
    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Call the refresh endpoint. Sent without a bearer token.
async fn refresh_tokens(
  http: reqwest::Client,
  url: Result<url::Url, ApiError>,
  refresh_token: String,
) -> Result<TokenPair, RefreshError> {
  let url = url.map_err(|e| RefreshError::Transport(e.to_string()))?;
  let transport = |e: reqwest::Error| RefreshError::Transport(e.to_string());

  let response = http
    .post(url)
    .json(&json!({ "refreshToken": refresh_token }))
    .send()
    .await
    .map_err(transport)?;
  let status = response.status();
  let bytes = response.bytes().await.map_err(transport)?;
  let body = parse_body(&bytes);

  if !status.is_success() {
    return Err(RefreshError::Rejected {
      status: status.as_u16(),
      message: error_message(&body, status),
    });
  }

  serde_json::from_value(body)
    .map_err(|e| RefreshError::Transport(format!("invalid refresh response: {}", e)))
}
