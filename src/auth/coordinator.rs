//! Single-flight refresh of bearer credentials.
//!
//! The coordinator owns the current token pair. When a request fails with a
//! recoverable authentication error, [`CredentialCoordinator::recover`] either
//! starts a refresh or attaches to the one already in flight. Every caller that
//! arrives while a refresh is running awaits the same shared future, so a burst
//! of expired requests produces exactly one call to the refresh endpoint.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info, warn};

use super::storage::{PersistedTokens, StoredTokens};
use super::{LoginBoundary, TokenPair};

/// Why a refresh could not produce a new token pair.
///
/// Cloned to every request that waited on the failed refresh.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
  #[error("no refresh token available")]
  MissingRefreshToken,
  #[error("refresh rejected with status {status}: {message}")]
  Rejected { status: u16, message: String },
  #[error("refresh request failed: {0}")]
  Transport(String),
}

/// Endpoint and error-code settings for the authentication flow.
#[derive(Debug, Clone)]
pub struct AuthSettings {
  pub refresh_path: String,
  pub login_path: String,
  /// Paths sent without a bearer token
  pub public_paths: Vec<String>,
  /// 401 error codes that trigger a refresh; any other 401 is surfaced as-is
  pub recoverable_codes: Vec<String>,
}

impl Default for AuthSettings {
  fn default() -> Self {
    Self {
      refresh_path: "/auth/refresh".to_string(),
      login_path: "/auth/login".to_string(),
      public_paths: vec!["/auth/login".to_string(), "/auth/register".to_string()],
      recoverable_codes: vec![
        "TOKEN_EXPIRED".to_string(),
        "INVALID_TOKEN".to_string(),
        "AUTHENTICATION_FAILED".to_string(),
      ],
    }
  }
}

impl AuthSettings {
  pub fn is_public(&self, path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path);
    self.public_paths.iter().any(|p| p == path)
  }

  pub fn is_recoverable(&self, code: Option<&str>) -> bool {
    code.is_some_and(|code| self.recoverable_codes.iter().any(|c| c == code))
  }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<String, RefreshError>>>;

enum RefreshState {
  Idle,
  Refreshing(RefreshFuture),
}

struct Inner {
  tokens: RwLock<StoredTokens>,
  storage: PersistedTokens,
  state: Mutex<RefreshState>,
  boundary: Arc<dyn LoginBoundary>,
  settings: AuthSettings,
}

/// Owner of the current token pair and the refresh state machine.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct CredentialCoordinator {
  inner: Arc<Inner>,
}

impl CredentialCoordinator {
  /// Create a coordinator, rehydrating tokens from `storage`.
  pub fn new(
    storage: PersistedTokens,
    boundary: Arc<dyn LoginBoundary>,
    settings: AuthSettings,
  ) -> Self {
    let tokens = storage.load().unwrap_or_else(|e| {
      warn!(error = %e, "could not load stored tokens, starting signed out");
      StoredTokens::default()
    });

    Self {
      inner: Arc::new(Inner {
        tokens: RwLock::new(tokens),
        storage,
        state: Mutex::new(RefreshState::Idle),
        boundary,
        settings,
      }),
    }
  }

  pub fn settings(&self) -> &AuthSettings {
    &self.inner.settings
  }

  pub fn access_token(&self) -> Option<String> {
    self.inner.read_tokens().access.clone()
  }

  pub fn has_session(&self) -> bool {
    let tokens = self.inner.read_tokens();
    tokens.access.is_some() || tokens.refresh.is_some()
  }

  /// Bearer token to attach to a request for `path`, if any.
  pub fn bearer_for(&self, path: &str) -> Option<String> {
    if self.inner.settings.is_public(path) {
      return None;
    }
    self.access_token()
  }

  /// Whether a refresh is currently in flight.
  pub fn is_refreshing(&self) -> bool {
    matches!(*self.inner.lock_state(), RefreshState::Refreshing(_))
  }

  /// Seed the session after a successful login.
  pub fn set_tokens(&self, pair: TokenPair) {
    self.inner.store(pair);
    info!("session started");
  }

  /// Drop the session, in memory and in storage.
  pub fn clear_tokens(&self) {
    self.inner.clear();
    info!("session cleared");
  }

  /// Obtain a usable access token after a request sent with `sent_with` was rejected.
  ///
  /// - If the token has already been replaced since the request was sent, the
  ///   current one is returned without refreshing.
  /// - If a refresh is in flight, waits for it.
  /// - Otherwise starts a refresh with `refresh`, which receives the current
  ///   refresh token and performs the network call.
  ///
  /// On failure the session is cleared and the login boundary is notified once,
  /// by whichever refresh failed; waiters receive the same error.
  pub async fn recover<F, Fut>(
    &self,
    sent_with: Option<&str>,
    refresh: F,
  ) -> Result<String, RefreshError>
  where
    F: FnOnce(String) -> Fut + Send + 'static,
    Fut: Future<Output = Result<TokenPair, RefreshError>> + Send + 'static,
  {
    let in_flight = {
      let mut state = self.inner.lock_state();
      let running = match &*state {
        RefreshState::Refreshing(shared) => Some(shared.clone()),
        RefreshState::Idle => None,
      };

      match running {
        Some(shared) => {
          debug!("refresh in flight, waiting");
          shared
        }
        None => {
          let tokens = self.inner.read_tokens().clone();
          if let Some(current) = tokens.access {
            if sent_with != Some(current.as_str()) {
              debug!("token already replaced, replaying with current token");
              return Ok(current);
            }
          }

          let shared = self.inner.clone().start_refresh(tokens.refresh, refresh);
          *state = RefreshState::Refreshing(shared.clone());
          shared
        }
      }
    };

    in_flight.await
  }
}

impl Inner {
  fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn read_tokens(&self) -> std::sync::RwLockReadGuard<'_, StoredTokens> {
    self.tokens.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn store(&self, pair: TokenPair) {
    if let Err(e) = self.storage.save(&pair) {
      warn!(error = %e, "failed to persist tokens");
    }

    let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
    *tokens = StoredTokens {
      access: Some(pair.access_token),
      refresh: Some(pair.refresh_token),
    };
  }

  fn clear(&self) {
    if let Err(e) = self.storage.clear() {
      warn!(error = %e, "failed to clear stored tokens");
    }
    *self.tokens.write().unwrap_or_else(PoisonError::into_inner) = StoredTokens::default();
  }

  fn expire_session(&self) {
    self.clear();
    if !self.boundary.is_at_login() {
      self.boundary.redirect_to_login();
    }
  }

  /// Spawn the refresh so it settles even if every waiting request is dropped.
  ///
  /// The state returns to `Idle` inside the task, before any waiter observes the result.
  fn start_refresh<F, Fut>(
    self: Arc<Self>,
    refresh_token: Option<String>,
    refresh: F,
  ) -> RefreshFuture
  where
    F: FnOnce(String) -> Fut + Send + 'static,
    Fut: Future<Output = Result<TokenPair, RefreshError>> + Send + 'static,
  {
    let inner = Arc::clone(&self);
    let task = tokio::spawn(async move {
      let result = inner.run_refresh(refresh_token, refresh).await;
      *inner.lock_state() = RefreshState::Idle;
      result
    });

    async move {
      match task.await {
        Ok(result) => result,
        Err(e) => {
          *self.lock_state() = RefreshState::Idle;
          Err(RefreshError::Transport(format!("refresh task failed: {}", e)))
        }
      }
    }
    .boxed()
    .shared()
  }

  async fn run_refresh<F, Fut>(
    &self,
    refresh_token: Option<String>,
    refresh: F,
  ) -> Result<String, RefreshError>
  where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<TokenPair, RefreshError>>,
  {
    let Some(refresh_token) = refresh_token else {
      warn!("no refresh token, session expired");
      self.expire_session();
      return Err(RefreshError::MissingRefreshToken);
    };

    debug!("refreshing access token");
    match refresh(refresh_token).await {
      Ok(pair) => {
        let access = pair.access_token.clone();
        self.store(pair);
        info!("access token refreshed");
        Ok(access)
      }
      Err(e) => {
        warn!(error = %e, "token refresh failed, session expired");
        self.expire_session();
        Err(e)
      }
    }
  }
}
