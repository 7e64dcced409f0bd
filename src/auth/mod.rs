//! Bearer credentials: the current token pair, its persistence, and refresh coordination.

mod coordinator;
mod storage;

pub use coordinator::{AuthSettings, CredentialCoordinator, RefreshError};
pub use storage::{
  Cookie, CookieJar, PersistedTokens, SameSite, SqliteStore, StorageError, TokenStore,
  ACCESS_TOKEN, REFRESH_TOKEN,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Access/refresh token pair as issued by the login and refresh endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
  pub access_token: String,
  pub refresh_token: String,
}

/// Where the user is sent once the session can no longer be recovered.
pub trait LoginBoundary: Send + Sync {
  /// Whether the user is already at the login boundary (no redirect needed)
  fn is_at_login(&self) -> bool;

  fn redirect_to_login(&self);
}

/// Login boundary for non-interactive use: reports the redirect in the log.
#[derive(Debug, Clone)]
pub struct LogRedirect {
  login_route: String,
  at_login: bool,
}

impl LogRedirect {
  pub fn new(login_route: impl Into<String>) -> Self {
    Self {
      login_route: login_route.into(),
      at_login: false,
    }
  }

  /// Mark the caller as already at the login boundary.
  pub fn at_login(mut self, at_login: bool) -> Self {
    self.at_login = at_login;
    self
  }
}

impl LoginBoundary for LogRedirect {
  fn is_at_login(&self) -> bool {
    self.at_login
  }

  fn redirect_to_login(&self) {
    warn!(route = %self.login_route, "session expired, sign in again");
  }
}
