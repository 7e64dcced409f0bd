use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::AuthSettings;
use crate::cache::CacheSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub auth: AuthConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL every request path is appended to (e.g. "https://api.example.com/api")
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
  pub refresh_path: String,
  pub login_path: String,
  /// UI route of the login page; no redirect is issued while already there
  pub login_route: String,
  pub public_paths: Vec<String>,
  pub recoverable_codes: Vec<String>,
  pub access_token_max_age_secs: u64,
  pub refresh_token_max_age_secs: u64,
}

impl Default for AuthConfig {
  fn default() -> Self {
    let settings = AuthSettings::default();
    Self {
      refresh_path: settings.refresh_path,
      login_path: settings.login_path,
      login_route: "/login".to_string(),
      public_paths: settings.public_paths,
      recoverable_codes: settings.recoverable_codes,
      access_token_max_age_secs: 24 * 60 * 60,
      refresh_token_max_age_secs: 7 * 24 * 60 * 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub max_entries: usize,
  pub default_ttl_secs: u64,
  /// Extra prefixes to invalidate when a path under the key is written
  pub related: BTreeMap<String, Vec<String>>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let settings = CacheSettings::default();
    Self {
      max_entries: settings.max_entries,
      default_ttl_secs: settings.default_ttl.as_secs(),
      related: BTreeMap::new(),
    }
  }
}

impl Config {
  /// Load configuration from `explicit_path`, or the first file found in
  /// `./crmdash.yaml` then `$XDG_CONFIG_HOME/crmdash/config.yaml`.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = match explicit_path {
      Some(p) if !p.exists() => return Err(eyre!("Config file not found: {}", p.display())),
      Some(p) => p.to_path_buf(),
      None => Self::search_paths()
        .into_iter()
        .find(|p| p.exists())
        .ok_or_else(|| {
          eyre!("No configuration file found. Create one at ~/.config/crmdash/config.yaml")
        })?,
    };

    std::fs::read_to_string(&path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))
      .and_then(|contents| {
        Self::from_yaml(&contents)
          .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
      })
  }

  fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("crmdash.yaml")];
    paths.extend(dirs::config_dir().map(|dir| dir.join("crmdash").join("config.yaml")));
    paths
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    url::Url::parse(&config.api.base_url)
      .map_err(|e| eyre!("Invalid api.base_url '{}': {}", config.api.base_url, e))?;
    Ok(config)
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.api.timeout_secs)
  }

  pub fn auth_settings(&self) -> AuthSettings {
    AuthSettings {
      refresh_path: self.auth.refresh_path.clone(),
      login_path: self.auth.login_path.clone(),
      public_paths: self.auth.public_paths.clone(),
      recoverable_codes: self.auth.recoverable_codes.clone(),
    }
  }

  pub fn cache_settings(&self) -> CacheSettings {
    CacheSettings {
      max_entries: self.cache.max_entries,
      default_ttl: Duration::from_secs(self.cache.default_ttl_secs),
    }
  }

  pub fn token_max_ages(&self) -> (Duration, Duration) {
    (
      Duration::from_secs(self.auth.access_token_max_age_secs),
      Duration::from_secs(self.auth.refresh_token_max_age_secs),
    )
  }

  /// Get the account password from the environment.
  ///
  /// Checks CRMDASH_PASSWORD.
  pub fn get_password() -> Result<String> {
    std::env::var("CRMDASH_PASSWORD")
      .map_err(|_| eyre!("Password not found. Set CRMDASH_PASSWORD environment variable."))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ResponseCache;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("api:\n  base_url: https://api.example.com/api\n").unwrap();

    assert_eq!(config.timeout(), Duration::from_secs(10));
    assert_eq!(config.auth.refresh_path, "/auth/refresh");
    assert_eq!(config.auth.login_route, "/login");
    assert_eq!(config.cache_settings(), CacheSettings::default());
    assert_eq!(
      config.token_max_ages(),
      (Duration::from_secs(86400), Duration::from_secs(604800))
    );
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
api:
  base_url: http://localhost:1337/api
  timeout_secs: 3
auth:
  refresh_path: /token/refresh
  public_paths: [/token/login]
  recoverable_codes: [EXPIRED]
cache:
  max_entries: 10
  default_ttl_secs: 30
  related:
    /branches: [/clients]
"#;
    let config = Config::from_yaml(yaml).unwrap();
    let auth = config.auth_settings();

    assert_eq!(config.timeout(), Duration::from_secs(3));
    assert_eq!(auth.refresh_path, "/token/refresh");
    assert!(auth.is_public("/token/login"));
    assert!(!auth.is_public("/auth/login"));
    assert!(auth.is_recoverable(Some("EXPIRED")));
    assert_eq!(config.cache_settings().max_entries, 10);
    assert_eq!(config.cache.related["/branches"], vec!["/clients".to_string()]);
  }

  #[test]
  fn test_invalid_base_url() {
    assert!(Config::from_yaml("api:\n  base_url: not a url\n").is_err());
  }

  #[test]
  fn test_huge_default_ttl_is_usable() {
    let config = Config::from_yaml(
      "api:\n  base_url: http://localhost\ncache:\n  default_ttl_secs: 18446744073709551615\n",
    )
    .unwrap();

    let cache: ResponseCache<i32> = ResponseCache::new(config.cache_settings());
    cache.set("/clients", 1, None, None);
    assert_eq!(cache.get("/clients", None), Some(1));
  }

  #[test]
  fn test_load_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crmdash.yaml");
    std::fs::write(&path, "api:\n  base_url: http://localhost:1337/api\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.api.base_url, "http://localhost:1337/api");
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/nonexistent/crmdash.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
