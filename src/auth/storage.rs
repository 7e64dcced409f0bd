//! Token persistence: a cookie jar backed by a durable SQLite fallback.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

use super::TokenPair;

pub const ACCESS_TOKEN: &str = "accessToken";
pub const REFRESH_TOKEN: &str = "refreshToken";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  #[error("token database error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("cookie file error: {0}")]
  Io(#[from] std::io::Error),
  #[error("cookie file is not valid JSON: {0}")]
  Json(#[from] serde_json::Error),
  #[error("could not determine data directory")]
  NoDataDir,
  #[error("lock poisoned")]
  Poisoned,
}

/// Trait for named-token storage backends.
pub trait TokenStore: Send + Sync {
  /// Get a live value, `None` when missing or expired.
  fn get(&self, name: &str) -> Result<Option<String>, StorageError>;

  /// Store a value. Backends without expiry ignore `max_age`.
  fn set(&self, name: &str, value: &str, max_age: Duration) -> Result<(), StorageError>;

  /// Remove a value; removing a missing value is not an error.
  fn remove(&self, name: &str) -> Result<(), StorageError>;
}

fn data_dir() -> Result<PathBuf, StorageError> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or(StorageError::NoDataDir)?;

  Ok(data_dir.join("crmdash"))
}

// ============================================================================
// Cookie jar
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
  Lax,
  Strict,
  None,
}

/// A session cookie with the attributes the dashboard sets on its tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
  pub name: String,
  pub value: String,
  pub path: String,
  pub max_age_secs: u64,
  pub same_site: SameSite,
  pub expires_at: DateTime<Utc>,
}

impl Cookie {
  /// `Path=/`, `SameSite=Lax`, expiring `max_age` from now.
  pub fn new(name: &str, value: &str, max_age: Duration) -> Self {
    let expires_at = chrono::Duration::from_std(max_age)
      .ok()
      .and_then(|age| Utc::now().checked_add_signed(age))
      .unwrap_or(DateTime::<Utc>::MAX_UTC);

    Self {
      name: name.to_string(),
      value: value.to_string(),
      path: "/".to_string(),
      max_age_secs: max_age.as_secs(),
      same_site: SameSite::Lax,
      expires_at,
    }
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }
}

/// Cookie storage, optionally mirrored to a JSON file so sessions survive restarts.
pub struct CookieJar {
  cookies: Mutex<HashMap<String, Cookie>>,
  file: Option<PathBuf>,
}

impl CookieJar {
  pub fn in_memory() -> Self {
    Self {
      cookies: Mutex::new(HashMap::new()),
      file: None,
    }
  }

  /// Open the cookie jar at the default location.
  pub fn open() -> Result<Self, StorageError> {
    Self::open_at(&data_dir()?.join("cookies.json"))
  }

  /// Open (or start) a cookie jar persisted at `path`.
  pub fn open_at(path: &Path) -> Result<Self, StorageError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let cookies = if path.exists() {
      let contents = std::fs::read_to_string(path)?;
      let list: Vec<Cookie> = serde_json::from_str(&contents)?;
      list.into_iter().map(|c| (c.name.clone(), c)).collect()
    } else {
      HashMap::new()
    };

    Ok(Self {
      cookies: Mutex::new(cookies),
      file: Some(path.to_path_buf()),
    })
  }

  pub fn cookie(&self, name: &str) -> Result<Option<Cookie>, StorageError> {
    let cookies = self.cookies.lock().map_err(|_| StorageError::Poisoned)?;
    Ok(cookies.get(name).cloned())
  }

  fn persist(&self, cookies: &HashMap<String, Cookie>) -> Result<(), StorageError> {
    let Some(path) = &self.file else {
      return Ok(());
    };

    let mut list: Vec<&Cookie> = cookies.values().collect();
    list.sort_by(|a, b| a.name.cmp(&b.name));
    std::fs::write(path, serde_json::to_vec_pretty(&list)?)?;
    Ok(())
  }
}

impl TokenStore for CookieJar {
  fn get(&self, name: &str) -> Result<Option<String>, StorageError> {
    let mut cookies = self.cookies.lock().map_err(|_| StorageError::Poisoned)?;

    let expired = match cookies.get(name) {
      Some(cookie) if !cookie.is_expired(Utc::now()) => return Ok(Some(cookie.value.clone())),
      Some(_) => true,
      None => false,
    };

    if expired {
      cookies.remove(name);
      self.persist(&cookies)?;
    }
    Ok(None)
  }

  fn set(&self, name: &str, value: &str, max_age: Duration) -> Result<(), StorageError> {
    let mut cookies = self.cookies.lock().map_err(|_| StorageError::Poisoned)?;
    cookies.insert(name.to_string(), Cookie::new(name, value, max_age));
    self.persist(&cookies)
  }

  fn remove(&self, name: &str) -> Result<(), StorageError> {
    let mut cookies = self.cookies.lock().map_err(|_| StorageError::Poisoned)?;
    if cookies.remove(name).is_some() {
      self.persist(&cookies)?;
    }
    Ok(())
  }
}

// ============================================================================
// SQLite fallback
// ============================================================================

/// Schema for the durable token table.
const TOKEN_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS token_store (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Durable key/value token storage. Values never expire.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the token database at the default location.
  pub fn open() -> Result<Self, StorageError> {
    let dir = data_dir()?;
    std::fs::create_dir_all(&dir)?;
    Self::from_connection(Connection::open(dir.join("session.db"))?)
  }

  pub fn open_in_memory() -> Result<Self, StorageError> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self, StorageError> {
    conn.execute_batch(TOKEN_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }
}

impl TokenStore for SqliteStore {
  fn get(&self, name: &str) -> Result<Option<String>, StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
    let value = conn
      .query_row(
        "SELECT value FROM token_store WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set(&self, name: &str, value: &str, _max_age: Duration) -> Result<(), StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
    conn.execute(
      "INSERT OR REPLACE INTO token_store (name, value, updated_at)
       VALUES (?, ?, datetime('now'))",
      params![name, value],
    )?;
    Ok(())
  }

  fn remove(&self, name: &str) -> Result<(), StorageError> {
    let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
    conn.execute("DELETE FROM token_store WHERE name = ?", params![name])?;
    Ok(())
  }
}

// ============================================================================
// Combined persistence
// ============================================================================

/// Tokens as found in storage; either half may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StoredTokens {
  pub access: Option<String>,
  pub refresh: Option<String>,
}

/// Reads tokens from the cookie jar first and the durable store second;
/// writes and clears both.
pub struct PersistedTokens {
  cookies: Box<dyn TokenStore>,
  durable: Box<dyn TokenStore>,
  access_max_age: Duration,
  refresh_max_age: Duration,
}

impl PersistedTokens {
  pub fn new(cookies: impl TokenStore + 'static, durable: impl TokenStore + 'static) -> Self {
    Self {
      cookies: Box::new(cookies),
      durable: Box::new(durable),
      access_max_age: Duration::from_secs(24 * 60 * 60),
      refresh_max_age: Duration::from_secs(7 * 24 * 60 * 60),
    }
  }

  /// Cookie lifetimes for the access and refresh tokens.
  pub fn with_max_ages(mut self, access: Duration, refresh: Duration) -> Self {
    self.access_max_age = access;
    self.refresh_max_age = refresh;
    self
  }

  /// In-memory storage on both sides, for sessions that should not outlive the process.
  pub fn ephemeral() -> Self {
    Self::new(CookieJar::in_memory(), CookieJar::in_memory())
  }

  fn read(&self, name: &str) -> Result<Option<String>, StorageError> {
    match self.cookies.get(name) {
      Ok(Some(value)) => return Ok(Some(value)),
      Ok(None) => {}
      Err(e) => warn!(error = %e, name, "cookie read failed, using durable store"),
    }
    self.durable.get(name)
  }

  pub(crate) fn load(&self) -> Result<StoredTokens, StorageError> {
    Ok(StoredTokens {
      access: self.read(ACCESS_TOKEN)?,
      refresh: self.read(REFRESH_TOKEN)?,
    })
  }

  pub fn save(&self, pair: &TokenPair) -> Result<(), StorageError> {
    let writes = [
      self
        .cookies
        .set(ACCESS_TOKEN, &pair.access_token, self.access_max_age),
      self
        .cookies
        .set(REFRESH_TOKEN, &pair.refresh_token, self.refresh_max_age),
      self
        .durable
        .set(ACCESS_TOKEN, &pair.access_token, self.access_max_age),
      self
        .durable
        .set(REFRESH_TOKEN, &pair.refresh_token, self.refresh_max_age),
    ];
    writes.into_iter().collect()
  }

  pub fn clear(&self) -> Result<(), StorageError> {
    let removals = [
      self.cookies.remove(ACCESS_TOKEN),
      self.cookies.remove(REFRESH_TOKEN),
      self.durable.remove(ACCESS_TOKEN),
      self.durable.remove(REFRESH_TOKEN),
    ];
    removals.into_iter().collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pair(access: &str, refresh: &str) -> TokenPair {
    TokenPair {
      access_token: access.to_string(),
      refresh_token: refresh.to_string(),
    }
  }

  #[test]
  fn test_cookie_attributes() {
    let jar = CookieJar::in_memory();
    jar.set(ACCESS_TOKEN, "abc", Duration::from_secs(86400)).unwrap();

    let cookie = jar.cookie(ACCESS_TOKEN).unwrap().unwrap();
    assert_eq!(cookie.value, "abc");
    assert_eq!(cookie.path, "/");
    assert_eq!(cookie.max_age_secs, 86400);
    assert_eq!(cookie.same_site, SameSite::Lax);
    assert!(cookie.expires_at > Utc::now());
  }

  #[test]
  fn test_expired_cookie_reads_as_absent() {
    let jar = CookieJar::in_memory();
    jar.set(ACCESS_TOKEN, "abc", Duration::ZERO).unwrap();
    assert_eq!(jar.get(ACCESS_TOKEN).unwrap(), None);
    assert_eq!(jar.cookie(ACCESS_TOKEN).unwrap(), None);
  }

  #[test]
  fn test_cookie_jar_persists_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cookies.json");

    let jar = CookieJar::open_at(&path).unwrap();
    jar
      .set(REFRESH_TOKEN, "r1", Duration::from_secs(3600))
      .unwrap();
    drop(jar);

    let reopened = CookieJar::open_at(&path).unwrap();
    assert_eq!(reopened.get(REFRESH_TOKEN).unwrap(), Some("r1".to_string()));

    reopened.remove(REFRESH_TOKEN).unwrap();
    let reopened = CookieJar::open_at(&path).unwrap();
    assert_eq!(reopened.get(REFRESH_TOKEN).unwrap(), None);
  }

  #[test]
  fn test_sqlite_store_roundtrip() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert_eq!(store.get(ACCESS_TOKEN).unwrap(), None);

    store.set(ACCESS_TOKEN, "a1", Duration::ZERO).unwrap();
    store.set(ACCESS_TOKEN, "a2", Duration::ZERO).unwrap();
    assert_eq!(store.get(ACCESS_TOKEN).unwrap(), Some("a2".to_string()));

    store.remove(ACCESS_TOKEN).unwrap();
    store.remove(ACCESS_TOKEN).unwrap();
    assert_eq!(store.get(ACCESS_TOKEN).unwrap(), None);
  }

  #[test]
  fn test_persisted_prefers_cookie_then_durable() {
    let cookies = CookieJar::in_memory();
    let durable = SqliteStore::open_in_memory().unwrap();
    cookies
      .set(ACCESS_TOKEN, "from-cookie", Duration::from_secs(60))
      .unwrap();
    durable
      .set(ACCESS_TOKEN, "from-db", Duration::ZERO)
      .unwrap();
    durable
      .set(REFRESH_TOKEN, "refresh-db", Duration::ZERO)
      .unwrap();

    let tokens = PersistedTokens::new(cookies, durable).load().unwrap();
    assert_eq!(tokens.access.as_deref(), Some("from-cookie"));
    assert_eq!(tokens.refresh.as_deref(), Some("refresh-db"));
  }

  #[test]
  fn test_expired_access_cookie_falls_back_to_durable() {
    let persisted = PersistedTokens::new(
      CookieJar::in_memory(),
      SqliteStore::open_in_memory().unwrap(),
    )
    .with_max_ages(Duration::ZERO, Duration::from_secs(60));

    persisted.save(&pair("a1", "r1")).unwrap();
    let tokens = persisted.load().unwrap();
    assert_eq!(tokens.access.as_deref(), Some("a1"));
    assert_eq!(tokens.refresh.as_deref(), Some("r1"));
  }

  #[test]
  fn test_clear_removes_everywhere() {
    let persisted = PersistedTokens::new(
      CookieJar::in_memory(),
      SqliteStore::open_in_memory().unwrap(),
    );
    persisted.save(&pair("a1", "r1")).unwrap();
    persisted.clear().unwrap();
    assert_eq!(persisted.load().unwrap(), StoredTokens::default());
  }
}
