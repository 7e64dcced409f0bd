//! Bounded TTL store backing the response cache.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::key::{cache_key, Params};

/// Size and TTL limits for a [`ResponseCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
  /// Maximum number of entries kept before the oldest are evicted
  pub max_entries: usize,
  /// TTL applied when `set` is not given an override
  pub default_ttl: Duration,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      max_entries: 100,
      default_ttl: Duration::from_secs(5 * 60),
    }
  }
}

/// A single cached value.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
  data: V,
  created_at: Instant,
  expires_at: Instant,
  /// Insertion sequence, breaks `created_at` ties so eviction stays oldest-first
  seq: u64,
}

impl<V> CacheEntry<V> {
  fn is_expired(&self, now: Instant) -> bool {
    now > self.expires_at
  }
}

#[derive(Debug)]
struct Entries<V> {
  map: HashMap<String, CacheEntry<V>>,
  next_seq: u64,
}

/// Point-in-time view of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStats {
  pub key: String,
  pub age: Duration,
  /// Zero once the entry has expired but has not been read yet
  pub ttl_remaining: Duration,
}

/// Point-in-time view of the whole cache, entries ordered oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
  pub size: usize,
  pub max_size: usize,
  pub entries: Vec<EntryStats>,
}

impl CacheStats {
  pub fn contains(&self, key: &str) -> bool {
    self.entries.iter().any(|e| e.key == key)
  }
}

/// In-memory response cache keyed by endpoint and normalized parameters.
///
/// Expiration is lazy: an expired entry is only removed when it is read,
/// pruned explicitly, invalidated, or evicted. Eviction is by creation time,
/// not by access, so reading an entry never extends its life.
#[derive(Debug)]
pub struct ResponseCache<V = serde_json::Value> {
  entries: Mutex<Entries<V>>,
  settings: CacheSettings,
}

impl<V: Clone> ResponseCache<V> {
  /// Create an empty cache with the given limits.
  pub fn new(settings: CacheSettings) -> Self {
    Self {
      entries: Mutex::new(Entries {
        map: HashMap::new(),
        next_seq: 0,
      }),
      settings,
    }
  }

  pub fn settings(&self) -> CacheSettings {
    self.settings
  }

  // Mutations never leave the map half-updated, so a poisoned lock is still usable.
  fn lock(&self) -> MutexGuard<'_, Entries<V>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Look up a cached value. Expired entries are removed and reported as absent.
  pub fn get(&self, endpoint: &str, params: Option<&Params>) -> Option<V> {
    self.get_by_key(&cache_key(endpoint, params))
  }

  pub(crate) fn get_by_key(&self, key: &str) -> Option<V> {
    let mut entries = self.lock();
    let now = Instant::now();

    let expired = match entries.map.get(key) {
      Some(entry) if !entry.is_expired(now) => return Some(entry.data.clone()),
      Some(_) => true,
      None => false,
    };

    if expired {
      entries.map.remove(key);
      debug!(key, "cache entry expired");
    }
    None
  }

  /// Store a value, replacing any previous entry for the same key.
  ///
  /// `ttl` overrides the default TTL for this entry only.
  pub fn set(&self, endpoint: &str, data: V, params: Option<&Params>, ttl: Option<Duration>) {
    self.set_by_key(cache_key(endpoint, params), data, ttl);
  }

  pub(crate) fn set_by_key(&self, key: String, data: V, ttl: Option<Duration>) {
    let mut entries = self.lock();
    let now = Instant::now();
    let ttl = ttl.unwrap_or(self.settings.default_ttl);
    let seq = entries.next_seq;
    entries.next_seq += 1;

    entries.map.insert(
      key,
      CacheEntry {
        data,
        created_at: now,
        expires_at: expiry(now, ttl),
        seq,
      },
    );

    while entries.map.len() > self.settings.max_entries {
      let oldest = entries
        .map
        .iter()
        .min_by_key(|(_, e)| (e.created_at, e.seq))
        .map(|(k, _)| k.clone());

      match oldest {
        Some(k) => {
          entries.map.remove(&k);
          debug!(key = %k, "cache entry evicted");
        }
        None => break,
      }
    }
  }

  /// Remove the entry for exactly this endpoint and parameter set.
  pub fn invalidate(&self, endpoint: &str, params: Option<&Params>) {
    let key = cache_key(endpoint, params);
    if self.lock().map.remove(&key).is_some() {
      debug!(%key, "cache entry invalidated");
    }
  }

  /// Remove every entry whose key contains `pattern`. Returns how many were removed.
  pub fn invalidate_pattern(&self, pattern: &str) -> usize {
    let mut entries = self.lock();
    let before = entries.map.len();
    entries.map.retain(|key, _| !key.contains(pattern));
    let removed = before - entries.map.len();

    if removed > 0 {
      debug!(pattern, removed, "cache entries invalidated by pattern");
    }
    removed
  }

  /// Drop expired entries now instead of waiting for them to be read.
  pub fn prune_expired(&self) -> usize {
    let mut entries = self.lock();
    let now = Instant::now();
    let before = entries.map.len();
    entries.map.retain(|_, e| !e.is_expired(now));
    before - entries.map.len()
  }

  pub fn clear(&self) {
    self.lock().map.clear();
  }

  pub fn len(&self) -> usize {
    self.lock().map.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn stats(&self) -> CacheStats {
    let entries = self.lock();
    let now = Instant::now();

    let mut ordered: Vec<(&String, &CacheEntry<V>)> = entries.map.iter().collect();
    ordered.sort_by_key(|(_, e)| (e.created_at, e.seq));

    CacheStats {
      size: entries.map.len(),
      max_size: self.settings.max_entries,
      entries: ordered
        .into_iter()
        .map(|(key, e)| EntryStats {
          key: key.clone(),
          age: now.saturating_duration_since(e.created_at),
          ttl_remaining: e.expires_at.saturating_duration_since(now),
        })
        .collect(),
    }
  }
}

/// Entries whose TTL would overflow the clock never expire in practice.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn expiry(now: Instant, ttl: Duration) -> Instant {
  now
    .checked_add(ttl)
    .unwrap_or_else(|| now + FAR_FUTURE)
}

impl<V: Clone> Default for ResponseCache<V> {
  fn default() -> Self {
    Self::new(CacheSettings::default())
  }
}
