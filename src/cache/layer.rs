//! Read-through path that combines the cache with a network loader.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use super::key::{cache_key, Params};
use super::store::ResponseCache;

/// Per-call options for [`ResponseCache::cached_request`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOptions {
  /// TTL for the stored result, defaults to the cache's default TTL
  pub ttl: Option<Duration>,
  /// Skip the lookup and overwrite whatever is cached
  pub force_refresh: bool,
}

impl CacheOptions {
  pub fn ttl(ttl: Duration) -> Self {
    Self {
      ttl: Some(ttl),
      ..Self::default()
    }
  }

  pub fn force_refresh() -> Self {
    Self {
      force_refresh: true,
      ..Self::default()
    }
  }
}

impl<V: Clone> ResponseCache<V> {
  /// Fetch with cache-first strategy.
  ///
  /// 1. If `force_refresh`, drop the cached entry
  /// 2. Otherwise return a live cached value without calling `loader`
  /// 3. On a miss, await `loader` and store its result
  ///
  /// A failed load is returned unchanged and never cached.
  pub async fn cached_request<F, Fut, E>(
    &self,
    endpoint: &str,
    params: Option<&Params>,
    options: CacheOptions,
    loader: F,
  ) -> Result<V, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>>,
  {
    let key = cache_key(endpoint, params);

    if options.force_refresh {
      self.invalidate(endpoint, params);
    } else if let Some(hit) = self.get_by_key(&key) {
      debug!(%key, "cache hit");
      return Ok(hit);
    }

    debug!(%key, "cache miss");
    let data = loader().await?;
    self.set_by_key(key, data.clone(), options.ttl);

    Ok(data)
  }
}
