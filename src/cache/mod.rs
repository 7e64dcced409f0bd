//! In-process response cache for API reads.
//!
//! This module provides a bounded, TTL-expiring cache that:
//! - Keys entries by endpoint plus a canonical form of the query parameters
//! - Expires entries lazily on read (there is no background sweep)
//! - Evicts the oldest entries once the configured size is exceeded
//! - Supports substring invalidation so writes can drop every cached view of a resource

mod key;
mod layer;
mod store;

pub use key::{cache_key, Params};
pub use layer::CacheOptions;
pub use store::{CacheSettings, CacheStats, EntryStats, ResponseCache};
