//! Request layer for the CRM dashboard REST API.
//!
//! - [`auth`] holds the current token pair and refreshes it single-flight
//! - [`cache`] is the bounded TTL response cache with pattern invalidation
//! - [`api`] composes both into the client every resource call goes through

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;

pub use api::{ApiClient, ApiError, ApiRequest, ResourceId};
pub use config::Config;
