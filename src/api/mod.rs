//! Request dispatcher: authorization-aware dispatch, cached reads, invalidating writes.

mod client;
mod error;
mod invalidation;
mod outcome;
mod request;
mod resource;

pub use client::ApiClient;
pub use error::ApiError;
pub use invalidation::InvalidationRules;
pub use outcome::Outcome;
pub use request::ApiRequest;
pub use resource::ResourceId;
