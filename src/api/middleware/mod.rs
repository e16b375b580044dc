//! API middleware and extractors

pub mod admin_auth;
pub mod validation;

pub use admin_auth::{AdminKey, KeySource, API_KEY_HEADER};
pub use validation::ValidatedJson;
