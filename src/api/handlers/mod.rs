//! HTTP handlers for the API

pub mod api_keys;
pub mod bakeries;
pub mod feedstocks;
pub mod github_hooks;
pub mod health;
pub mod metrics;
pub mod recipe_runs;
