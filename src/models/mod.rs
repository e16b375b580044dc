//! Data models for the orchestrator
//!
//! Database rows, request types, GitHub webhook payloads and `meta.yaml`.

mod api_key;
mod bakery;
mod feedstock;
mod meta;
mod recipe_run;
mod webhook;

pub use api_key::*;
pub use bakery::*;
pub use feedstock::*;
pub use meta::*;
pub use recipe_run::*;
pub use webhook::*;
