//! Pangeo Forge Orchestrator library
//!
//! Exposes the service components for the binary and the integration tests.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod github;
pub mod models;
pub mod observability;
pub mod runner;
pub mod webhook;
