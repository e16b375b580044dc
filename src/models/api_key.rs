//! API key model and related types
//!
//! Stored keys let operators hand out write access without sharing the
//! configured admin key. Only a SHA-256 digest of each key is kept; the raw
//! key is returned once, when it is created.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

/// Prefix of every generated key
pub const API_KEY_PREFIX: &str = "pfo_";

/// Characters of a key kept in clear for identification
const DISPLAY_PREFIX_LEN: usize = 12;

/// API key entity
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ApiKey {
    pub id: i64,
    pub name: String,
    /// Hex SHA-256 of the raw key
    #[serde(skip_serializing)]
    pub key_hash: String,
    /// Leading characters of the raw key
    pub key_prefix: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Request to create an API key
#[derive(Debug, Deserialize, Validate)]
pub struct CreateApiKeyRequest {
    #[validate(length(min = 1, max = 255, message = "Name must be 1-255 characters"))]
    pub name: String,
}

/// Response to a key creation; the only time `key` is shown
#[derive(Debug, Serialize)]
pub struct CreateApiKeyResponse {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
}

/// Partial update of an API key
#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateApiKeyRequest {
    #[validate(length(min = 1, max = 255, message = "Name must be 1-255 characters"))]
    pub name: Option<String>,
    pub is_active: Option<bool>,
}

impl UpdateApiKeyRequest {
    pub fn apply(self, existing: ApiKey) -> ApiKey {
        ApiKey {
            name: self.name.unwrap_or(existing.name),
            is_active: self.is_active.unwrap_or(existing.is_active),
            ..existing
        }
    }
}

/// New random key: the prefix followed by 64 hex characters
pub fn generate_api_key() -> String {
    format!(
        "{}{}{}",
        API_KEY_PREFIX,
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// Digest stored for `raw_key`
pub fn hash_api_key(raw_key: &str) -> String {
    hex::encode(Sha256::digest(raw_key.as_bytes()))
}

/// Clear-text part stored next to the digest
pub fn display_prefix(raw_key: &str) -> String {
    raw_key.chars().take(DISPLAY_PREFIX_LEN).collect()
}
