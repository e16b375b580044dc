//! Admin API key authentication
//!
//! Write routes take an [`AdminKey`] argument; extraction fails with a 401
//! unless `X-API-Key` matches the configured `PANGEO_FORGE_API_KEY` or an
//! active key stored in `api_keys`.

use axum::{extract::FromRequestParts, http::request::Parts};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::api::AppState;
use crate::error::AppError;
use crate::models::hash_api_key;

/// Header carrying the admin key
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Which key authenticated the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// `PANGEO_FORGE_API_KEY`
    Configured,
    /// Row in `api_keys`
    Stored(i64),
}

/// Proof that the request carried a valid admin key
#[derive(Debug, Clone, Copy)]
pub struct AdminKey {
    pub source: KeySource,
}

impl AdminKey {
    /// Only the configured key may manage stored keys
    pub fn require_configured(&self) -> Result<(), AppError> {
        match self.source {
            KeySource::Configured => Ok(()),
            KeySource::Stored(_) => Err(AppError::Authorization(
                "API keys can only be managed with the server's admin key".into(),
            )),
        }
    }
}

impl FromRequestParts<AppState> for AdminKey {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let provided = match parts.headers.get(API_KEY_HEADER) {
            Some(value) => value
                .to_str()
                .map_err(|_| AppError::Authentication("Invalid X-API-Key header value".into()))?,
            None => return Err(AppError::Unauthorized("Not authenticated".into())),
        };

        let configured = state
            .settings
            .api
            .admin_api_key
            .as_deref()
            .filter(|k| !k.is_empty());

        if let Some(configured) = configured {
            if constant_time_compare(configured, provided) {
                debug!(path = %parts.uri.path(), "Admin key accepted");
                return Ok(AdminKey {
                    source: KeySource::Configured,
                });
            }
        }

        match stored_key_id(state, provided).await {
            Some(id) => {
                debug!(path = %parts.uri.path(), api_key_id = id, "Stored API key accepted");
                Ok(AdminKey {
                    source: KeySource::Stored(id),
                })
            }
            None => {
                warn!(path = %parts.uri.path(), "Invalid API key attempt");
                Err(AppError::Authentication("Invalid API key".into()))
            }
        }
    }
}

/// Id of the active stored key matching `provided`, touching `last_used_at`
///
/// A failed lookup counts as no match.
async fn stored_key_id(state: &AppState, provided: &str) -> Option<i64> {
    let result = sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE api_keys SET last_used_at = NOW()
        WHERE key_hash = $1 AND is_active
        RETURNING id
        "#,
    )
    .bind(hash_api_key(provided))
    .fetch_optional(state.db.pool())
    .await;

    match result {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "API key lookup failed");
            None
        }
    }
}

/// Compare two secrets without leaking where, or whether by length, they differ
///
/// Both sides are hashed so the comparison always runs over 32 bytes.
pub(crate) fn constant_time_compare(a: &str, b: &str) -> bool {
    let hash_a = Sha256::digest(a.as_bytes());
    let hash_b = Sha256::digest(b.as_bytes());
    hash_a.as_slice().ct_eq(hash_b.as_slice()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_compare_equal() {
        assert!(constant_time_compare("secret", "secret"));
        assert!(constant_time_compare("", ""));
        assert!(constant_time_compare(
            "super-long-admin-key-1234567890",
            "super-long-admin-key-1234567890"
        ));
    }

    #[test]
    fn test_constant_time_compare_different() {
        assert!(!constant_time_compare("secret", "Secret"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("secret", "secre"));
        assert!(!constant_time_compare("short", "much-longer-string"));
    }

    #[test]
    fn test_only_configured_key_manages_keys() {
        let configured = AdminKey {
            source: KeySource::Configured,
        };
        let stored = AdminKey {
            source: KeySource::Stored(3),
        };
        assert!(configured.require_configured().is_ok());
        assert!(matches!(
            stored.require_configured(),
            Err(AppError::Authorization(_))
        ));
    }
}
