//! Feedstock model and related types
//!
//! A feedstock is a GitHub repository holding one or more recipes. The
//! `spec` column is the repository's `owner/name`.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

use super::RecipeRun;

/// Default (and only supported) feedstock provider
pub const GITHUB_PROVIDER: &str = "github";

/// Feedstock entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct Feedstock {
    pub id: i64,
    /// `owner/repo`
    pub spec: String,
    pub provider: String,
}

impl Feedstock {
    /// Repository name without the owner
    pub fn repo_name(&self) -> &str {
        self.spec.rsplit('/').next().unwrap_or(&self.spec)
    }
}

fn default_provider() -> String {
    GITHUB_PROVIDER.to_string()
}

/// Validate an `owner/repo` spec
pub fn validate_feedstock_spec(spec: &str) -> Result<(), validator::ValidationError> {
    let mut parts = spec.split('/');
    let valid = match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(repo), None) => {
            let ok = |s: &str| {
                !s.is_empty()
                    && s.len() <= 100
                    && s.chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            };
            ok(owner) && ok(repo)
        }
        _ => false,
    };

    if !valid {
        let mut err = validator::ValidationError::new("invalid_spec");
        err.message = Some(std::borrow::Cow::Borrowed(
            "Feedstock spec must have the form owner/repo",
        ));
        return Err(err);
    }
    Ok(())
}

fn validate_provider(provider: &str) -> Result<(), validator::ValidationError> {
    if provider != GITHUB_PROVIDER {
        let mut err = validator::ValidationError::new("invalid_provider");
        err.message = Some(std::borrow::Cow::Borrowed("Only the github provider is supported"));
        return Err(err);
    }
    Ok(())
}

/// Request to create a feedstock
#[derive(Debug, Deserialize, Validate)]
pub struct CreateFeedstockRequest {
    #[validate(custom(function = "validate_feedstock_spec"))]
    pub spec: String,
    #[serde(default = "default_provider")]
    #[validate(custom(function = "validate_provider"))]
    pub provider: String,
}

/// Partial update of a feedstock
#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateFeedstockRequest {
    #[validate(custom(function = "validate_feedstock_spec"))]
    pub spec: Option<String>,
    #[validate(custom(function = "validate_provider"))]
    pub provider: Option<String>,
}

impl UpdateFeedstockRequest {
    /// Apply the present fields on top of `existing`
    pub fn apply(self, existing: Feedstock) -> Feedstock {
        Feedstock {
            id: existing.id,
            spec: self.spec.unwrap_or(existing.spec),
            provider: self.provider.unwrap_or(existing.provider),
        }
    }
}

/// Feedstock with its recipe runs
#[derive(Debug, Serialize)]
pub struct FeedstockWithRecipeRuns {
    #[serde(flatten)]
    pub feedstock: Feedstock,
    pub recipe_runs: Vec<RecipeRun>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_validation() {
        assert!(validate_feedstock_spec("pangeo-forge/gpcp-feedstock").is_ok());
        assert!(validate_feedstock_spec("org/repo.name_1").is_ok());
        assert!(validate_feedstock_spec("no-slash").is_err());
        assert!(validate_feedstock_spec("a/b/c").is_err());
        assert!(validate_feedstock_spec("/repo").is_err());
        assert!(validate_feedstock_spec("org/").is_err());
        assert!(validate_feedstock_spec("org/re po").is_err());
    }

    #[test]
    fn test_create_defaults_provider() {
        let request: CreateFeedstockRequest =
            serde_json::from_value(serde_json::json!({"spec": "org/repo"})).unwrap();
        assert_eq!(request.provider, "github");
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let request = CreateFeedstockRequest {
            spec: "org/repo".to_string(),
            provider: "gitlab".to_string(),
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_repo_name() {
        let feedstock = Feedstock {
            id: 1,
            spec: "pangeo-forge/gpcp-feedstock".to_string(),
            provider: GITHUB_PROVIDER.to_string(),
        };
        assert_eq!(feedstock.repo_name(), "gpcp-feedstock");
    }
}
