//! Bakery model and related types
//!
//! A bakery row mirrors one entry of the bakery YAML registry and is the
//! target every recipe run is baked on.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

use super::RecipeRun;

/// Bakery entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct Bakery {
    pub id: i64,
    /// Cloud region the bakery runs in
    pub region: String,
    /// Unique bakery name, matches the registry key
    pub name: String,
    pub description: String,
}

/// Request to create a bakery
#[derive(Debug, Deserialize, Validate)]
pub struct CreateBakeryRequest {
    #[validate(length(min = 1, max = 100, message = "Region must be 1-100 characters"))]
    pub region: String,
    #[validate(length(min = 1, max = 255, message = "Name must be 1-255 characters"))]
    pub name: String,
    #[validate(length(max = 2000, message = "Description must be at most 2000 characters"))]
    #[serde(default)]
    pub description: String,
}

/// Partial update of a bakery
#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateBakeryRequest {
    #[validate(length(min = 1, max = 100, message = "Region must be 1-100 characters"))]
    pub region: Option<String>,
    #[validate(length(min = 1, max = 255, message = "Name must be 1-255 characters"))]
    pub name: Option<String>,
    #[validate(length(max = 2000, message = "Description must be at most 2000 characters"))]
    pub description: Option<String>,
}

impl UpdateBakeryRequest {
    /// Apply the present fields on top of `existing`
    pub fn apply(self, existing: Bakery) -> Bakery {
        Bakery {
            id: existing.id,
            region: self.region.unwrap_or(existing.region),
            name: self.name.unwrap_or(existing.name),
            description: self.description.unwrap_or(existing.description),
        }
    }
}

/// Bakery with the recipe runs baked on it
#[derive(Debug, Serialize)]
pub struct BakeryWithRecipeRuns {
    #[serde(flatten)]
    pub bakery: Bakery,
    pub recipe_runs: Vec<RecipeRun>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bakery() -> Bakery {
        Bakery {
            id: 1,
            region: "us-central1".to_string(),
            name: "pangeo-ldeo-nsf-earthcube".to_string(),
            description: "Dataflow".to_string(),
        }
    }

    #[test]
    fn test_update_applies_present_fields_only() {
        let update = UpdateBakeryRequest {
            description: Some("Updated".to_string()),
            ..Default::default()
        };
        let updated = update.apply(bakery());
        assert_eq!(updated.description, "Updated");
        assert_eq!(updated.region, "us-central1");
        assert_eq!(updated.id, 1);
    }

    #[test]
    fn test_create_validation() {
        let request = CreateBakeryRequest {
            region: String::new(),
            name: "b".to_string(),
            description: String::new(),
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_with_recipe_runs_flattens() {
        let value = serde_json::to_value(BakeryWithRecipeRuns {
            bakery: bakery(),
            recipe_runs: vec![],
        })
        .unwrap();
        assert_eq!(value["name"], "pangeo-ldeo-nsf-earthcube");
        assert!(value["recipe_runs"].as_array().unwrap().is_empty());
    }
}
