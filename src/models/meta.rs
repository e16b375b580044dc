//! `meta.yaml` types
//!
//! Every feedstock (and every recipe proposed to staged-recipes) carries a
//! `meta.yaml` naming its recipes and the bakery they run on.
//! `pangeo-forge-runner expand-meta` returns the same document as JSON with
//! any `dict_object` recipe collections expanded into explicit entries.

use serde::{Deserialize, Serialize};

/// One recipe entry
///
/// An entry may instead point at a `dict_object` that the runner expands
/// into several entries; such an entry has no id of its own.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RecipeEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dict_object: Option<String>,
}

/// Recipe declarations: either explicit entries or a dict object that
/// the runner expands
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Recipes {
    List(Vec<RecipeEntry>),
    Dict { dict_object: String },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MetaBakery {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Maintainer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orcid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<String>,
}

/// Parsed `meta.yaml`
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Meta {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub recipes: Recipes,
    pub bakery: MetaBakery,
    #[serde(default)]
    pub maintainers: Vec<Maintainer>,
    #[serde(default)]
    pub provenance: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MetaError {
    #[error("meta.yaml is not valid: {0}")]
    Parse(String),
    #[error("recipes are declared through dict_object '{0}' and were not expanded")]
    NotExpanded(String),
    #[error("meta.yaml declares no recipes")]
    NoRecipes,
    #[error("recipe id '{0}' is declared more than once")]
    DuplicateRecipe(String),
    #[error("recipe id '{0}' is not valid")]
    InvalidRecipeId(String),
}

/// Recipe ids end up in job names and comment commands
pub fn is_valid_recipe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 255
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

impl Meta {
    pub fn from_json(value: serde_json::Value) -> Result<Self, MetaError> {
        serde_json::from_value(value).map_err(|e| MetaError::Parse(e.to_string()))
    }

    /// Recipe ids in declaration order, once they are explicit
    pub fn recipe_ids(&self) -> Result<Vec<&str>, MetaError> {
        let entries = match &self.recipes {
            Recipes::List(entries) => entries,
            Recipes::Dict { dict_object } => {
                return Err(MetaError::NotExpanded(dict_object.clone()))
            }
        };
        if entries.is_empty() {
            return Err(MetaError::NoRecipes);
        }

        let mut ids: Vec<&str> = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(dict_object) = &entry.dict_object {
                return Err(MetaError::NotExpanded(dict_object.clone()));
            }
            if !is_valid_recipe_id(&entry.id) {
                return Err(MetaError::InvalidRecipeId(entry.id.clone()));
            }
            if ids.contains(&entry.id.as_str()) {
                return Err(MetaError::DuplicateRecipe(entry.id.clone()));
            }
            ids.push(&entry.id);
        }
        Ok(ids)
    }
}

/// Convert arbitrary YAML text into JSON, keeping every field
pub fn yaml_to_json(text: &str) -> Result<serde_json::Value, MetaError> {
    let value: serde_yaml_ng::Value =
        serde_yaml_ng::from_str(text).map_err(|e| MetaError::Parse(e.to_string()))?;
    serde_json::to_value(value).map_err(|e| MetaError::Parse(e.to_string()))
}
