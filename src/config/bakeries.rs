//! Bakery definitions
//!
//! A bakery is the compute + storage target a recipe is baked on. Each YAML
//! file in the bakeries directory maps bakery names to the traitlets
//! configuration handed to `pangeo-forge-runner bake`:
//!
//! ```yaml
//! pangeo-ldeo-nsf-earthcube:
//!   region: us-central1
//!   description: Dataflow bakery
//!   Bake:
//!     bakery_class: pangeo_forge_runner.bakery.dataflow.DataflowBakery
//!   DataflowBakery:
//!     temp_gcs_location: gs://pangeo-forge-prod-dataflow/temp
//!   TargetStorage:
//!     fsspec_class: s3fs.S3FileSystem
//!     root_path: pangeo-forge/{job_name}
//!     public_url: https://ncsa.osn.xsede.org/Pangeo/pangeo-forge/{job_name}
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

/// Placeholder substituted with the Dataflow job name
const JOB_NAME_PLACEHOLDER: &str = "{job_name}";

/// Storage location for one of the runner's storage traits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    pub fsspec_class: String,
    #[serde(default = "empty_object")]
    pub fsspec_args: serde_json::Value,
    pub root_path: String,
    /// Public HTTP prefix for objects written under `root_path`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

fn empty_object() -> serde_json::Value {
    json!({})
}

impl StorageConfig {
    fn rendered(&self, job_name: &str) -> serde_json::Value {
        json!({
            "fsspec_class": self.fsspec_class,
            "fsspec_args": self.fsspec_args,
            "root_path": self.root_path.replace(JOB_NAME_PLACEHOLDER, job_name),
        })
    }
}

/// `Bake` traitlets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BakeSettings {
    pub bakery_class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,
}

/// `DataflowBakery` traitlets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataflowSettings {
    pub temp_gcs_location: String,
}

/// A single bakery definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BakeryConfig {
    pub region: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "Bake")]
    pub bake: BakeSettings,
    #[serde(rename = "DataflowBakery", default)]
    pub dataflow: Option<DataflowSettings>,
    #[serde(rename = "TargetStorage")]
    pub target_storage: StorageConfig,
    #[serde(rename = "InputCacheStorage", default)]
    pub input_cache_storage: Option<StorageConfig>,
    #[serde(rename = "MetadataCacheStorage", default)]
    pub metadata_cache_storage: Option<StorageConfig>,
}

impl BakeryConfig {
    /// Render the runner config file contents for one bake invocation
    pub fn runner_config(&self, recipe_id: &str, job_name: &str, prune: bool) -> serde_json::Value {
        let mut bake = json!({
            "bakery_class": self.bake.bakery_class,
            "recipe_id": recipe_id,
            "job_name": job_name,
            "prune": prune,
        });
        if let Some(ref image) = self.bake.container_image {
            bake["container_image"] = json!(image);
        }

        let mut config = json!({
            "Bake": bake,
            "TargetStorage": self.target_storage.rendered(job_name),
        });
        if let Some(ref dataflow) = self.dataflow {
            config["DataflowBakery"] = json!({ "temp_gcs_location": dataflow.temp_gcs_location });
        }
        if let Some(ref storage) = self.input_cache_storage {
            config["InputCacheStorage"] = storage.rendered(job_name);
        }
        if let Some(ref storage) = self.metadata_cache_storage {
            config["MetadataCacheStorage"] = storage.rendered(job_name);
        }
        config
    }

    /// Public URL of a zarr store written by `recipe_id` under `job_name`
    pub fn dataset_public_url(&self, job_name: &str, recipe_id: &str) -> Option<String> {
        let base = self.target_storage.public_url.as_ref()?;
        let base = base.replace(JOB_NAME_PLACEHOLDER, job_name);
        Some(format!("{}/{}.zarr", base.trim_end_matches('/'), recipe_id))
    }
}

/// All bakeries known to this deployment, keyed by name
#[derive(Debug, Clone, Default)]
pub struct BakeryRegistry {
    bakeries: BTreeMap<String, BakeryConfig>,
}

impl BakeryRegistry {
    /// Load every `*.yaml` / `*.yml` file in `dir`
    ///
    /// A missing directory yields an empty registry; a bakery name defined
    /// twice is an error.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::default();

        if !dir.is_dir() {
            warn!(dir = %dir.display(), "Bakeries directory not found, no bakeries loaded");
            return Ok(registry);
        }

        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read bakeries directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();

        for path in paths {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            registry
                .extend_from_yaml(&text)
                .with_context(|| format!("Invalid bakery file {}", path.display()))?;
        }

        info!(count = registry.len(), "Bakeries loaded");
        Ok(registry)
    }

    /// Parse a single YAML document of bakery definitions
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let mut registry = Self::default();
        registry.extend_from_yaml(text)?;
        Ok(registry)
    }

    fn extend_from_yaml(&mut self, text: &str) -> Result<()> {
        let parsed: BTreeMap<String, BakeryConfig> =
            serde_yaml_ng::from_str(text).context("Failed to parse bakery YAML")?;
        for (name, config) in parsed {
            if self.bakeries.contains_key(&name) {
                anyhow::bail!("Bakery '{}' is defined more than once", name);
            }
            self.bakeries.insert(name, config);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&BakeryConfig> {
        self.bakeries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bakeries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.bakeries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bakeries.is_empty()
    }
}
