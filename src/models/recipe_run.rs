//! Recipe run model and related types
//!
//! A recipe run is one execution of one recipe from a feedstock on a
//! bakery. Its `status`/`conclusion` pair follows GitHub's check-run
//! vocabulary:
//!
//! ```text
//! queued ──▶ in_progress ──▶ completed(conclusion)
//!    └───────────────────────▲
//! ```
//!
//! A run is `completed` exactly when it carries a conclusion and a
//! `completed_at` timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

use super::{Bakery, Feedstock};

/// Recipe run status
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecipeRunStatus {
    #[default]
    Queued,
    InProgress,
    Completed,
}

impl std::fmt::Display for RecipeRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecipeRunStatus::Queued => write!(f, "queued"),
            RecipeRunStatus::InProgress => write!(f, "in_progress"),
            RecipeRunStatus::Completed => write!(f, "completed"),
        }
    }
}

impl TryFrom<&str> for RecipeRunStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "queued" => Ok(RecipeRunStatus::Queued),
            "in_progress" => Ok(RecipeRunStatus::InProgress),
            "completed" => Ok(RecipeRunStatus::Completed),
            _ => Err(format!("Invalid recipe run status: {}", s)),
        }
    }
}

/// Recipe run conclusion, only present once completed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecipeRunConclusion {
    ActionRequired,
    Cancelled,
    Failure,
    Neutral,
    Success,
    Skipped,
    Stale,
    TimedOut,
}

impl std::fmt::Display for RecipeRunConclusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecipeRunConclusion::ActionRequired => "action_required",
            RecipeRunConclusion::Cancelled => "cancelled",
            RecipeRunConclusion::Failure => "failure",
            RecipeRunConclusion::Neutral => "neutral",
            RecipeRunConclusion::Success => "success",
            RecipeRunConclusion::Skipped => "skipped",
            RecipeRunConclusion::Stale => "stale",
            RecipeRunConclusion::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

impl TryFrom<&str> for RecipeRunConclusion {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "action_required" => Ok(RecipeRunConclusion::ActionRequired),
            "cancelled" => Ok(RecipeRunConclusion::Cancelled),
            "failure" => Ok(RecipeRunConclusion::Failure),
            "neutral" => Ok(RecipeRunConclusion::Neutral),
            "success" => Ok(RecipeRunConclusion::Success),
            "skipped" => Ok(RecipeRunConclusion::Skipped),
            "stale" => Ok(RecipeRunConclusion::Stale),
            "timed_out" => Ok(RecipeRunConclusion::TimedOut),
            _ => Err(format!("Invalid recipe run conclusion: {}", s)),
        }
    }
}

/// Kind of dataset a run produces
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatasetType {
    Zarr,
    Kerchunk,
    Reference,
}

impl std::fmt::Display for DatasetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatasetType::Zarr => write!(f, "zarr"),
            DatasetType::Kerchunk => write!(f, "kerchunk"),
            DatasetType::Reference => write!(f, "reference"),
        }
    }
}

/// Recipe run entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct RecipeRun {
    pub id: i64,
    pub recipe_id: String,
    pub bakery_id: i64,
    pub feedstock_id: i64,
    /// Commit the recipe was taken from
    pub head_sha: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub conclusion: Option<String>,
    pub status: String,
    /// Test runs come from pull requests and are pruned
    pub is_test: bool,
    pub dataset_type: Option<String>,
    pub dataset_public_url: Option<String>,
    /// JSON encoded [`RunMessage`]
    pub message: Option<String>,
}

impl RecipeRun {
    pub fn status(&self) -> Option<RecipeRunStatus> {
        RecipeRunStatus::try_from(self.status.as_str()).ok()
    }

    pub fn is_completed(&self) -> bool {
        self.status() == Some(RecipeRunStatus::Completed)
    }

    /// Decode the structured message, tolerating free text
    pub fn run_message(&self) -> RunMessage {
        match self.message.as_deref() {
            Some(text) => serde_json::from_str(text).unwrap_or_else(|_| RunMessage {
                error: Some(text.to_string()),
                ..Default::default()
            }),
            None => RunMessage::default(),
        }
    }
}

/// Structured contents of `recipe_runs.message`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_run_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

lazy_static::lazy_static! {
    static ref VERSION_REGEX: regex::Regex =
        regex::Regex::new(r"^\d+(\.\d+)*([-+][0-9A-Za-z.-]+)?$").unwrap();
}

/// A commit sha must be 40 lowercase hex characters
pub fn validate_head_sha(sha: &str) -> Result<(), validator::ValidationError> {
    if sha.len() != 40 || !sha.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
        let mut err = validator::ValidationError::new("invalid_head_sha");
        err.message = Some(std::borrow::Cow::Borrowed(
            "head_sha must be 40 lowercase hexadecimal characters",
        ));
        return Err(err);
    }
    Ok(())
}

/// Versions are empty or dotted numeric with an optional suffix
pub fn validate_version(version: &str) -> Result<(), validator::ValidationError> {
    if !version.is_empty() && !VERSION_REGEX.is_match(version) {
        let mut err = validator::ValidationError::new("invalid_version");
        err.message = Some(std::borrow::Cow::Borrowed(
            "version must be empty or look like 1.2.3",
        ));
        return Err(err);
    }
    Ok(())
}

fn validate_message(message: &str) -> Result<(), validator::ValidationError> {
    if message.len() > 64 * 1024 {
        let mut err = validator::ValidationError::new("message_too_large");
        err.message = Some(std::borrow::Cow::Borrowed("message must be at most 64KB"));
        return Err(err);
    }
    Ok(())
}

/// Check the status/conclusion/completed_at combination
pub fn check_completion_state(
    status: RecipeRunStatus,
    conclusion: Option<RecipeRunConclusion>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<(), String> {
    match (status, conclusion, completed_at) {
        (RecipeRunStatus::Completed, Some(_), Some(_)) => Ok(()),
        (RecipeRunStatus::Completed, None, _) => {
            Err("a completed recipe run requires a conclusion".to_string())
        }
        (RecipeRunStatus::Completed, _, None) => {
            Err("a completed recipe run requires completed_at".to_string())
        }
        (_, Some(_), _) => Err(format!(
            "conclusion can only be set when status is completed (got {})",
            status
        )),
        (_, _, Some(_)) => Err(format!(
            "completed_at can only be set when status is completed (got {})",
            status
        )),
        _ => Ok(()),
    }
}

/// Request to create a recipe run
#[derive(Debug, Deserialize, Validate)]
pub struct CreateRecipeRunRequest {
    #[validate(length(min = 1, max = 255, message = "recipe_id must be 1-255 characters"))]
    pub recipe_id: String,
    pub bakery_id: i64,
    pub feedstock_id: i64,
    #[validate(custom(function = "validate_head_sha"))]
    pub head_sha: String,
    #[serde(default)]
    #[validate(custom(function = "validate_version"))]
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub conclusion: Option<RecipeRunConclusion>,
    #[serde(default)]
    pub status: RecipeRunStatus,
    #[serde(default)]
    pub is_test: bool,
    pub dataset_type: Option<DatasetType>,
    #[validate(url(message = "dataset_public_url must be a URL"))]
    pub dataset_public_url: Option<String>,
    #[validate(custom(function = "validate_message"))]
    pub message: Option<String>,
}

impl CreateRecipeRunRequest {
    pub fn check_state(&self) -> Result<(), String> {
        check_completion_state(self.status, self.conclusion, self.completed_at)
    }
}

/// Partial update of a recipe run
#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateRecipeRunRequest {
    #[validate(length(min = 1, max = 255, message = "recipe_id must be 1-255 characters"))]
    pub recipe_id: Option<String>,
    pub bakery_id: Option<i64>,
    pub feedstock_id: Option<i64>,
    #[validate(custom(function = "validate_head_sha"))]
    pub head_sha: Option<String>,
    #[validate(custom(function = "validate_version"))]
    pub version: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub conclusion: Option<RecipeRunConclusion>,
    pub status: Option<RecipeRunStatus>,
    pub is_test: Option<bool>,
    pub dataset_type: Option<DatasetType>,
    #[validate(url(message = "dataset_public_url must be a URL"))]
    pub dataset_public_url: Option<String>,
    #[validate(custom(function = "validate_message"))]
    pub message: Option<String>,
}

impl UpdateRecipeRunRequest {
    /// Merge onto `existing` and check the resulting state is consistent
    pub fn apply(self, existing: RecipeRun) -> Result<RecipeRun, String> {
        let status = match self.status {
            Some(status) => status,
            None => RecipeRunStatus::try_from(existing.status.as_str())?,
        };
        let conclusion = match self.conclusion {
            Some(conclusion) => Some(conclusion),
            None => existing
                .conclusion
                .as_deref()
                .map(|c| RecipeRunConclusion::try_from(c))
                .transpose()?,
        };
        let completed_at = self.completed_at.or(existing.completed_at);

        check_completion_state(status, conclusion, completed_at)?;

        Ok(RecipeRun {
            id: existing.id,
            recipe_id: self.recipe_id.unwrap_or(existing.recipe_id),
            bakery_id: self.bakery_id.unwrap_or(existing.bakery_id),
            feedstock_id: self.feedstock_id.unwrap_or(existing.feedstock_id),
            head_sha: self.head_sha.unwrap_or(existing.head_sha),
            version: self.version.unwrap_or(existing.version),
            started_at: self.started_at.unwrap_or(existing.started_at),
            completed_at,
            conclusion: conclusion.map(|c| c.to_string()),
            status: status.to_string(),
            is_test: self.is_test.unwrap_or(existing.is_test),
            dataset_type: self
                .dataset_type
                .map(|t| t.to_string())
                .or(existing.dataset_type),
            dataset_public_url: self.dataset_public_url.or(existing.dataset_public_url),
            message: self.message.or(existing.message),
        })
    }
}

/// Filters accepted by the recipe run listing
#[derive(Debug, Default, Deserialize)]
pub struct RecipeRunFilter {
    pub feedstock_id: Option<i64>,
    pub bakery_id: Option<i64>,
    pub head_sha: Option<String>,
    pub recipe_id: Option<String>,
    pub is_test: Option<bool>,
    pub status: Option<RecipeRunStatus>,
}

/// Recipe run with its bakery and feedstock resolved
#[derive(Debug, Serialize)]
pub struct RecipeRunWithBakeryAndFeedstock {
    #[serde(flatten)]
    pub recipe_run: RecipeRun,
    pub bakery: Bakery,
    pub feedstock: Feedstock,
}
