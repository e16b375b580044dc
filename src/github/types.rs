//! GitHub REST request and response shapes

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::GitHubError;

#[derive(Debug, Deserialize)]
pub struct Installation {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct AccessToken {
    pub token: String,
}

/// Contents API response for a single file
#[derive(Debug, Deserialize)]
pub struct FileContent {
    pub encoding: String,
    pub content: String,
}

impl FileContent {
    pub fn decode(&self) -> Result<String, GitHubError> {
        if self.encoding != "base64" {
            return Err(GitHubError::Decode(format!(
                "unsupported content encoding '{}'",
                self.encoding
            )));
        }
        // GitHub wraps the base64 payload at 60 columns
        let compact: String = self.content.split_whitespace().collect();
        let bytes = BASE64
            .decode(compact)
            .map_err(|e| GitHubError::Decode(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| GitHubError::Decode(e.to_string()))
    }
}

/// Entry of `GET /repos/{repo}/pulls/{n}/files`
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestFile {
    pub filename: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckRunOutput {
    pub title: String,
    pub summary: String,
}

/// Body of `POST /repos/{repo}/check-runs`
#[derive(Debug, Clone, Serialize)]
pub struct NewCheckRun {
    pub name: String,
    pub head_sha: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details_url: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<CheckRunOutput>,
}

impl NewCheckRun {
    pub fn in_progress(name: &str, head_sha: &str, details_url: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            head_sha: head_sha.to_string(),
            status: "in_progress".to_string(),
            details_url,
            started_at: Utc::now(),
            output: None,
        }
    }
}

/// Body of `PATCH /repos/{repo}/check-runs/{id}`
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckRunUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<CheckRunOutput>,
}

impl CheckRunUpdate {
    pub fn completed(conclusion: &str, title: &str, summary: &str) -> Self {
        Self {
            status: Some("completed".to_string()),
            conclusion: Some(conclusion.to_string()),
            completed_at: Some(Utc::now()),
            output: Some(CheckRunOutput {
                title: title.to_string(),
                summary: summary.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckRun {
    pub id: i64,
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueCommentCreated {
    pub id: i64,
    pub html_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Reaction {
    pub id: i64,
    pub content: String,
}
