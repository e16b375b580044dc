//! Webhook payload types
//!
//! Only the fields the orchestrator acts on are modelled; GitHub sends
//! much more.

use serde::{Deserialize, Serialize};

use super::RecipeRunConclusion;

/// GitHub repository info
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubRepository {
    pub id: i64,
    pub name: String,
    pub full_name: String,
    pub html_url: String,
}

/// GitHub user info
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubUser {
    pub id: i64,
    pub login: String,
}

/// App installation the delivery belongs to
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubInstallation {
    pub id: i64,
}

/// Head or base of a pull request
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitRef {
    pub sha: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
    /// Null when the fork has been deleted
    pub repo: Option<GitHubRepository>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubLabel {
    pub name: String,
}

/// Pull request as embedded in `pull_request` events and returned by the API
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PullRequest {
    pub number: i64,
    #[serde(default)]
    pub title: String,
    pub html_url: String,
    #[serde(default)]
    pub merged: Option<bool>,
    #[serde(default)]
    pub merge_commit_sha: Option<String>,
    pub head: GitRef,
    pub base: GitRef,
    #[serde(default)]
    pub labels: Vec<GitHubLabel>,
}

impl PullRequest {
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.name == name)
    }

    pub fn is_merged(&self) -> bool {
        self.merged.unwrap_or(false)
    }

    /// `owner/repo` of the repository the PR targets
    pub fn base_full_name(&self) -> Option<&str> {
        self.base.repo.as_ref().map(|r| r.full_name.as_str())
    }
}

/// `pull_request` event
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub number: i64,
    pub pull_request: PullRequest,
    pub repository: GitHubRepository,
    #[serde(default)]
    pub installation: Option<GitHubInstallation>,
}

/// Link present on issues that are pull requests
#[derive(Debug, Clone, Deserialize)]
pub struct IssuePullRequestLink {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub number: i64,
    #[serde(default)]
    pub pull_request: Option<IssuePullRequestLink>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueComment {
    pub id: i64,
    pub body: String,
    pub user: GitHubUser,
    /// OWNER, MEMBER, COLLABORATOR, CONTRIBUTOR, NONE, ...
    pub author_association: String,
}

impl IssueComment {
    /// Whether the author may trigger runs from a comment
    pub fn author_can_run(&self) -> bool {
        matches!(
            self.author_association.as_str(),
            "OWNER" | "MEMBER" | "COLLABORATOR"
        )
    }
}

/// `issue_comment` event
#[derive(Debug, Clone, Deserialize)]
pub struct IssueCommentEvent {
    pub action: String,
    pub issue: Issue,
    pub comment: IssueComment,
    pub repository: GitHubRepository,
}

/// Job-completion callback posted by the Dataflow monitoring hook
///
/// Delivered with `X-GitHub-Event: dataflow` and signed with the webhook
/// secret like any other delivery.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataflowEvent {
    pub action: String,
    pub recipe_run_id: i64,
    pub conclusion: RecipeRunConclusion,
}
