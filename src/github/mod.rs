//! GitHub App client
//!
//! Authenticates as the app with an RS256 JWT, exchanges it for
//! per-installation access tokens, and wraps the handful of REST endpoints
//! the orchestrator uses (contents, pull requests, check runs, comments,
//! repository creation).

mod types;

pub use types::*;

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use prometheus::IntCounter;
use reqwest::{Client, Method, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::GitHubAppSettings;

const USER_AGENT: &str = concat!("pangeo-forge-orchestrator/", env!("CARGO_PKG_VERSION"));
const ACCEPT: &str = "application/vnd.github+json";

/// App JWTs are backdated to absorb clock drift and live for ten minutes
const JWT_BACKDATE_SECS: i64 = 60;
const JWT_LIFETIME_SECS: i64 = 600;

/// GitHub lists at most 3000 files of a PR, 100 per page
const PR_FILES_PER_PAGE: usize = 100;
const PR_FILES_MAX_PAGES: usize = 30;

/// GitHub client errors
#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("GitHub API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to sign app JWT: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("GitHub App is not configured: {0}")]
    NotConfigured(String),

    #[error("Unexpected response: {0}")]
    Decode(String),
}

pub type GitHubResult<T> = Result<T, GitHubError>;

#[derive(Debug, Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

fn build_http_client() -> GitHubResult<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .user_agent(USER_AGENT)
        .build()?)
}

async fn send_json<T: DeserializeOwned>(
    request: RequestBuilder,
    counter: Option<&IntCounter>,
) -> GitHubResult<T> {
    if let Some(counter) = counter {
        counter.inc();
    }
    let response = request.header("Accept", ACCEPT).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let message = body
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("no message")
            .to_string();
        return Err(GitHubError::Api {
            status: status.as_u16(),
            message,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| GitHubError::Decode(e.to_string()))
}

/// Client authenticated as the GitHub App itself
#[derive(Clone)]
pub struct GitHubApp {
    http: Client,
    api_url: String,
    app_id: String,
    key: Option<EncodingKey>,
    requests: Option<IntCounter>,
}

impl GitHubApp {
    pub fn new(settings: &GitHubAppSettings) -> GitHubResult<Self> {
        let key = match settings.private_key {
            Some(ref pem) => Some(EncodingKey::from_rsa_pem(pem.as_bytes())?),
            None => None,
        };

        Ok(Self {
            http: build_http_client()?,
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            app_id: settings.app_id.clone(),
            key,
            requests: None,
        })
    }

    /// Count every outgoing request on `counter`
    pub fn with_request_counter(mut self, counter: IntCounter) -> Self {
        self.requests = Some(counter);
        self
    }

    /// Sign a short-lived JWT identifying the app
    pub fn app_jwt(&self) -> GitHubResult<String> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| GitHubError::NotConfigured("no private key".to_string()))?;
        if self.app_id.is_empty() {
            return Err(GitHubError::NotConfigured("no app id".to_string()));
        }

        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - JWT_BACKDATE_SECS,
            exp: now + JWT_LIFETIME_SECS,
            iss: self.app_id.clone(),
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            key,
        )?)
    }

    /// Installation id of the app on `repo` (`owner/name`)
    #[instrument(skip(self))]
    pub async fn installation_id(&self, repo: &str) -> GitHubResult<i64> {
        let jwt = self.app_jwt()?;
        let installation: Installation = send_json(
            self.http
                .get(format!("{}/repos/{}/installation", self.api_url, repo))
                .bearer_auth(jwt),
            self.requests.as_ref(),
        )
        .await?;
        Ok(installation.id)
    }

    /// Exchange the app JWT for an installation access token
    #[instrument(skip(self))]
    pub async fn installation_token(&self, installation_id: i64) -> GitHubResult<String> {
        let jwt = self.app_jwt()?;
        let token: AccessToken = send_json(
            self.http
                .post(format!(
                    "{}/app/installations/{}/access_tokens",
                    self.api_url, installation_id
                ))
                .bearer_auth(jwt),
            self.requests.as_ref(),
        )
        .await?;
        Ok(token.token)
    }

    /// Client acting as the installation that covers `repo`
    pub async fn for_repo(&self, repo: &str) -> GitHubResult<InstallationClient> {
        let installation_id = self.installation_id(repo).await?;
        let token = self.installation_token(installation_id).await?;
        debug!(repo, installation_id, "Obtained installation token");
        Ok(InstallationClient {
            http: self.http.clone(),
            api_url: self.api_url.clone(),
            token,
            requests: self.requests.clone(),
        })
    }
}

/// Client authenticated with an installation access token
#[derive(Clone)]
pub struct InstallationClient {
    http: Client,
    api_url: String,
    token: String,
    requests: Option<IntCounter>,
}

impl InstallationClient {
    /// Build a client from an already issued token
    pub fn with_token(api_url: &str, token: &str) -> GitHubResult<Self> {
        Ok(Self {
            http: build_http_client()?,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            requests: None,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_url, path))
            .bearer_auth(&self.token)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> GitHubResult<T> {
        send_json(request, self.requests.as_ref()).await
    }

    /// Text of `path` at `git_ref`
    pub async fn get_file(&self, repo: &str, path: &str, git_ref: &str) -> GitHubResult<String> {
        let content: FileContent = self
            .send(
                self.request(Method::GET, &format!("/repos/{repo}/contents/{path}"))
                    .query(&[("ref", git_ref)]),
            )
            .await?;
        content.decode()
    }

    pub async fn get_pull_request(
        &self,
        repo: &str,
        number: i64,
    ) -> GitHubResult<crate::models::PullRequest> {
        self.send(self.request(Method::GET, &format!("/repos/{repo}/pulls/{number}")))
            .await
    }

    /// Every file a PR touches, following pages until a short one
    pub async fn list_pr_files(&self, repo: &str, number: i64) -> GitHubResult<Vec<PullRequestFile>> {
        let path = format!("/repos/{repo}/pulls/{number}/files");
        let mut files = Vec::new();
        for page in 1..=PR_FILES_MAX_PAGES {
            let batch: Vec<PullRequestFile> = self
                .send(
                    self.request(Method::GET, &path)
                        .query(&[("per_page", PR_FILES_PER_PAGE), ("page", page)]),
                )
                .await?;
            let done = batch.len() < PR_FILES_PER_PAGE;
            files.extend(batch);
            if done {
                break;
            }
        }
        Ok(files)
    }

    pub async fn create_check_run(&self, repo: &str, check_run: &NewCheckRun) -> GitHubResult<CheckRun> {
        self.send(
            self.request(Method::POST, &format!("/repos/{repo}/check-runs"))
                .json(check_run),
        )
        .await
    }

    pub async fn update_check_run(
        &self,
        repo: &str,
        check_run_id: i64,
        update: &CheckRunUpdate,
    ) -> GitHubResult<CheckRun> {
        self.send(
            self.request(
                Method::PATCH,
                &format!("/repos/{repo}/check-runs/{check_run_id}"),
            )
            .json(update),
        )
        .await
    }

    pub async fn create_issue_comment(
        &self,
        repo: &str,
        number: i64,
        body: &str,
    ) -> GitHubResult<IssueCommentCreated> {
        self.send(
            self.request(Method::POST, &format!("/repos/{repo}/issues/{number}/comments"))
                .json(&serde_json::json!({ "body": body })),
        )
        .await
    }

    /// React to an issue comment (`+1`, `eyes`, `rocket`, ...)
    pub async fn create_comment_reaction(
        &self,
        repo: &str,
        comment_id: i64,
        content: &str,
    ) -> GitHubResult<Reaction> {
        self.send(
            self.request(
                Method::POST,
                &format!("/repos/{repo}/issues/comments/{comment_id}/reactions"),
            )
            .json(&serde_json::json!({ "content": content })),
        )
        .await
    }

    pub async fn create_org_repo(
        &self,
        org: &str,
        name: &str,
        description: &str,
    ) -> GitHubResult<crate::models::GitHubRepository> {
        self.send(
            self.request(Method::POST, &format!("/orgs/{org}/repos"))
                .json(&serde_json::json!({
                    "name": name,
                    "description": description,
                    "auto_init": true,
                })),
        )
        .await
    }

    /// Create or replace a file with a single commit
    pub async fn put_file(
        &self,
        repo: &str,
        path: &str,
        message: &str,
        content: &str,
    ) -> GitHubResult<serde_json::Value> {
        self.send(
            self.request(Method::PUT, &format!("/repos/{repo}/contents/{path}"))
                .json(&serde_json::json!({
                    "message": message,
                    "content": BASE64.encode(content.as_bytes()),
                })),
        )
        .await
    }
}
