//! GitHub App webhook processing
//!
//! Deliveries are authenticated with the `X-Hub-Signature-256` HMAC, routed
//! by their `X-GitHub-Event` header to an [`Action`], and the action runs as
//! a background task (see [`tasks`]) after the delivery is acknowledged.

mod store;
pub mod tasks;

use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::json;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::GitHubAppSettings;
use crate::models::{
    is_valid_recipe_id, DataflowEvent, IssueCommentEvent, PullRequestEvent,
};

pub use tasks::TaskContext;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
pub const EVENT_HEADER: &str = "X-GitHub-Event";
pub const DELIVERY_HEADER: &str = "X-GitHub-Delivery";

/// Maximum webhook payload size (5MB)
pub const MAX_WEBHOOK_PAYLOAD_SIZE: usize = 5 * 1024 * 1024;

/// PRs carrying this label are not synchronized
pub const NO_SYNC_LABEL: &str = "no-sync";

/// Comment command that starts a test run
pub const RUN_COMMAND: &str = "/run";

#[derive(Debug, Error, PartialEq)]
pub enum SignatureError {
    #[error("Request does not include a GitHub hash signature header")]
    Missing,
    #[error("Request hash signature invalid")]
    Invalid,
}

/// `sha256=<hex>` HMAC of `body`, as GitHub sends it
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC key");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Check a delivery's signature header against the shared secret
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    signature: Option<&str>,
) -> Result<(), SignatureError> {
    let signature = signature.ok_or(SignatureError::Missing)?;
    if !signature.starts_with("sha256=") {
        return Err(SignatureError::Invalid);
    }
    if !constant_time_compare(&sign(secret, body), signature) {
        return Err(SignatureError::Invalid);
    }
    Ok(())
}

/// Constant-time string comparison
///
/// Shorter input is zero padded so the loop length does not depend on
/// where the inputs differ.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;

    let len_eq = a.len() == b.len();
    let max_len = a.len().max(b.len());
    let a_bytes: Vec<u8> = a
        .bytes()
        .chain(std::iter::repeat(0u8))
        .take(max_len)
        .collect();
    let b_bytes: Vec<u8> = b
        .bytes()
        .chain(std::iter::repeat(0u8))
        .take(max_len)
        .collect();

    let bytes_eq = a_bytes.ct_eq(&b_bytes).into();
    len_eq && bytes_eq
}

/// Parse a `/run <recipe_id>` comment
///
/// Returns `None` when the comment is not a command at all, and
/// `Some(Err(reason))` when it is a malformed one.
pub fn parse_run_command(body: &str) -> Option<Result<String, String>> {
    let line = body.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut words = line.split_whitespace();
    if words.next() != Some(RUN_COMMAND) {
        return None;
    }

    let args: Vec<&str> = words.collect();
    Some(match args.as_slice() {
        [] => Err("no recipe id was given".to_string()),
        [recipe_id] if is_valid_recipe_id(recipe_id) => Ok(recipe_id.to_string()),
        [recipe_id] => Err(format!("`{recipe_id}` is not a valid recipe id")),
        _ => Err(format!("expected one recipe id, got {}", args.len())),
    })
}

/// Comment posted in reply to a malformed `/run` command
pub fn usage_comment(reason: &str) -> String {
    format!(
        "Sorry, I could not parse that command: {reason}.\n\n\
         Usage: `{RUN_COMMAND} <recipe_id>`, where `<recipe_id>` is one of the \
         recipe ids listed in this PR's `meta.yaml`."
    )
}

/// What a delivery asks the orchestrator to do
#[derive(Debug, Clone)]
pub enum Action {
    /// Parse `meta.yaml` of a PR head and queue test runs
    Synchronize(Box<PullRequestEvent>),
    /// Turn a merged staged-recipes PR into a feedstock repository
    CreateFeedstockRepo(Box<PullRequestEvent>),
    /// Bake every recipe of a merged feedstock PR
    DeployProdRun(Box<PullRequestEvent>),
    /// Start the queued test run requested by a `/run` comment
    RunRecipeTest {
        event: Box<IssueCommentEvent>,
        recipe_id: String,
    },
    /// Reply to a malformed `/run` comment
    CommentUsage {
        event: Box<IssueCommentEvent>,
        reason: String,
    },
    /// A Dataflow job finished
    HandleDataflowEvent(DataflowEvent),
    /// Acknowledge only
    Ignore,
}

/// Entry of the acknowledgement's `background_tasks`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackgroundTask {
    pub task: &'static str,
    pub args: serde_json::Value,
}

/// Body returned for every accepted delivery
#[derive(Debug, Serialize)]
pub struct HookResponse {
    pub status: &'static str,
    pub background_tasks: Vec<BackgroundTask>,
}

impl Action {
    /// Task listed in the acknowledgement, if any
    pub fn background_task(&self) -> Option<BackgroundTask> {
        let pr_args = |event: &PullRequestEvent| {
            json!({
                "repository": event.repository.full_name,
                "pr_number": event.number,
                "head_sha": event.pull_request.head.sha,
            })
        };

        match self {
            Action::Synchronize(event) => Some(BackgroundTask {
                task: "synchronize",
                args: pr_args(event),
            }),
            Action::CreateFeedstockRepo(event) => Some(BackgroundTask {
                task: "create_feedstock_repo",
                args: pr_args(event),
            }),
            Action::DeployProdRun(event) => Some(BackgroundTask {
                task: "deploy_prod_run",
                args: json!({
                    "repository": event.repository.full_name,
                    "pr_number": event.number,
                    "merge_commit_sha": event.pull_request.merge_commit_sha,
                }),
            }),
            Action::RunRecipeTest { event, recipe_id } => Some(BackgroundTask {
                task: "run_recipe_test",
                args: json!({
                    "repository": event.repository.full_name,
                    "pr_number": event.issue.number,
                    "recipe_id": recipe_id,
                }),
            }),
            Action::HandleDataflowEvent(event) => Some(BackgroundTask {
                task: "handle_dataflow_event",
                args: json!({
                    "recipe_run_id": event.recipe_run_id,
                    "conclusion": event.conclusion,
                }),
            }),
            Action::CommentUsage { .. } | Action::Ignore => None,
        }
    }
}

/// Decide what to do with a verified delivery
pub fn route_event(
    event: &str,
    body: &[u8],
    settings: &GitHubAppSettings,
) -> Result<Action, serde_json::Error> {
    match event {
        "pull_request" => {
            let payload: PullRequestEvent = serde_json::from_slice(body)?;
            Ok(route_pull_request(payload, settings))
        }
        "issue_comment" => {
            let payload: IssueCommentEvent = serde_json::from_slice(body)?;
            Ok(route_issue_comment(payload))
        }
        "dataflow" => {
            let payload: DataflowEvent = serde_json::from_slice(body)?;
            if payload.action == "completed" {
                Ok(Action::HandleDataflowEvent(payload))
            } else {
                debug!(action = %payload.action, "Ignoring dataflow action");
                Ok(Action::Ignore)
            }
        }
        "check_suite" | "check_run" | "ping" => Ok(Action::Ignore),
        other => {
            debug!(event = other, "No handler for event");
            Ok(Action::Ignore)
        }
    }
}

fn route_pull_request(event: PullRequestEvent, settings: &GitHubAppSettings) -> Action {
    let pr = &event.pull_request;
    match event.action.as_str() {
        "opened" | "reopened" | "synchronize" => {
            if pr.has_label(NO_SYNC_LABEL) {
                info!(pr = event.number, "Skipping synchronize for no-sync PR");
                Action::Ignore
            } else {
                Action::Synchronize(Box::new(event))
            }
        }
        "closed" if pr.is_merged() => {
            let base = pr.base_full_name().unwrap_or(&event.repository.full_name);
            if base == settings.staged_recipes_repo {
                Action::CreateFeedstockRepo(Box::new(event))
            } else if base.ends_with("-feedstock") {
                Action::DeployProdRun(Box::new(event))
            } else {
                Action::Ignore
            }
        }
        _ => Action::Ignore,
    }
}

fn route_issue_comment(event: IssueCommentEvent) -> Action {
    if event.action != "created" || event.issue.pull_request.is_none() {
        return Action::Ignore;
    }

    match parse_run_command(&event.comment.body) {
        None => Action::Ignore,
        Some(_) if !event.comment.author_can_run() => {
            info!(
                user = %event.comment.user.login,
                association = %event.comment.author_association,
                "Ignoring /run from a user without write access"
            );
            Action::Ignore
        }
        Some(Ok(recipe_id)) => Action::RunRecipeTest {
            event: Box::new(event),
            recipe_id,
        },
        Some(Err(reason)) => Action::CommentUsage {
            event: Box::new(event),
            reason,
        },
    }
}
