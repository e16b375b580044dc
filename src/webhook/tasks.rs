//! Background tasks spawned from webhook deliveries
//!
//! Each task talks to GitHub as the app installation covering the
//! repository, drives recipe run rows through
//! `queued -> in_progress -> completed`, and reports back through check
//! runs and PR comments. Failures are logged; the delivery has already
//! been acknowledged by the time a task runs.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{error, info, info_span, warn, Instrument};

use super::store::{self, NewRecipeRun};
use super::{usage_comment, Action, BackgroundTask};
use crate::config::{BakeryRegistry, Settings};
use crate::db::Database;
use crate::github::{
    CheckRunUpdate, GitHubApp, InstallationClient, NewCheckRun, PullRequestFile,
};
use crate::models::{
    Bakery, DataflowEvent, Feedstock, IssueCommentEvent, PullRequest,
    PullRequestEvent, RecipeRun, RecipeRunConclusion, RecipeRunStatus, RunMessage,
};
use crate::observability::Metrics;
use crate::runner::{job_name_for, BakeOutcome, BakeRequest, RecipeRunner};

/// Check run created while `meta.yaml` is parsed
pub const SYNC_CHECK_NAME: &str = "Parse meta.yaml";

/// Recipes bake to zarr stores unless a run says otherwise
const DATASET_TYPE: &str = "zarr";

/// Everything a task needs, cloned out of the application state
#[derive(Clone)]
pub struct TaskContext {
    pub db: Database,
    pub github: Arc<GitHubApp>,
    pub runner: Arc<dyn RecipeRunner>,
    pub bakeries: Arc<BakeryRegistry>,
    pub settings: Arc<Settings>,
    pub metrics: Arc<Metrics>,
}

impl TaskContext {
    fn repo_url(&self, full_name: &str) -> String {
        format!(
            "{}/{}",
            self.settings.github_app.html_url.trim_end_matches('/'),
            full_name
        )
    }

    fn is_staged_recipes(&self, full_name: &str) -> bool {
        full_name == self.settings.github_app.staged_recipes_repo
    }

    fn run_url(&self, recipe_run_id: i64) -> String {
        format!(
            "{}/recipe_runs/{}",
            self.settings.server.public_url.trim_end_matches('/'),
            recipe_run_id
        )
    }
}

/// Spawn `action` and describe it for the acknowledgement
pub fn spawn(ctx: TaskContext, action: Action) -> Vec<BackgroundTask> {
    if matches!(action, Action::Ignore) {
        return Vec::new();
    }

    let task = action.background_task();
    let name = task.as_ref().map(|t| t.task).unwrap_or("comment_usage");
    ctx.metrics.background_tasks_spawned.inc();

    tokio::spawn(
        async move {
            if let Err(e) = run(ctx, action).await {
                let text = format!("{e:#}");
                error!(error = %text, "Background task failed");
            }
        }
        .instrument(info_span!("background_task", task = name)),
    );

    task.into_iter().collect()
}

/// Run `action` to completion
pub async fn run(ctx: TaskContext, action: Action) -> Result<()> {
    match action {
        Action::Synchronize(event) => synchronize(&ctx, &event).await,
        Action::CreateFeedstockRepo(event) => create_feedstock_repo(&ctx, &event).await,
        Action::DeployProdRun(event) => deploy_prod_run(&ctx, &event).await,
        Action::RunRecipeTest { event, recipe_id } => {
            run_recipe_test(&ctx, &event, &recipe_id).await
        }
        Action::CommentUsage { event, reason } => {
            let repo = &event.repository.full_name;
            let client = ctx.github.for_repo(repo).await?;
            client
                .create_issue_comment(repo, event.issue.number, &usage_comment(&reason))
                .await?;
            Ok(())
        }
        Action::HandleDataflowEvent(event) => handle_dataflow_event(&ctx, &event).await,
        Action::Ignore => Ok(()),
    }
}

/// `recipes/<name>` directory a staged-recipes PR touches
pub fn recipe_dir(files: &[PullRequestFile]) -> Result<String> {
    let mut names: Vec<&str> = files
        .iter()
        .filter_map(|f| f.filename.strip_prefix("recipes/"))
        .filter_map(|rest| rest.split_once('/').map(|(name, _)| name))
        .collect();
    names.sort_unstable();
    names.dedup();

    match names.as_slice() {
        [name] => Ok(format!("recipes/{name}")),
        [] => bail!("this PR does not add a recipe under recipes/"),
        _ => bail!(
            "this PR touches more than one recipe directory: {}",
            names.join(", ")
        ),
    }
}

fn short_sha(sha: &str) -> &str {
    &sha[..sha.len().min(7)]
}

/// Repository holding the PR's code; the base when the fork is gone
fn head_repo(event: &PullRequestEvent) -> &str {
    event
        .pull_request
        .head
        .repo
        .as_ref()
        .map(|r| r.full_name.as_str())
        .unwrap_or(&event.repository.full_name)
}

/// Feedstock spec recipe runs from a PR on `repo` are recorded under
fn feedstock_spec_for(ctx: &TaskContext, repo: &str) -> String {
    if ctx.is_staged_recipes(repo) {
        ctx.settings.github_app.staged_recipes_repo.clone()
    } else {
        repo.to_string()
    }
}

async fn feedstock_subdir(
    ctx: &TaskContext,
    client: &InstallationClient,
    repo: &str,
    pr_number: i64,
) -> Result<Option<String>> {
    if !ctx.is_staged_recipes(repo) {
        return Ok(None);
    }
    let files = client.list_pr_files(repo, pr_number).await?;
    recipe_dir(&files).map(Some)
}

/// Parse `meta.yaml` at the PR head and queue one test run per recipe
pub async fn synchronize(ctx: &TaskContext, event: &PullRequestEvent) -> Result<()> {
    let repo = &event.repository.full_name;
    let pr = &event.pull_request;
    let client = ctx.github.for_repo(repo).await?;

    let check_run = client
        .create_check_run(
            repo,
            &NewCheckRun::in_progress(SYNC_CHECK_NAME, &pr.head.sha, Some(pr.html_url.clone())),
        )
        .await?;

    match queue_test_runs(ctx, &client, event).await {
        Ok((bakery, runs)) => {
            let summary = runs_table(&runs);
            client
                .update_check_run(
                    repo,
                    check_run.id,
                    &CheckRunUpdate::completed("success", "meta.yaml parsed", &summary),
                )
                .await?;

            if !runs.is_empty() {
                let body = format!(
                    "I've queued test runs on `{}` for commit {}:\n\n{}\n\
                     Comment `/run <recipe_id>` to start one of them.",
                    bakery.name,
                    short_sha(&pr.head.sha),
                    summary
                );
                client.create_issue_comment(repo, event.number, &body).await?;
            }
            info!(pr = event.number, queued = runs.len(), "Synchronized pull request");
            Ok(())
        }
        Err(e) => {
            let text = format!("{e:#}");
            warn!(pr = event.number, error = %text, "Synchronize failed");
            client
                .update_check_run(
                    repo,
                    check_run.id,
                    &CheckRunUpdate::completed("failure", "meta.yaml could not be parsed", &text),
                )
                .await?;
            Ok(())
        }
    }
}

async fn queue_test_runs(
    ctx: &TaskContext,
    client: &InstallationClient,
    event: &PullRequestEvent,
) -> Result<(Bakery, Vec<RecipeRun>)> {
    let repo = &event.repository.full_name;
    let pr = &event.pull_request;
    let pool = ctx.db.pool();

    let subdir = feedstock_subdir(ctx, client, repo, event.number).await?;
    let feedstock = store::ensure_feedstock(pool, &feedstock_spec_for(ctx, repo)).await?;

    let meta = ctx
        .runner
        .expand_meta(&ctx.repo_url(head_repo(event)), &pr.head.sha, subdir.as_deref())
        .await?;
    let recipe_ids = meta.recipe_ids()?;
    let bakery = ensure_bakery(ctx, &meta.bakery.id).await?;

    let existing = store::recipe_ids_with_runs(pool, feedstock.id, &pr.head.sha, true).await?;
    let message = RunMessage {
        pr_number: Some(event.number),
        ..Default::default()
    }
    .to_json();

    let mut runs = Vec::new();
    for recipe_id in recipe_ids {
        if existing.iter().any(|id| id == recipe_id) {
            continue;
        }
        let run = store::insert_queued_run(
            pool,
            &NewRecipeRun {
                recipe_id,
                bakery_id: bakery.id,
                feedstock_id: feedstock.id,
                head_sha: &pr.head.sha,
                version: "",
                is_test: true,
                dataset_type: Some(DATASET_TYPE),
                message: Some(message.clone()),
            },
        )
        .await?;
        ctx.metrics.recipe_runs_created.inc();
        runs.push(run);
    }
    Ok((bakery, runs))
}

async fn ensure_bakery(ctx: &TaskContext, name: &str) -> Result<Bakery> {
    let config = ctx
        .bakeries
        .get(name)
        .ok_or_else(|| anyhow!("bakery '{name}' is not configured on this deployment"))?;
    Ok(store::ensure_bakery(ctx.db.pool(), name, &config.region, &config.description).await?)
}

fn runs_table(runs: &[RecipeRun]) -> String {
    if runs.is_empty() {
        return "No new recipe runs were queued.".to_string();
    }
    let mut table = String::from("| Recipe | Recipe run |\n|---|---|\n");
    for run in runs {
        table.push_str(&format!("| `{}` | {} |\n", run.recipe_id, run.id));
    }
    table
}

/// Submit `run` to its bakery
async fn submit(
    ctx: &TaskContext,
    run: &RecipeRun,
    bakery: &Bakery,
    repo_url: String,
    feedstock_subdir: Option<String>,
    job_name: &str,
) -> Result<BakeOutcome> {
    let config = ctx
        .bakeries
        .get(&bakery.name)
        .ok_or_else(|| anyhow!("bakery '{}' is not configured on this deployment", bakery.name))?;

    let request = BakeRequest {
        repo_url,
        git_ref: run.head_sha.clone(),
        feedstock_subdir,
        recipe_id: run.recipe_id.clone(),
        job_name: job_name.to_string(),
        config: config.runner_config(&run.recipe_id, job_name, run.is_test),
    };
    Ok(ctx.runner.bake(&request).await?)
}

/// Record a submission failure on the run
async fn fail_run(ctx: &TaskContext, run_id: i64, mut message: RunMessage, error: &str) -> Result<()> {
    message.error = Some(error.to_string());
    store::complete_run(
        ctx.db.pool(),
        run_id,
        RecipeRunConclusion::Failure,
        Some(&message.to_json()),
        None,
    )
    .await?;
    ctx.metrics.recipe_runs_failed.inc();
    Ok(())
}

async fn load_bakery_and_feedstock(ctx: &TaskContext, run: &RecipeRun) -> Result<(Bakery, Feedstock)> {
    let pool = ctx.db.pool();
    let bakery = store::get_bakery(pool, run.bakery_id)
        .await?
        .with_context(|| format!("bakery {} of recipe run {} not found", run.bakery_id, run.id))?;
    let feedstock = store::get_feedstock(pool, run.feedstock_id)
        .await?
        .with_context(|| {
            format!("feedstock {} of recipe run {} not found", run.feedstock_id, run.id)
        })?;
    Ok((bakery, feedstock))
}

/// Start the test run a `/run <recipe_id>` comment asked for
pub async fn run_recipe_test(
    ctx: &TaskContext,
    event: &IssueCommentEvent,
    recipe_id: &str,
) -> Result<()> {
    let repo = &event.repository.full_name;
    let number = event.issue.number;
    let pool = ctx.db.pool();
    let client = ctx.github.for_repo(repo).await?;

    if let Err(e) = client
        .create_comment_reaction(repo, event.comment.id, "+1")
        .await
    {
        warn!(error = %e, "Failed to react to /run comment");
    }

    let pr = client.get_pull_request(repo, number).await?;
    let head_sha = &pr.head.sha;

    let latest = match store::find_feedstock(pool, &feedstock_spec_for(ctx, repo)).await? {
        Some(feedstock) => store::latest_test_run(pool, feedstock.id, head_sha, recipe_id).await?,
        None => None,
    };

    let run = match latest {
        None => {
            let body = format!(
                "There is no recipe run for `{recipe_id}` at commit {}. \
                 Check the recipe ids in `meta.yaml`; the `{SYNC_CHECK_NAME}` check \
                 lists the runs queued for this commit.",
                short_sha(head_sha)
            );
            client.create_issue_comment(repo, number, &body).await?;
            return Ok(());
        }
        Some(run) => match run.status() {
            Some(RecipeRunStatus::Queued) => run,
            Some(RecipeRunStatus::Completed) => {
                // A completed test can be re-run; it gets a fresh row
                let requeued = store::insert_queued_run(
                    pool,
                    &NewRecipeRun {
                        recipe_id: &run.recipe_id,
                        bakery_id: run.bakery_id,
                        feedstock_id: run.feedstock_id,
                        head_sha: &run.head_sha,
                        version: &run.version,
                        is_test: true,
                        dataset_type: run.dataset_type.as_deref(),
                        message: None,
                    },
                )
                .await?;
                ctx.metrics.recipe_runs_created.inc();
                requeued
            }
            _ => {
                let body = format!(
                    "Recipe run {} for `{recipe_id}` is already in progress.",
                    run.id
                );
                client.create_issue_comment(repo, number, &body).await?;
                return Ok(());
            }
        },
    };

    start_test_run(ctx, &client, repo, &pr, run).await
}

async fn start_test_run(
    ctx: &TaskContext,
    client: &InstallationClient,
    repo: &str,
    pr: &PullRequest,
    run: RecipeRun,
) -> Result<()> {
    let (bakery, feedstock) = load_bakery_and_feedstock(ctx, &run).await?;
    let job_name = job_name_for(&feedstock.spec, &run.head_sha, run.id);

    let mut message = RunMessage {
        pr_number: Some(pr.number),
        job_name: Some(job_name.clone()),
        ..Default::default()
    };
    let Some(run) = store::mark_in_progress(ctx.db.pool(), run.id, &message.to_json()).await? else {
        info!(recipe_run_id = run.id, "Recipe run was started concurrently");
        return Ok(());
    };

    // Only the caller that moved the run to in_progress owns its check run
    let check_run = match client
        .create_check_run(
            repo,
            &NewCheckRun::in_progress(
                &format!("Test run: {}", run.recipe_id),
                &run.head_sha,
                Some(ctx.run_url(run.id)),
            ),
        )
        .await
    {
        Ok(check_run) => check_run,
        Err(e) => {
            fail_run(ctx, run.id, message, &format!("failed to create check run: {e}")).await?;
            return Err(e).with_context(|| format!("creating check run for recipe run {}", run.id));
        }
    };
    message.check_run_id = Some(check_run.id);
    store::set_message(ctx.db.pool(), run.id, &message.to_json()).await?;

    let code_repo = pr
        .head
        .repo
        .as_ref()
        .map(|r| r.full_name.clone())
        .unwrap_or_else(|| repo.to_string());
    let subdir = feedstock_subdir(ctx, client, repo, pr.number).await;

    let outcome = match subdir {
        Ok(subdir) => submit(ctx, &run, &bakery, ctx.repo_url(&code_repo), subdir, &job_name).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(outcome) => {
            message.job_name = Some(outcome.job_name.clone());
            message.job_id = Some(outcome.job_id.clone());
            store::set_message(ctx.db.pool(), run.id, &message.to_json()).await?;
            ctx.metrics.recipe_runs_submitted.inc();
            info!(recipe_run_id = run.id, job_id = %outcome.job_id, "Test run submitted");

            let body = format!(
                "Test run {} of `{}` was submitted to `{}` as job `{}` (`{}`).",
                run.id, run.recipe_id, bakery.name, outcome.job_name, outcome.job_id
            );
            client.create_issue_comment(repo, pr.number, &body).await?;
        }
        Err(e) => {
            let text = format!("{e:#}");
            warn!(recipe_run_id = run.id, error = %text, "Test run submission failed");
            fail_run(ctx, run.id, message, &text).await?;
            client
                .update_check_run(
                    repo,
                    check_run.id,
                    &CheckRunUpdate::completed("failure", "Submission failed", &text),
                )
                .await?;
            let body = format!(
                "Test run {} of `{}` could not be submitted:\n\n```\n{}\n```",
                run.id, run.recipe_id, text
            );
            client.create_issue_comment(repo, pr.number, &body).await?;
        }
    }
    Ok(())
}

/// Record a finished Dataflow job and report it
pub async fn handle_dataflow_event(ctx: &TaskContext, event: &DataflowEvent) -> Result<()> {
    let pool = ctx.db.pool();
    let Some(run) = store::get_run(pool, event.recipe_run_id).await? else {
        warn!(recipe_run_id = event.recipe_run_id, "Dataflow event for unknown recipe run");
        return Ok(());
    };
    if run.status() != Some(RecipeRunStatus::InProgress) {
        info!(
            recipe_run_id = run.id,
            status = %run.status,
            "Ignoring dataflow event for recipe run that is not in progress"
        );
        return Ok(());
    }

    let (bakery, feedstock) = load_bakery_and_feedstock(ctx, &run).await?;
    let message = run.run_message();
    let success = event.conclusion == RecipeRunConclusion::Success;

    let dataset_public_url = if success {
        message.job_name.as_deref().and_then(|job_name| {
            ctx.bakeries
                .get(&bakery.name)
                .and_then(|config| config.dataset_public_url(job_name, &run.recipe_id))
        })
    } else {
        None
    };

    let Some(run) =
        store::finish_run(pool, run.id, event.conclusion, dataset_public_url.as_deref()).await?
    else {
        info!(recipe_run_id = event.recipe_run_id, "Recipe run completed concurrently");
        return Ok(());
    };

    if success {
        ctx.metrics.recipe_runs_completed.inc();
    } else {
        ctx.metrics.recipe_runs_failed.inc();
    }
    info!(recipe_run_id = run.id, conclusion = %event.conclusion, "Recipe run completed");

    if message.check_run_id.is_none() && !(run.is_test && message.pr_number.is_some()) {
        return Ok(());
    }

    let repo = &feedstock.spec;
    let client = ctx.github.for_repo(repo).await?;

    if let Some(check_run_id) = message.check_run_id {
        let summary = match dataset_public_url {
            Some(ref url) => format!("Dataset: {url}"),
            None => format!("Recipe run {} finished with {}", run.id, event.conclusion),
        };
        client
            .update_check_run(
                repo,
                check_run_id,
                &CheckRunUpdate::completed(
                    &event.conclusion.to_string(),
                    &format!("Recipe run {}", run.id),
                    &summary,
                ),
            )
            .await?;
    }

    if let (true, Some(pr_number)) = (run.is_test, message.pr_number) {
        let body = if success {
            let mut body = format!("Test run {} of `{}` succeeded.", run.id, run.recipe_id);
            if let Some(ref url) = dataset_public_url {
                body.push_str(&format!("\n\nThe dataset is available at {url}"));
            }
            body
        } else {
            format!(
                "Test run {} of `{}` finished with `{}`. See {} for details.",
                run.id,
                run.recipe_id,
                event.conclusion,
                ctx.run_url(run.id)
            )
        };
        client.create_issue_comment(repo, pr_number, &body).await?;
    }
    Ok(())
}

/// Bake every recipe of a merged feedstock PR for production
pub async fn deploy_prod_run(ctx: &TaskContext, event: &PullRequestEvent) -> Result<()> {
    let repo = &event.repository.full_name;
    let pr = &event.pull_request;
    let sha = pr
        .merge_commit_sha
        .as_deref()
        .context("merged pull request has no merge commit sha")?;
    let client = ctx.github.for_repo(repo).await?;

    let lines = match deploy_recipes(ctx, repo, sha).await {
        Ok(lines) => lines,
        Err(e) => {
            let text = format!("{e:#}");
            warn!(pr = event.number, error = %text, "Production deploy failed");
            let body = format!("Deployment of {} failed:\n\n```\n{}\n```", short_sha(sha), text);
            client.create_issue_comment(repo, event.number, &body).await?;
            return Ok(());
        }
    };

    let body = format!(
        "Deploying {} recipe(s) from {}:\n\n| Recipe | Recipe run | Status |\n|---|---|---|\n{}",
        lines.len(),
        short_sha(sha),
        lines.join("\n")
    );
    client.create_issue_comment(repo, event.number, &body).await?;
    Ok(())
}

async fn deploy_recipes(ctx: &TaskContext, repo: &str, sha: &str) -> Result<Vec<String>> {
    let pool = ctx.db.pool();
    let feedstock = store::ensure_feedstock(pool, repo).await?;
    let meta = ctx.runner.expand_meta(&ctx.repo_url(repo), sha, None).await?;
    let recipe_ids = meta.recipe_ids()?;
    let bakery = ensure_bakery(ctx, &meta.bakery.id).await?;
    let existing = store::recipe_ids_with_runs(pool, feedstock.id, sha, false).await?;

    let mut lines = Vec::new();
    for recipe_id in recipe_ids {
        if existing.iter().any(|id| id == recipe_id) {
            info!(recipe_id, sha, "Production run already exists");
            continue;
        }

        let run = store::insert_queued_run(
            pool,
            &NewRecipeRun {
                recipe_id,
                bakery_id: bakery.id,
                feedstock_id: feedstock.id,
                head_sha: sha,
                version: "",
                is_test: false,
                dataset_type: Some(DATASET_TYPE),
                message: None,
            },
        )
        .await?;
        ctx.metrics.recipe_runs_created.inc();

        let job_name = job_name_for(&feedstock.spec, sha, run.id);
        let mut message = RunMessage {
            job_name: Some(job_name.clone()),
            ..Default::default()
        };
        let Some(run) = store::mark_in_progress(pool, run.id, &message.to_json()).await? else {
            continue;
        };

        match submit(ctx, &run, &bakery, ctx.repo_url(repo), None, &job_name).await {
            Ok(outcome) => {
                message.job_name = Some(outcome.job_name);
                message.job_id = Some(outcome.job_id.clone());
                store::set_message(pool, run.id, &message.to_json()).await?;
                ctx.metrics.recipe_runs_submitted.inc();
                lines.push(format!(
                    "| `{}` | {} | submitted as `{}` |",
                    recipe_id, run.id, outcome.job_id
                ));
            }
            Err(e) => {
                let text = format!("{e:#}");
                warn!(recipe_run_id = run.id, error = %text, "Production run submission failed");
                fail_run(ctx, run.id, message, &text).await?;
                lines.push(format!("| `{}` | {} | failed: {} |", recipe_id, run.id, text.replace('\n', " ")));
            }
        }
    }
    Ok(lines)
}

/// Turn a merged staged-recipes PR into `{org}/{name}-feedstock`
pub async fn create_feedstock_repo(ctx: &TaskContext, event: &PullRequestEvent) -> Result<()> {
    let repo = &event.repository.full_name;
    let pr = &event.pull_request;
    let client = ctx.github.for_repo(repo).await?;

    let files = client.list_pr_files(repo, event.number).await?;
    let dir = recipe_dir(&files)?;
    let name = dir.trim_start_matches("recipes/");
    let git_ref = pr.merge_commit_sha.as_deref().unwrap_or(&pr.head.sha);

    let new_repo = client
        .create_org_repo(
            &ctx.settings.github_app.feedstock_org,
            &format!("{name}-feedstock"),
            &pr.title,
        )
        .await?;
    info!(repo = %new_repo.full_name, "Created feedstock repository");

    let prefix = format!("{dir}/");
    for file in files.iter().filter(|f| f.status != "removed") {
        let Some(relative) = file.filename.strip_prefix(&prefix) else {
            continue;
        };
        let content = client.get_file(repo, &file.filename, git_ref).await?;
        client
            .put_file(
                &new_repo.full_name,
                &format!("feedstock/{relative}"),
                &format!("Add {relative} from {repo}#{}", event.number),
                &content,
            )
            .await?;
    }

    store::ensure_feedstock(ctx.db.pool(), &new_repo.full_name).await?;

    let body = format!(
        "Thanks for the recipe! It now lives in its own feedstock: {}",
        new_repo.html_url
    );
    client.create_issue_comment(repo, event.number, &body).await?;
    Ok(())
}
