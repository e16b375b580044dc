//! Webhook task flows against a real database and a mocked GitHub API
//!
//! Deliveries are routed with `route_event` and their tasks awaited
//! directly, so every GitHub call has happened by the time we assert.

mod common;

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use httpmock::prelude::*;
use httpmock::Method::PATCH;
use serde_json::{json, Value};

use common::{
    fixtures, hook_request, mock_installation, send, test_settings, test_state, FakeRunner,
    TestDatabase, HEAD_SHA, MERGE_SHA, META_YAML, WEBHOOK_SECRET,
};
use pangeo_forge_orchestrator::api::{self, AppState};
use pangeo_forge_orchestrator::models::RecipeRun;
use pangeo_forge_orchestrator::runner::job_name_for;
use pangeo_forge_orchestrator::webhook::{route_event, tasks};

const FEEDSTOCK: &str = "pangeo-forge/gpcp-feedstock";
const FORK: &str = "contrib/gpcp-feedstock";
const STAGED_RECIPES: &str = "pangeo-forge/staged-recipes";

async fn deliver(state: &AppState, event: &str, payload: &Value) {
    let action = route_event(event, payload.to_string().as_bytes(), &state.settings.github_app)
        .expect("payload routes");
    tasks::run(state.task_context(), action)
        .await
        .expect("task succeeds");
}

async fn runs(db: &TestDatabase) -> Vec<RecipeRun> {
    sqlx::query_as::<_, RecipeRun>("SELECT * FROM recipe_runs ORDER BY id")
        .fetch_all(db.pool())
        .await
        .unwrap()
}

/// Check runs, comments and the PR lookup for `FEEDSTOCK` PR 5
///
/// Returns the mock creating the "Test run: gpcp" check run.
async fn mock_feedstock_pr(server: &MockServer) -> httpmock::Mock<'_> {
    mock_installation(server).await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path(format!("/repos/{FEEDSTOCK}/check-runs"))
                .json_body_partial(r#"{"name": "Parse meta.yaml"}"#);
            then.status(201).json_body(json!({"id": 11, "status": "in_progress"}));
        })
        .await;
    let test_check = server
        .mock_async(|when, then| {
            when.method(POST)
                .path(format!("/repos/{FEEDSTOCK}/check-runs"))
                .json_body_partial(r#"{"name": "Test run: gpcp"}"#);
            then.status(201).json_body(json!({"id": 21, "status": "in_progress"}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/repos/{FEEDSTOCK}/pulls/5"));
            then.status(200)
                .json_body(fixtures::pull_request(FEEDSTOCK, FORK, 5, HEAD_SHA));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path(format!("/repos/{FEEDSTOCK}/issues/comments/99/reactions"));
            then.status(201).json_body(json!({"id": 1, "content": "+1"}));
        })
        .await;
    test_check
}

async fn mock_comments<'a>(server: &'a MockServer, repo: &str, number: i64) -> httpmock::Mock<'a> {
    let path = format!("/repos/{repo}/issues/{number}/comments");
    server
        .mock_async(|when, then| {
            when.method(POST).path(path);
            then.status(201).json_body(json!({
                "id": 1000,
                "html_url": "https://github.com/comment"
            }));
        })
        .await
}

async fn mock_check_run_update<'a>(
    server: &'a MockServer,
    id: i64,
    conclusion: &str,
) -> httpmock::Mock<'a> {
    let body = json!({"status": "completed", "conclusion": conclusion}).to_string();
    let response = json!({"id": id, "status": "completed", "conclusion": conclusion});
    server
        .mock_async(|when, then| {
            when.method(PATCH)
                .path(format!("/repos/{FEEDSTOCK}/check-runs/{id}"))
                .json_body_partial(body);
            then.status(200).json_body(response);
        })
        .await
}

#[tokio::test]
async fn test_synchronize_queues_test_runs_once() {
    let db = TestDatabase::new().await;
    let server = MockServer::start_async().await;
    let _ = mock_feedstock_pr(&server).await;
    let parsed = mock_check_run_update(&server, 11, "success").await;
    let comments = mock_comments(&server, FEEDSTOCK, 5).await;

    let runner = Arc::new(FakeRunner::new());
    let state = test_state(db.database(), test_settings(&server.base_url()), runner.clone());
    let event = fixtures::pull_request_event("synchronize", FEEDSTOCK, FORK, 5);

    deliver(&state, "pull_request", &event).await;

    let queued = runs(&db).await;
    assert_eq!(queued.len(), 2);
    assert_eq!(
        queued.iter().map(|r| r.recipe_id.as_str()).collect::<Vec<_>>(),
        vec!["gpcp", "gpcp-monthly"]
    );
    for run in &queued {
        assert_eq!(run.status, "queued");
        assert!(run.is_test);
        assert_eq!(run.head_sha, HEAD_SHA);
        assert_eq!(run.dataset_type.as_deref(), Some("zarr"));
        assert_eq!(run.run_message().pr_number, Some(5));
    }
    assert_eq!(
        runner.expansions(),
        vec![(format!("https://github.com/{FORK}"), HEAD_SHA.to_string(), None)]
    );

    // Same head again: nothing new queued, no second comment
    deliver(&state, "pull_request", &event).await;
    assert_eq!(runs(&db).await.len(), 2);
    assert_eq!(parsed.hits_async().await, 2);
    assert_eq!(comments.hits_async().await, 1);
    assert_eq!(state.metrics.recipe_runs_created.get(), 2);
}

#[tokio::test]
async fn test_synchronize_reports_unknown_bakery() {
    let db = TestDatabase::new().await;
    let server = MockServer::start_async().await;
    let _ = mock_feedstock_pr(&server).await;
    let failed = mock_check_run_update(&server, 11, "failure").await;

    let runner = Arc::new(FakeRunner::new().with_meta(
        "recipes:\n  - id: gpcp\nbakery:\n  id: somewhere-else\n",
    ));
    let state = test_state(db.database(), test_settings(&server.base_url()), runner);

    deliver(
        &state,
        "pull_request",
        &fixtures::pull_request_event("opened", FEEDSTOCK, FORK, 5),
    )
    .await;

    failed.assert_async().await;
    assert!(runs(&db).await.is_empty());
}

#[tokio::test]
async fn test_synchronize_staged_recipes_uses_recipe_dir() {
    let db = TestDatabase::new().await;
    let server = MockServer::start_async().await;
    mock_installation(&server).await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("/repos/{STAGED_RECIPES}/pulls/3/files"));
            then.status(200).json_body(json!([
                {"filename": "recipes/gpcp/meta.yaml", "status": "added"},
                {"filename": "recipes/gpcp/recipe.py", "status": "added"}
            ]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path(format!("/repos/{STAGED_RECIPES}/check-runs"));
            then.status(201).json_body(json!({"id": 31, "status": "in_progress"}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(PATCH)
                .path(format!("/repos/{STAGED_RECIPES}/check-runs/31"));
            then.status(200)
                .json_body(json!({"id": 31, "status": "completed", "conclusion": "success"}));
        })
        .await;
    mock_comments(&server, STAGED_RECIPES, 3).await;

    let runner = Arc::new(FakeRunner::new());
    let state = test_state(db.database(), test_settings(&server.base_url()), runner.clone());

    deliver(
        &state,
        "pull_request",
        &fixtures::pull_request_event("opened", STAGED_RECIPES, "contrib/staged-recipes", 3),
    )
    .await;

    let (_, _, subdir) = runner.expansions().remove(0);
    assert_eq!(subdir.as_deref(), Some("recipes/gpcp"));

    let (spec,): (String,) = sqlx::query_as(
        "SELECT f.spec FROM recipe_runs r JOIN feedstocks f ON f.id = r.feedstock_id LIMIT 1",
    )
    .fetch_one(db.pool())
    .await
    .unwrap();
    assert_eq!(spec, STAGED_RECIPES);
}

#[tokio::test]
async fn test_run_command_submits_and_dataflow_completes() {
    let db = TestDatabase::new().await;
    let server = MockServer::start_async().await;
    let _ = mock_feedstock_pr(&server).await;
    mock_check_run_update(&server, 11, "success").await;
    let test_check = mock_check_run_update(&server, 21, "success").await;
    let comments = mock_comments(&server, FEEDSTOCK, 5).await;

    let runner = Arc::new(FakeRunner::new());
    let state = test_state(db.database(), test_settings(&server.base_url()), runner.clone());

    deliver(
        &state,
        "pull_request",
        &fixtures::pull_request_event("opened", FEEDSTOCK, FORK, 5),
    )
    .await;
    deliver(
        &state,
        "issue_comment",
        &fixtures::comment_event(FEEDSTOCK, 5, "/run gpcp", "MEMBER"),
    )
    .await;

    let run = runs(&db).await.remove(0);
    let job_name = job_name_for(FEEDSTOCK, HEAD_SHA, run.id);
    assert_eq!(run.recipe_id, "gpcp");
    assert_eq!(run.status, "in_progress");
    let message = run.run_message();
    assert_eq!(message.check_run_id, Some(21));
    assert_eq!(message.job_id.as_deref(), Some("job-gpcp"));
    assert_eq!(message.job_name.as_deref(), Some(job_name.as_str()));

    let bakes = runner.bakes();
    assert_eq!(bakes.len(), 1);
    assert_eq!(bakes[0].repo_url, format!("https://github.com/{FORK}"));
    assert_eq!(bakes[0].git_ref, HEAD_SHA);
    assert_eq!(bakes[0].feedstock_subdir, None);
    assert_eq!(bakes[0].config["Bake"]["prune"], true);
    assert_eq!(bakes[0].config["Bake"]["job_name"], job_name.as_str());

    deliver(&state, "dataflow", &fixtures::dataflow_event(run.id, "success")).await;

    let done = runs(&db).await.remove(0);
    assert_eq!(done.status, "completed");
    assert_eq!(done.conclusion.as_deref(), Some("success"));
    assert!(done.completed_at.is_some());
    assert_eq!(
        done.dataset_public_url,
        Some(format!("https://data.example.org/output/{job_name}/gpcp.zarr"))
    );
    test_check.assert_async().await;

    // Repeated callback is a no-op
    deliver(&state, "dataflow", &fixtures::dataflow_event(run.id, "failure")).await;
    assert_eq!(runs(&db).await[0].conclusion.as_deref(), Some("success"));
    assert_eq!(test_check.hits_async().await, 1);

    // queued comment, submission comment, success comment
    assert_eq!(comments.hits_async().await, 3);
    assert_eq!(state.metrics.recipe_runs_submitted.get(), 1);
    assert_eq!(state.metrics.recipe_runs_completed.get(), 1);
}

#[tokio::test]
async fn test_run_command_after_completion_requeues() {
    let db = TestDatabase::new().await;
    let server = MockServer::start_async().await;
    let _ = mock_feedstock_pr(&server).await;
    mock_check_run_update(&server, 11, "success").await;
    mock_check_run_update(&server, 21, "success").await;
    mock_comments(&server, FEEDSTOCK, 5).await;

    let runner = Arc::new(FakeRunner::new());
    let state = test_state(db.database(), test_settings(&server.base_url()), runner.clone());
    let run_comment = fixtures::comment_event(FEEDSTOCK, 5, "/run gpcp", "OWNER");

    deliver(
        &state,
        "pull_request",
        &fixtures::pull_request_event("opened", FEEDSTOCK, FORK, 5),
    )
    .await;
    deliver(&state, "issue_comment", &run_comment).await;
    let first = runs(&db).await.remove(0);

    // Still running: no second submission
    deliver(&state, "issue_comment", &run_comment).await;
    assert_eq!(runner.bakes().len(), 1);

    deliver(&state, "dataflow", &fixtures::dataflow_event(first.id, "success")).await;
    deliver(&state, "issue_comment", &run_comment).await;

    let all = runs(&db).await;
    assert_eq!(all.len(), 3);
    let rerun = all.last().unwrap();
    assert_eq!(rerun.recipe_id, "gpcp");
    assert_eq!(rerun.status, "in_progress");
    assert_ne!(rerun.id, first.id);
    assert_eq!(runner.bakes().len(), 2);
}

#[tokio::test]
async fn test_failed_submission_completes_run_with_failure() {
    let db = TestDatabase::new().await;
    let server = MockServer::start_async().await;
    let _ = mock_feedstock_pr(&server).await;
    mock_check_run_update(&server, 11, "success").await;
    let failed_check = mock_check_run_update(&server, 21, "failure").await;
    mock_comments(&server, FEEDSTOCK, 5).await;

    let runner = Arc::new(FakeRunner::new().failing_bake());
    let state = test_state(db.database(), test_settings(&server.base_url()), runner);

    deliver(
        &state,
        "pull_request",
        &fixtures::pull_request_event("opened", FEEDSTOCK, FORK, 5),
    )
    .await;
    deliver(
        &state,
        "issue_comment",
        &fixtures::comment_event(FEEDSTOCK, 5, "/run gpcp", "COLLABORATOR"),
    )
    .await;

    let run = runs(&db).await.remove(0);
    assert_eq!(run.status, "completed");
    assert_eq!(run.conclusion.as_deref(), Some("failure"));
    assert!(run
        .run_message()
        .error
        .unwrap()
        .contains("Dataflow quota exceeded"));
    failed_check.assert_async().await;
    assert_eq!(state.metrics.recipe_runs_failed.get(), 1);
}

#[tokio::test]
async fn test_merged_feedstock_pr_deploys_production_runs() {
    let db = TestDatabase::new().await;
    let server = MockServer::start_async().await;
    mock_installation(&server).await;
    let comments = mock_comments(&server, FEEDSTOCK, 8).await;

    let runner = Arc::new(FakeRunner::new());
    let state = test_state(db.database(), test_settings(&server.base_url()), runner.clone());
    let event = fixtures::merged_event(FEEDSTOCK, 8);

    deliver(&state, "pull_request", &event).await;

    let deployed = runs(&db).await;
    assert_eq!(deployed.len(), 2);
    for run in &deployed {
        assert!(!run.is_test);
        assert_eq!(run.status, "in_progress");
        assert_eq!(run.head_sha, MERGE_SHA);
        assert_eq!(run.version, "");
        assert_eq!(
            run.run_message().job_id,
            Some(format!("job-{}", run.recipe_id))
        );
    }
    for bake in runner.bakes() {
        assert_eq!(bake.git_ref, MERGE_SHA);
        assert_eq!(bake.repo_url, format!("https://github.com/{FEEDSTOCK}"));
        assert_eq!(bake.config["Bake"]["prune"], false);
    }

    // Redelivery does not bake twice
    deliver(&state, "pull_request", &event).await;
    assert_eq!(runs(&db).await.len(), 2);
    assert_eq!(runner.bakes().len(), 2);
    assert_eq!(comments.hits_async().await, 2);
}

#[tokio::test]
async fn test_merged_staged_recipe_creates_feedstock_repo() {
    let db = TestDatabase::new().await;
    let server = MockServer::start_async().await;
    mock_installation(&server).await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("/repos/{STAGED_RECIPES}/pulls/3/files"));
            then.status(200).json_body(json!([
                {"filename": "recipes/gpcp/meta.yaml", "status": "added"},
                {"filename": "recipes/gpcp/recipe.py", "status": "added"},
                {"filename": "recipes/gpcp/old.py", "status": "removed"}
            ]));
        })
        .await;
    for (file, text) in [("meta.yaml", META_YAML), ("recipe.py", "recipe = None\n")] {
        let path = format!("/repos/{STAGED_RECIPES}/contents/recipes/gpcp/{file}");
        let content = BASE64.encode(text);
        server
            .mock_async(|when, then| {
                when.method(GET).path(path).query_param("ref", MERGE_SHA);
                then.status(200)
                    .json_body(json!({"encoding": "base64", "content": content}));
            })
            .await;
    }
    let create_repo = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/orgs/pangeo-forge/repos")
                .json_body_partial(r#"{"name": "gpcp-feedstock"}"#);
            then.status(201).json_body(json!({
                "id": 2,
                "name": "gpcp-feedstock",
                "full_name": FEEDSTOCK,
                "html_url": format!("https://github.com/{FEEDSTOCK}")
            }));
        })
        .await;
    let put_files = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path_contains(format!("/repos/{FEEDSTOCK}/contents/feedstock/"));
            then.status(201).json_body(json!({"content": {}}));
        })
        .await;
    let comments = mock_comments(&server, STAGED_RECIPES, 3).await;

    let state = test_state(
        db.database(),
        test_settings(&server.base_url()),
        Arc::new(FakeRunner::new()),
    );

    deliver(&state, "pull_request", &fixtures::merged_event(STAGED_RECIPES, 3)).await;

    create_repo.assert_async().await;
    assert_eq!(put_files.hits_async().await, 2);
    comments.assert_async().await;

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feedstocks WHERE spec = $1")
        .bind(FEEDSTOCK)
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_dataflow_event_for_queued_run_is_ignored() {
    let db = TestDatabase::new().await;
    let server = MockServer::start_async().await;
    let _ = mock_feedstock_pr(&server).await;
    mock_check_run_update(&server, 11, "success").await;
    mock_comments(&server, FEEDSTOCK, 5).await;

    let state = test_state(
        db.database(),
        test_settings(&server.base_url()),
        Arc::new(FakeRunner::new()),
    );
    deliver(
        &state,
        "pull_request",
        &fixtures::pull_request_event("synchronize", FEEDSTOCK, FORK, 5),
    )
    .await;
    let queued = runs(&db).await.remove(0);

    deliver(&state, "dataflow", &fixtures::dataflow_event(queued.id, "success")).await;

    let after = runs(&db).await.remove(0);
    assert_eq!(after.status, "queued");
    assert_eq!(after.conclusion, None);
    assert_eq!(after.completed_at, None);
    assert_eq!(state.metrics.recipe_runs_completed.get(), 0);
}

#[tokio::test]
async fn test_concurrent_run_commands_create_one_check_run() {
    let db = TestDatabase::new().await;
    let server = MockServer::start_async().await;
    let test_check = mock_feedstock_pr(&server).await;
    mock_check_run_update(&server, 11, "success").await;
    mock_comments(&server, FEEDSTOCK, 5).await;

    let runner = Arc::new(FakeRunner::new());
    let state = test_state(db.database(), test_settings(&server.base_url()), runner.clone());
    deliver(
        &state,
        "pull_request",
        &fixtures::pull_request_event("opened", FEEDSTOCK, FORK, 5),
    )
    .await;

    let run_comment = fixtures::comment_event(FEEDSTOCK, 5, "/run gpcp", "MEMBER");
    tokio::join!(
        deliver(&state, "issue_comment", &run_comment),
        deliver(&state, "issue_comment", &run_comment),
    );

    // Whichever delivery lost the queued -> in_progress move left GitHub alone
    assert_eq!(test_check.hits_async().await, 1);
    assert_eq!(runner.bakes().len(), 1);
    let run = runs(&db).await.remove(0);
    assert_eq!(run.status, "in_progress");
    assert_eq!(run.run_message().check_run_id, Some(21));
}

#[tokio::test]
async fn test_run_command_ignores_other_feedstocks() {
    let db = TestDatabase::new().await;
    let server = MockServer::start_async().await;
    let test_check = mock_feedstock_pr(&server).await;
    let comments = mock_comments(&server, FEEDSTOCK, 5).await;

    // A queued test run at the same commit, but in another feedstock
    let (other_run_id,): (i64,) = sqlx::query_as(
        r#"
        WITH b AS (
            INSERT INTO bakeries (region, name) VALUES ('us-central1', 'other-bakery')
            RETURNING id
        ), f AS (
            INSERT INTO feedstocks (spec) VALUES ('pangeo-forge/other-feedstock')
            RETURNING id
        )
        INSERT INTO recipe_runs (recipe_id, bakery_id, feedstock_id, head_sha, is_test)
        SELECT 'gpcp', b.id, f.id, $1, TRUE FROM b, f
        RETURNING id
        "#,
    )
    .bind(HEAD_SHA)
    .fetch_one(db.pool())
    .await
    .unwrap();

    let runner = Arc::new(FakeRunner::new());
    let state = test_state(db.database(), test_settings(&server.base_url()), runner.clone());
    deliver(
        &state,
        "issue_comment",
        &fixtures::comment_event(FEEDSTOCK, 5, "/run gpcp", "MEMBER"),
    )
    .await;

    assert_eq!(comments.hits_async().await, 1);
    assert_eq!(test_check.hits_async().await, 0);
    assert!(runner.bakes().is_empty());
    let other = runs(&db).await.remove(0);
    assert_eq!(other.id, other_run_id);
    assert_eq!(other.status, "queued");
}

#[tokio::test]
async fn test_dataflow_event_for_unknown_run_is_ignored() {
    let db = TestDatabase::new().await;
    let state = test_state(
        db.database(),
        test_settings("http://127.0.0.1:1"),
        Arc::new(FakeRunner::new()),
    );

    deliver(&state, "dataflow", &fixtures::dataflow_event(4242, "success")).await;
    assert!(runs(&db).await.is_empty());
}

#[tokio::test]
async fn test_hook_endpoint_runs_task_in_background() {
    let db = TestDatabase::new().await;
    let server = MockServer::start_async().await;
    let _ = mock_feedstock_pr(&server).await;
    mock_check_run_update(&server, 11, "success").await;
    mock_comments(&server, FEEDSTOCK, 5).await;

    let state = test_state(
        db.database(),
        test_settings(&server.base_url()),
        Arc::new(FakeRunner::new()),
    );
    let event = fixtures::pull_request_event("opened", FEEDSTOCK, FORK, 5);

    let (status, body) = send(
        api::router(state),
        hook_request("pull_request", &event, WEBHOOK_SECRET),
    )
    .await;
    assert_eq!(status, axum::http::StatusCode::ACCEPTED);
    assert_eq!(body["background_tasks"][0]["task"], "synchronize");
    assert_eq!(body["background_tasks"][0]["args"]["pr_number"], 5);

    // The task finishes after the response
    let mut queued = 0;
    for _ in 0..50 {
        queued = runs(&db).await.len();
        if queued == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(queued, 2);
}
