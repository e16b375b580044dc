//! Queries the webhook tasks run against the recipe run tables

use sqlx::PgPool;

use crate::models::{Bakery, Feedstock, RecipeRun, RecipeRunConclusion, GITHUB_PROVIDER};

/// Fields of a run about to be queued
#[derive(Debug, Clone)]
pub struct NewRecipeRun<'a> {
    pub recipe_id: &'a str,
    pub bakery_id: i64,
    pub feedstock_id: i64,
    pub head_sha: &'a str,
    pub version: &'a str,
    pub is_test: bool,
    pub dataset_type: Option<&'a str>,
    pub message: Option<String>,
}

/// Feedstock row for `spec`, inserted if missing
pub async fn ensure_feedstock(pool: &PgPool, spec: &str) -> Result<Feedstock, sqlx::Error> {
    // The no-op update makes RETURNING yield the existing row on conflict
    sqlx::query_as::<_, Feedstock>(
        r#"
        INSERT INTO feedstocks (spec, provider)
        VALUES ($1, $2)
        ON CONFLICT (spec) DO UPDATE SET spec = EXCLUDED.spec
        RETURNING *
        "#,
    )
    .bind(spec)
    .bind(GITHUB_PROVIDER)
    .fetch_one(pool)
    .await
}

/// Bakery row for `name`, inserted if missing
///
/// Region and description of an existing row are left alone.
pub async fn ensure_bakery(
    pool: &PgPool,
    name: &str,
    region: &str,
    description: &str,
) -> Result<Bakery, sqlx::Error> {
    sqlx::query_as::<_, Bakery>(
        r#"
        INSERT INTO bakeries (name, region, description)
        VALUES ($1, $2, $3)
        ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
        RETURNING *
        "#,
    )
    .bind(name)
    .bind(region)
    .bind(description)
    .fetch_one(pool)
    .await
}

pub async fn get_bakery(pool: &PgPool, id: i64) -> Result<Option<Bakery>, sqlx::Error> {
    sqlx::query_as::<_, Bakery>("SELECT * FROM bakeries WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_feedstock(pool: &PgPool, id: i64) -> Result<Option<Feedstock>, sqlx::Error> {
    sqlx::query_as::<_, Feedstock>("SELECT * FROM feedstocks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_run(pool: &PgPool, id: i64) -> Result<Option<RecipeRun>, sqlx::Error> {
    sqlx::query_as::<_, RecipeRun>("SELECT * FROM recipe_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Recipe ids that already have a run of the given kind at `head_sha`
pub async fn recipe_ids_with_runs(
    pool: &PgPool,
    feedstock_id: i64,
    head_sha: &str,
    is_test: bool,
) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT recipe_id FROM recipe_runs
        WHERE feedstock_id = $1 AND head_sha = $2 AND is_test = $3
        "#,
    )
    .bind(feedstock_id)
    .bind(head_sha)
    .bind(is_test)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn find_feedstock(pool: &PgPool, spec: &str) -> Result<Option<Feedstock>, sqlx::Error> {
    sqlx::query_as::<_, Feedstock>("SELECT * FROM feedstocks WHERE spec = $1")
        .bind(spec)
        .fetch_optional(pool)
        .await
}

/// Latest test run of `recipe_id` at `head_sha` in one feedstock
pub async fn latest_test_run(
    pool: &PgPool,
    feedstock_id: i64,
    head_sha: &str,
    recipe_id: &str,
) -> Result<Option<RecipeRun>, sqlx::Error> {
    sqlx::query_as::<_, RecipeRun>(
        r#"
        SELECT * FROM recipe_runs
        WHERE feedstock_id = $1 AND head_sha = $2 AND recipe_id = $3 AND is_test
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(feedstock_id)
    .bind(head_sha)
    .bind(recipe_id)
    .fetch_optional(pool)
    .await
}

pub async fn insert_queued_run(
    pool: &PgPool,
    run: &NewRecipeRun<'_>,
) -> Result<RecipeRun, sqlx::Error> {
    sqlx::query_as::<_, RecipeRun>(
        r#"
        INSERT INTO recipe_runs (
            recipe_id, bakery_id, feedstock_id, head_sha, version,
            started_at, status, is_test, dataset_type, message
        )
        VALUES ($1, $2, $3, $4, $5, NOW(), 'queued', $6, $7, $8)
        RETURNING *
        "#,
    )
    .bind(run.recipe_id)
    .bind(run.bakery_id)
    .bind(run.feedstock_id)
    .bind(run.head_sha)
    .bind(run.version)
    .bind(run.is_test)
    .bind(run.dataset_type)
    .bind(&run.message)
    .fetch_one(pool)
    .await
}

/// Move a queued run to `in_progress`; `None` if it was not queued
pub async fn mark_in_progress(
    pool: &PgPool,
    id: i64,
    message: &str,
) -> Result<Option<RecipeRun>, sqlx::Error> {
    sqlx::query_as::<_, RecipeRun>(
        r#"
        UPDATE recipe_runs
        SET status = 'in_progress', message = $2
        WHERE id = $1 AND status = 'queued'
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(message)
    .fetch_optional(pool)
    .await
}

pub async fn set_message(pool: &PgPool, id: i64, message: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE recipe_runs SET message = $2 WHERE id = $1")
        .bind(id)
        .bind(message)
        .execute(pool)
        .await?;
    Ok(())
}

/// Complete a run that is not completed yet
///
/// Returns `None` when the run is missing or already completed, so a
/// completed run is never reopened.
pub async fn complete_run(
    pool: &PgPool,
    id: i64,
    conclusion: RecipeRunConclusion,
    message: Option<&str>,
    dataset_public_url: Option<&str>,
) -> Result<Option<RecipeRun>, sqlx::Error> {
    sqlx::query_as::<_, RecipeRun>(
        r#"
        UPDATE recipe_runs
        SET status = 'completed',
            conclusion = $2,
            completed_at = NOW(),
            message = COALESCE($3, message),
            dataset_public_url = COALESCE($4, dataset_public_url)
        WHERE id = $1 AND status <> 'completed'
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(conclusion.to_string())
    .bind(message)
    .bind(dataset_public_url)
    .fetch_optional(pool)
    .await
}

/// Complete a run the bakery reported on
///
/// Only `in_progress` runs move; `None` means the run is missing, still
/// queued, or already completed.
pub async fn finish_run(
    pool: &PgPool,
    id: i64,
    conclusion: RecipeRunConclusion,
    dataset_public_url: Option<&str>,
) -> Result<Option<RecipeRun>, sqlx::Error> {
    sqlx::query_as::<_, RecipeRun>(
        r#"
        UPDATE recipe_runs
        SET status = 'completed',
            conclusion = $2,
            completed_at = NOW(),
            dataset_public_url = COALESCE($3, dataset_public_url)
        WHERE id = $1 AND status = 'in_progress'
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(conclusion.to_string())
    .bind(dataset_public_url)
    .fetch_optional(pool)
    .await
}
