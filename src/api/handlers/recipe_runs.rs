//! Recipe run handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use sqlx::{Postgres, QueryBuilder};
use validator::Validate;

use crate::api::middleware::{AdminKey, ValidatedJson};
use crate::api::pagination::PageQuery;
use crate::api::AppState;
use crate::error::{map_write_error, AppError, AppResult};
use crate::models::{
    Bakery, CreateRecipeRunRequest, Feedstock, RecipeRun, RecipeRunFilter,
    RecipeRunWithBakeryAndFeedstock, UpdateRecipeRunRequest,
};

fn not_found(id: i64) -> AppError {
    AppError::NotFound(format!("Recipe run {} not found", id))
}

async fn fetch(state: &AppState, id: i64) -> AppResult<RecipeRun> {
    sqlx::query_as::<_, RecipeRun>("SELECT * FROM recipe_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(state.db.pool())
        .await?
        .ok_or_else(|| not_found(id))
}

/// Append the `WHERE` clauses for the filters that are set
fn push_filters(query: &mut QueryBuilder<'_, Postgres>, filter: &RecipeRunFilter) {
    query.push(" WHERE TRUE");
    if let Some(feedstock_id) = filter.feedstock_id {
        query.push(" AND feedstock_id = ").push_bind(feedstock_id);
    }
    if let Some(bakery_id) = filter.bakery_id {
        query.push(" AND bakery_id = ").push_bind(bakery_id);
    }
    if let Some(ref head_sha) = filter.head_sha {
        query.push(" AND head_sha = ").push_bind(head_sha.clone());
    }
    if let Some(ref recipe_id) = filter.recipe_id {
        query.push(" AND recipe_id = ").push_bind(recipe_id.clone());
    }
    if let Some(is_test) = filter.is_test {
        query.push(" AND is_test = ").push_bind(is_test);
    }
    if let Some(status) = filter.status {
        query.push(" AND status = ").push_bind(status.to_string());
    }
}

/// List recipe runs, optionally filtered
pub async fn list(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
    Query(filter): Query<RecipeRunFilter>,
) -> AppResult<Json<Vec<RecipeRun>>> {
    page.validate()?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT * FROM recipe_runs");
    push_filters(&mut query, &filter);
    query
        .push(" ORDER BY id OFFSET ")
        .push_bind(page.offset())
        .push(" LIMIT ")
        .push_bind(page.limit());

    let runs = query
        .build_query_as::<RecipeRun>()
        .fetch_all(state.db.pool())
        .await?;

    Ok(Json(runs))
}

/// Create a recipe run
pub async fn create(
    _admin: AdminKey,
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CreateRecipeRunRequest>,
) -> AppResult<(StatusCode, Json<RecipeRun>)> {
    request.check_state().map_err(AppError::Validation)?;

    let run = sqlx::query_as::<_, RecipeRun>(
        r#"
        INSERT INTO recipe_runs (
            recipe_id, bakery_id, feedstock_id, head_sha, version, started_at,
            completed_at, conclusion, status, is_test, dataset_type,
            dataset_public_url, message
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING *
        "#,
    )
    .bind(&request.recipe_id)
    .bind(request.bakery_id)
    .bind(request.feedstock_id)
    .bind(&request.head_sha)
    .bind(&request.version)
    .bind(request.started_at)
    .bind(request.completed_at)
    .bind(request.conclusion.map(|c| c.to_string()))
    .bind(request.status.to_string())
    .bind(request.is_test)
    .bind(request.dataset_type.map(|t| t.to_string()))
    .bind(&request.dataset_public_url)
    .bind(&request.message)
    .fetch_one(state.db.pool())
    .await
    .map_err(|e| map_write_error(e, "Recipe run"))?;

    state.metrics.recipe_runs_created.inc();
    tracing::info!(
        recipe_run_id = run.id,
        recipe_id = %run.recipe_id,
        head_sha = %run.head_sha,
        "Recipe run created"
    );

    Ok((StatusCode::CREATED, Json(run)))
}

/// Get a recipe run with its bakery and feedstock
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<RecipeRunWithBakeryAndFeedstock>> {
    let recipe_run = fetch(&state, id).await?;

    let bakery = sqlx::query_as::<_, Bakery>("SELECT * FROM bakeries WHERE id = $1")
        .bind(recipe_run.bakery_id)
        .fetch_one(state.db.pool())
        .await?;
    let feedstock = sqlx::query_as::<_, Feedstock>("SELECT * FROM feedstocks WHERE id = $1")
        .bind(recipe_run.feedstock_id)
        .fetch_one(state.db.pool())
        .await?;

    Ok(Json(RecipeRunWithBakeryAndFeedstock {
        recipe_run,
        bakery,
        feedstock,
    }))
}

/// Update the fields present in the request
///
/// The merged row must still satisfy the status/conclusion rules.
pub async fn update(
    _admin: AdminKey,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ValidatedJson(request): ValidatedJson<UpdateRecipeRunRequest>,
) -> AppResult<Json<RecipeRun>> {
    let updated = request
        .apply(fetch(&state, id).await?)
        .map_err(AppError::Validation)?;

    let run = sqlx::query_as::<_, RecipeRun>(
        r#"
        UPDATE recipe_runs
        SET recipe_id = $2, bakery_id = $3, feedstock_id = $4, head_sha = $5,
            version = $6, started_at = $7, completed_at = $8, conclusion = $9,
            status = $10, is_test = $11, dataset_type = $12,
            dataset_public_url = $13, message = $14
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&updated.recipe_id)
    .bind(updated.bakery_id)
    .bind(updated.feedstock_id)
    .bind(&updated.head_sha)
    .bind(&updated.version)
    .bind(updated.started_at)
    .bind(updated.completed_at)
    .bind(&updated.conclusion)
    .bind(&updated.status)
    .bind(updated.is_test)
    .bind(&updated.dataset_type)
    .bind(&updated.dataset_public_url)
    .bind(&updated.message)
    .fetch_optional(state.db.pool())
    .await
    .map_err(|e| map_write_error(e, "Recipe run"))?
    .ok_or_else(|| not_found(id))?;

    Ok(Json(run))
}

/// Delete a recipe run
pub async fn delete(
    _admin: AdminKey,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<Value>> {
    let result = sqlx::query("DELETE FROM recipe_runs WHERE id = $1")
        .bind(id)
        .execute(state.db.pool())
        .await?;

    if result.rows_affected() == 0 {
        return Err(not_found(id));
    }

    tracing::info!(recipe_run_id = id, "Recipe run deleted");
    Ok(Json(json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecipeRunStatus;

    #[test]
    fn test_push_filters_binds_only_set_fields() {
        let filter = RecipeRunFilter {
            feedstock_id: Some(3),
            is_test: Some(true),
            status: Some(RecipeRunStatus::InProgress),
            ..Default::default()
        };
        let mut query = QueryBuilder::<Postgres>::new("SELECT * FROM recipe_runs");
        push_filters(&mut query, &filter);
        assert_eq!(
            query.sql(),
            "SELECT * FROM recipe_runs WHERE TRUE AND feedstock_id = $1 AND is_test = $2 AND status = $3"
        );
    }

    #[test]
    fn test_push_filters_empty() {
        let filter = RecipeRunFilter::default();
        let mut query = QueryBuilder::<Postgres>::new("SELECT * FROM recipe_runs");
        push_filters(&mut query, &filter);
        assert_eq!(query.sql(), "SELECT * FROM recipe_runs WHERE TRUE");
    }
}
