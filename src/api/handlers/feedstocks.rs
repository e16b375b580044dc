//! Feedstock handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use validator::Validate;

use crate::api::middleware::{AdminKey, ValidatedJson};
use crate::api::pagination::PageQuery;
use crate::api::AppState;
use crate::error::{map_write_error, AppError, AppResult};
use crate::models::{
    validate_head_sha, yaml_to_json, CreateFeedstockRequest, Feedstock, FeedstockWithRecipeRuns,
    RecipeRun, UpdateFeedstockRequest,
};

/// Location of the metadata file in a feedstock repository
pub const META_PATH: &str = "feedstock/meta.yaml";

fn not_found(id: i64) -> AppError {
    AppError::NotFound(format!("Feedstock {} not found", id))
}

async fn fetch(state: &AppState, id: i64) -> AppResult<Feedstock> {
    sqlx::query_as::<_, Feedstock>("SELECT * FROM feedstocks WHERE id = $1")
        .bind(id)
        .fetch_optional(state.db.pool())
        .await?
        .ok_or_else(|| not_found(id))
}

/// List feedstocks
pub async fn list(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> AppResult<Json<Vec<Feedstock>>> {
    page.validate()?;

    let feedstocks = sqlx::query_as::<_, Feedstock>(
        "SELECT * FROM feedstocks ORDER BY id OFFSET $1 LIMIT $2",
    )
    .bind(page.offset())
    .bind(page.limit())
    .fetch_all(state.db.pool())
    .await?;

    Ok(Json(feedstocks))
}

/// Register a feedstock
pub async fn create(
    _admin: AdminKey,
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CreateFeedstockRequest>,
) -> AppResult<(StatusCode, Json<Feedstock>)> {
    let feedstock = sqlx::query_as::<_, Feedstock>(
        r#"
        INSERT INTO feedstocks (spec, provider)
        VALUES ($1, $2)
        RETURNING *
        "#,
    )
    .bind(&request.spec)
    .bind(&request.provider)
    .fetch_one(state.db.pool())
    .await
    .map_err(|e| map_write_error(e, "Feedstock"))?;

    tracing::info!(feedstock_id = feedstock.id, spec = %feedstock.spec, "Feedstock created");

    Ok((StatusCode::CREATED, Json(feedstock)))
}

/// Get a feedstock and its recipe runs
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<FeedstockWithRecipeRuns>> {
    let feedstock = fetch(&state, id).await?;

    let recipe_runs = sqlx::query_as::<_, RecipeRun>(
        "SELECT * FROM recipe_runs WHERE feedstock_id = $1 ORDER BY id",
    )
    .bind(id)
    .fetch_all(state.db.pool())
    .await?;

    Ok(Json(FeedstockWithRecipeRuns {
        feedstock,
        recipe_runs,
    }))
}

/// Update the fields present in the request
pub async fn update(
    _admin: AdminKey,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ValidatedJson(request): ValidatedJson<UpdateFeedstockRequest>,
) -> AppResult<Json<Feedstock>> {
    let updated = request.apply(fetch(&state, id).await?);

    let feedstock = sqlx::query_as::<_, Feedstock>(
        r#"
        UPDATE feedstocks
        SET spec = $2, provider = $3
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&updated.spec)
    .bind(&updated.provider)
    .fetch_optional(state.db.pool())
    .await
    .map_err(|e| map_write_error(e, "Feedstock"))?
    .ok_or_else(|| not_found(id))?;

    Ok(Json(feedstock))
}

/// Delete a feedstock with no recipe runs
pub async fn delete(
    _admin: AdminKey,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<Value>> {
    fetch(&state, id).await?;

    let (runs,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM recipe_runs WHERE feedstock_id = $1")
            .bind(id)
            .fetch_one(state.db.pool())
            .await?;

    if runs > 0 {
        return Err(AppError::Conflict(format!(
            "Cannot delete feedstock {} with {} recipe runs",
            id, runs
        )));
    }

    let result = sqlx::query("DELETE FROM feedstocks WHERE id = $1")
        .bind(id)
        .execute(state.db.pool())
        .await
        .map_err(|e| map_write_error(e, "Feedstock"))?;

    if result.rows_affected() == 0 {
        return Err(not_found(id));
    }

    tracing::info!(feedstock_id = id, "Feedstock deleted");
    Ok(Json(json!({ "ok": true })))
}

/// `meta.yaml` of a feedstock at `commit_sha`, converted to JSON
pub async fn meta_at_commit(
    State(state): State<AppState>,
    Path((id, commit_sha)): Path<(i64, String)>,
) -> AppResult<Json<Value>> {
    validate_head_sha(&commit_sha)
        .map_err(|_| AppError::Validation("commit_sha must be a full commit sha".into()))?;

    let feedstock = fetch(&state, id).await?;

    let client = state.github.for_repo(&feedstock.spec).await?;
    let text = client.get_file(&feedstock.spec, META_PATH, &commit_sha).await?;

    let meta = yaml_to_json(&text).map_err(|e| {
        AppError::Validation(format!("{} in {} is not valid: {}", META_PATH, feedstock.spec, e))
    })?;

    Ok(Json(meta))
}
