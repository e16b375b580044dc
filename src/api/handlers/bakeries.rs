//! Bakery handlers

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
    Bakery, BakeryWithRecipeRuns, CreateBakeryRequest, RecipeRun, UpdateBakeryRequest,
};

fn not_found(id: i64) -> AppError {
    AppError::NotFound(format!("Bakery {} not found", id))
}

async fn fetch(state: &AppState, id: i64) -> AppResult<Bakery> {
    sqlx::query_as::<_, Bakery>("SELECT * FROM bakeries WHERE id = $1")
        .bind(id)
        .fetch_optional(state.db.pool())
        .await?
        .ok_or_else(|| not_found(id))
}

/// List bakeries
pub async fn list(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> AppResult<Json<Vec<Bakery>>> {
    page.validate()?;

    let bakeries = sqlx::query_as::<_, Bakery>(
        "SELECT * FROM bakeries ORDER BY id OFFSET $1 LIMIT $2",
    )
    .bind(page.offset())
    .bind(page.limit())
    .fetch_all(state.db.pool())
    .await?;

    Ok(Json(bakeries))
}

/// Create a bakery
pub async fn create(
    _admin: AdminKey,
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CreateBakeryRequest>,
) -> AppResult<(StatusCode, Json<Bakery>)> {
    let bakery = sqlx::query_as::<_, Bakery>(
        r#"
        INSERT INTO bakeries (region, name, description)
        VALUES ($1, $2, $3)
        RETURNING *
        "#,
    )
    .bind(&request.region)
    .bind(&request.name)
    .bind(&request.description)
    .fetch_one(state.db.pool())
    .await
    .map_err(|e| map_write_error(e, "Bakery"))?;

    tracing::info!(bakery_id = bakery.id, name = %bakery.name, "Bakery created");

    Ok((StatusCode::CREATED, Json(bakery)))
}

/// Get a bakery and the recipe runs baked on it
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<BakeryWithRecipeRuns>> {
    let bakery = fetch(&state, id).await?;

    let recipe_runs = sqlx::query_as::<_, RecipeRun>(
        "SELECT * FROM recipe_runs WHERE bakery_id = $1 ORDER BY id",
    )
    .bind(id)
    .fetch_all(state.db.pool())
    .await?;

    Ok(Json(BakeryWithRecipeRuns {
        bakery,
        recipe_runs,
    }))
}

/// Update the fields present in the request
pub async fn update(
    _admin: AdminKey,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ValidatedJson(request): ValidatedJson<UpdateBakeryRequest>,
) -> AppResult<Json<Bakery>> {
    let updated = request.apply(fetch(&state, id).await?);

    let bakery = sqlx::query_as::<_, Bakery>(
        r#"
        UPDATE bakeries
        SET region = $2, name = $3, description = $4
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&updated.region)
    .bind(&updated.name)
    .bind(&updated.description)
    .fetch_optional(state.db.pool())
    .await
    .map_err(|e| map_write_error(e, "Bakery"))?
    .ok_or_else(|| not_found(id))?;

    Ok(Json(bakery))
}

/// Delete a bakery with no recipe runs
pub async fn delete(
    _admin: AdminKey,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<Value>> {
    fetch(&state, id).await?;

    let (runs,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM recipe_runs WHERE bakery_id = $1")
        .bind(id)
        .fetch_one(state.db.pool())
        .await?;

    if runs > 0 {
        return Err(AppError::Conflict(format!(
            "Cannot delete bakery {} with {} recipe runs",
            id, runs
        )));
    }

    let result = sqlx::query("DELETE FROM bakeries WHERE id = $1")
        .bind(id)
        .execute(state.db.pool())
        .await
        .map_err(|e| map_write_error(e, "Bakery"))?;

    if result.rows_affected() == 0 {
        return Err(not_found(id));
    }

    tracing::info!(bakery_id = id, "Bakery deleted");
    Ok(Json(json!({ "ok": true })))
}
