//! API key handlers
//!
//! Every route here needs the configured admin key; stored keys cannot
//! mint or revoke other keys.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use validator::Validate;

use crate::api::middleware::{AdminKey, ValidatedJson};
use crate::api::pagination::PageQuery;
use crate::api::AppState;
use crate::error::{map_write_error, AppError, AppResult};
use crate::models::{
    display_prefix, generate_api_key, hash_api_key, ApiKey, CreateApiKeyRequest,
    CreateApiKeyResponse, UpdateApiKeyRequest,
};

async fn fetch(state: &AppState, id: i64) -> AppResult<ApiKey> {
    sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE id = $1")
        .bind(id)
        .fetch_optional(state.db.pool())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("API key {} not found", id)))
}

/// List stored keys, newest first
pub async fn list(
    admin: AdminKey,
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> AppResult<Json<Vec<ApiKey>>> {
    admin.require_configured()?;
    page.validate()?;

    let keys = sqlx::query_as::<_, ApiKey>(
        "SELECT * FROM api_keys ORDER BY created_at DESC, id DESC OFFSET $1 LIMIT $2",
    )
    .bind(page.offset())
    .bind(page.limit())
    .fetch_all(state.db.pool())
    .await?;

    Ok(Json(keys))
}

/// Mint a key; the raw value is only in this response
pub async fn create(
    admin: AdminKey,
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CreateApiKeyRequest>,
) -> AppResult<(StatusCode, Json<CreateApiKeyResponse>)> {
    admin.require_configured()?;

    let raw_key = generate_api_key();
    let key = sqlx::query_as::<_, ApiKey>(
        r#"
        INSERT INTO api_keys (name, key_hash, key_prefix)
        VALUES ($1, $2, $3)
        RETURNING *
        "#,
    )
    .bind(&request.name)
    .bind(hash_api_key(&raw_key))
    .bind(display_prefix(&raw_key))
    .fetch_one(state.db.pool())
    .await
    .map_err(|e| map_write_error(e, "API key"))?;

    tracing::info!(api_key_id = key.id, name = %key.name, "API key created");

    Ok((
        StatusCode::CREATED,
        Json(CreateApiKeyResponse {
            id: key.id,
            key: raw_key,
            name: key.name,
            key_prefix: key.key_prefix,
            created_at: key.created_at,
        }),
    ))
}

pub async fn get(
    admin: AdminKey,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<ApiKey>> {
    admin.require_configured()?;
    Ok(Json(fetch(&state, id).await?))
}

/// Rename or (de)activate a key
pub async fn update(
    admin: AdminKey,
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ValidatedJson(request): ValidatedJson<UpdateApiKeyRequest>,
) -> AppResult<Json<ApiKey>> {
    admin.require_configured()?;
    let merged = request.apply(fetch(&state, id).await?);

    let key = sqlx::query_as::<_, ApiKey>(
        "UPDATE api_keys SET name = $1, is_active = $2 WHERE id = $3 RETURNING *",
    )
    .bind(&merged.name)
    .bind(merged.is_active)
    .bind(id)
    .fetch_one(state.db.pool())
    .await?;

    Ok(Json(key))
}

/// Revoke a key; the row is kept for auditing
pub async fn revoke(
    admin: AdminKey,
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    admin.require_configured()?;

    let result = sqlx::query("UPDATE api_keys SET is_active = FALSE WHERE id = $1")
        .bind(id)
        .execute(state.db.pool())
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("API key {} not found", id)));
    }

    tracing::info!(api_key_id = id, "API key revoked");
    Ok(StatusCode::NO_CONTENT)
}
