//! Error handling module for the orchestrator
//!
//! HTTP handlers return [`AppError`]; background tasks use `anyhow` and only
//! log their failures.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;
use validator::ValidationErrors;

use crate::github::GitHubError;
use crate::runner::RunnerError;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Authentication errors (bad credentials or signatures)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Unauthorized (missing authentication)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authorization errors
    #[error("Access denied: {0}")]
    Authorization(String),

    /// Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Conflict (e.g., duplicate resource)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Bad request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Upstream GitHub failure
    #[error("GitHub error: {0}")]
    GitHub(#[from] GitHubError),

    /// `pangeo-forge-runner` failure
    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AppError {
    /// Status code this error maps to
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Database(_)
            | AppError::Runner(_)
            | AppError::Internal(_)
            | AppError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Authentication(_) | AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Authorization(_) => StatusCode::FORBIDDEN,
            AppError::Validation(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::GitHub(GitHubError::Api { status: 404, .. }) => StatusCode::NOT_FOUND,
            AppError::GitHub(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal details stay in the logs
        let (code, message) = match &self {
            AppError::Database(e) => {
                error!(error = %e, "Database error");
                ("DATABASE_ERROR", "An internal database error occurred".to_string())
            }
            AppError::Authentication(msg) => ("AUTHENTICATION_FAILED", msg.clone()),
            AppError::Unauthorized(msg) => ("UNAUTHORIZED", msg.clone()),
            AppError::Authorization(msg) => ("ACCESS_DENIED", msg.clone()),
            AppError::Validation(msg) => ("VALIDATION_ERROR", msg.clone()),
            AppError::NotFound(msg) => ("NOT_FOUND", msg.clone()),
            AppError::Conflict(msg) => ("CONFLICT", msg.clone()),
            AppError::BadRequest(msg) => {
                let safe_msg =
                    if msg.contains("SQL") || msg.contains("query") || msg.contains("column") {
                        "Invalid request".to_string()
                    } else {
                        msg.clone()
                    };
                ("BAD_REQUEST", safe_msg)
            }
            AppError::GitHub(e) => {
                error!(error = %e, "GitHub API error");
                ("GITHUB_ERROR", "The GitHub API request failed".to_string())
            }
            AppError::Runner(e) => {
                error!(error = %e, "Runner error");
                ("RUNNER_ERROR", "pangeo-forge-runner failed".to_string())
            }
            AppError::Internal(msg) => {
                error!(error = %msg, "Internal error");
                ("INTERNAL_ERROR", "An internal error occurred".to_string())
            }
            AppError::Configuration(msg) => {
                error!(error = %msg, "Configuration error");
                ("CONFIGURATION_ERROR", "A configuration error occurred".to_string())
            }
        };

        let body = Json(ErrorResponse {
            code: code.to_string(),
            message,
            details: None,
        });

        (status, body).into_response()
    }
}

/// Result type alias for AppError
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<ValidationErrors> for AppError {
    fn from(err: ValidationErrors) -> Self {
        let messages: Vec<String> = err
            .field_errors()
            .iter()
            .flat_map(|(field, errors)| {
                errors.iter().map(move |e| {
                    e.message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("Invalid value for '{}'", field))
                })
            })
            .collect();
        AppError::Validation(messages.join("; "))
    }
}

/// Map constraint violations raised by writes to client errors
///
/// Unique violations become 409s, foreign key and check violations 400s.
pub fn map_write_error(err: sqlx::Error, what: &str) -> AppError {
    if let sqlx::Error::Database(ref db_err) = err {
        match db_err.code().as_deref() {
            Some("23505") => return AppError::Conflict(format!("{what} already exists")),
            Some("23503") => {
                return AppError::BadRequest(format!(
                    "{what} references a bakery or feedstock that does not exist, \
                     or is still referenced by recipe runs"
                ))
            }
            Some("23514") => {
                return AppError::Validation(format!("{what} violates a status constraint"))
            }
            _ => {}
        }
    }
    AppError::Database(err)
}
