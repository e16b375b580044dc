//! JSON bodies checked with the validator crate before a handler sees them

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    Json,
};
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::error::AppError;

/// A JSON request body that passed `Validate`
///
/// Malformed bodies and rule violations are both answered with a 400
/// `VALIDATION_ERROR`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedJson<T>(pub T);

/// Client-facing text for a body that did not deserialize
///
/// serde messages for missing fields and unknown enum variants name what
/// is wrong and are passed through; anything else is collapsed.
fn parse_error_message(rejection: &JsonRejection) -> String {
    let text = rejection.body_text();
    tracing::debug!(error = %text, "JSON parse error");

    match rejection {
        JsonRejection::MissingJsonContentType(_) => {
            "Expected request with `Content-Type: application/json`".to_string()
        }
        _ if text.contains("missing field") || text.contains("unknown variant") => {
            text.rsplit(": ").next().unwrap_or(&text).to_string()
        }
        _ if text.contains("EOF") => "Request body is empty or incomplete".to_string(),
        _ => "Invalid JSON body".to_string(),
    }
}

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| AppError::Validation(parse_error_message(&e)))?;
        value.validate()?;
        Ok(ValidatedJson(value))
    }
}
