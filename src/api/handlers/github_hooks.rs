//! GitHub App webhook receiver

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use tracing::{info, warn};

use crate::api::AppState;
use crate::error::{AppError, AppResult};
use crate::webhook::{
    route_event, tasks, verify_signature, HookResponse, DELIVERY_HEADER, EVENT_HEADER,
    MAX_WEBHOOK_PAYLOAD_SIZE, SIGNATURE_HEADER,
};

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Verify, route and acknowledge a delivery
///
/// Work triggered by the event runs after the 202 has been sent; the
/// response lists the tasks that were started.
pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<(StatusCode, Json<HookResponse>)> {
    state.metrics.webhooks_received.inc();

    if body.len() > MAX_WEBHOOK_PAYLOAD_SIZE {
        state.metrics.webhooks_rejected.inc();
        return Err(AppError::BadRequest(format!(
            "Webhook payload too large: {} bytes (max: {} bytes)",
            body.len(),
            MAX_WEBHOOK_PAYLOAD_SIZE
        )));
    }

    let Some(ref secret) = state.settings.github_app.webhook_secret else {
        tracing::error!("GitHub webhook received but GITHUB_WEBHOOK_SECRET is not configured");
        return Err(AppError::Internal(
            "Webhook signature verification not configured".to_string(),
        ));
    };

    if let Err(e) = verify_signature(secret, &body, header(&headers, SIGNATURE_HEADER)) {
        state.metrics.webhooks_rejected.inc();
        warn!(error = %e, "Rejected webhook delivery");
        return Err(AppError::Authentication(e.to_string()));
    }

    let event = header(&headers, EVENT_HEADER).unwrap_or("unknown");
    let delivery = header(&headers, DELIVERY_HEADER).unwrap_or("-");

    let action = route_event(event, &body, &state.settings.github_app).map_err(|e| {
        state.metrics.webhooks_rejected.inc();
        warn!(event, delivery, error = %e, "Undecodable webhook payload");
        AppError::BadRequest(format!("Invalid {} payload", event))
    })?;

    let background_tasks = tasks::spawn(state.task_context(), action);
    info!(
        event,
        delivery,
        tasks = background_tasks.len(),
        "Webhook delivery accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(HookResponse {
            status: "ok",
            background_tasks,
        }),
    ))
}
