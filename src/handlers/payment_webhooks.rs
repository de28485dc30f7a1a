use crate::{errors::ServiceError, webhooks, AppState};
use axum::{extract::State, http::HeaderMap, response::IntoResponse, routing::post, Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{info, warn};

// POST /api/v1/payments/webhook
//
// Not rate limited: the provider retries every non-2xx answer.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    if state.config.webhook_verify_signature
        && !webhooks::verify_signature(&headers, &body, &state.config.paystack_secret_key)
    {
        warn!("Payment webhook signature verification failed");
        return Err(ServiceError::Unauthorized(
            "invalid webhook signature".to_string(),
        ));
    }

    let envelope: Value = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::MalformedWebhook(format!("invalid json: {}", e)))?;

    let outcome = state.services.webhooks.dispatch(&envelope).await?;
    info!(?outcome, "Payment webhook processed");

    Ok(Json(json!({ "status": "success" })))
}

pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/payments/webhook", post(payment_webhook))
}
