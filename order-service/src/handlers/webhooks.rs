//! Inbound bank-transfer webhook.

use crate::services::payments::{BankTransferWebhook, WebhookOutcome};
use crate::startup::AppState;
use axum::{extract::State, http::HeaderMap, Json};
use secrecy::ExposeSecret;
use serde::Serialize;
use service_core::error::AppError;
use service_core::utils::secret::{credential_for_scheme, secrets_match};

const API_KEY_SCHEME: &str = "Apikey";

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub outcome: WebhookOutcome,
}

/// Authenticate with the shared API key, then hand the transfer to the
/// payment gateway. Anything past authentication is acknowledged with 200
/// so the provider does not retry transfers we deliberately skip.
pub async fn bank_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, AppError> {
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| credential_for_scheme(v, API_KEY_SCHEME))
        .ok_or_else(|| {
            tracing::warn!("Bank webhook without API key");
            AppError::Unauthorized(anyhow::anyhow!("Missing webhook API key"))
        })?;

    if !secrets_match(state.config.webhook.api_key.expose_secret(), presented) {
        tracing::warn!("Bank webhook with invalid API key");
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Invalid webhook API key"
        )));
    }

    let payload: BankTransferWebhook = serde_json::from_str(&body).map_err(|e| {
        tracing::warn!(error = %e, "Malformed bank webhook payload");
        AppError::BadRequest(anyhow::anyhow!("Invalid webhook payload: {}", e))
    })?;

    tracing::info!(
        transaction_id = %payload.id,
        transfer_type = %payload.transfer_type,
        amount = payload.transfer_amount,
        reference_code = ?payload.reference_code,
        "Processing bank transfer webhook"
    );

    let outcome = state.orders.handle_bank_transfer(&payload).await?;
    Ok(Json(WebhookResponse {
        success: true,
        message: outcome.message(),
        outcome,
    }))
}
