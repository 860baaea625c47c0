use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha1::Sha1;

use crate::errors::{AppError, AppResult};
use crate::services::payment::coordinator::{self, GatewayNotice};
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

/// Gateway callback payload for asynchronous capture outcomes.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentNotification {
    CaptureSucceeded { booking_id: String, transaction_id: String },
    CaptureFailed { booking_id: String, reason: String },
}

impl From<PaymentNotification> for GatewayNotice {
    fn from(n: PaymentNotification) -> Self {
        match n {
            PaymentNotification::CaptureSucceeded { booking_id, transaction_id } => {
                GatewayNotice::CaptureSucceeded { booking_id, transaction_id }
            }
            PaymentNotification::CaptureFailed { booking_id, reason } => {
                GatewayNotice::CaptureFailed { booking_id, reason }
            }
        }
    }
}

/// Base64 HMAC-SHA1 of the raw request body.
pub fn sign_payload(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

fn validate_signature(secret: &str, signature: &str, body: &[u8]) -> bool {
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&decoded).is_ok()
}

// POST /webhook/payments
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    // empty secret = local development, signatures not checked
    let secret = &state.config.payment_webhook_secret;
    if !secret.is_empty() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if signature.is_empty() {
            tracing::warn!("missing X-Gateway-Signature header");
            return Err(AppError::Forbidden);
        }
        if !validate_signature(secret, signature, &body) {
            tracing::warn!("invalid payment webhook signature");
            return Err(AppError::Forbidden);
        }
    }

    let notification: PaymentNotification =
        serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(format!("malformed notification: {e}")))?;
    tracing::info!(?notification, "payment notification received");

    coordinator::apply_gateway_notice(&state, notification.into()).await?;
    Ok(Json(json!({"ok": true})))
}
