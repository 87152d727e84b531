use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;

use crate::error::{AppError, ErrorClass};
use crate::services::EventDisposition;
use crate::AppState;

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

/// Stripe event callback. The payload is only parsed after its signature checks out.
/// Consistency failures are acknowledged so Stripe stops redelivering them.
pub async fn stripe(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok());

    let event = state
        .webhook_verifier
        .verify(signature, &body, Utc::now())
        .map_err(|e| {
            tracing::warn!(error = %e, "Rejected Stripe webhook");
            AppError::Validation(e.to_string())
        })?;

    let disposition = match state.stripe_events.handle(&event).await {
        Ok(disposition) => disposition,
        Err(e) if e.class() == ErrorClass::Consistency => {
            tracing::info!(event_id = %event.id, error = %e, "Stripe event already applied");
            EventDisposition::Unchanged
        }
        Err(e) => {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Failed to handle Stripe event"
            );
            return Err(e);
        }
    };

    tracing::info!(
        event_id = %event.id,
        event_type = %event.event_type,
        disposition = ?disposition,
        "Handled Stripe event"
    );
    Ok((StatusCode::OK, Json(json!({ "received": true }))))
}
