pub mod circles;
pub mod payments;
pub mod wallet;
pub mod webhook;

use axum::{
    async_trait,
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use crate::error::AppError;
use crate::health::{check_health, OverallStatus};
use crate::AppState;

pub const CALLER_HEADER: &str = "x-user-id";

/// The authenticated caller, as forwarded by the upstream gateway in `x-user-id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerId(pub Uuid);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CallerId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(CALLER_HEADER)
            .ok_or_else(|| AppError::Unauthorized(format!("missing {} header", CALLER_HEADER)))?;
        value
            .to_str()
            .ok()
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
            .map(CallerId)
            .ok_or_else(|| AppError::Unauthorized(format!("malformed {} header", CALLER_HEADER)))
    }
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = check_health(&state.health, state.start_time).await;

    let status_code = match report.status {
        OverallStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        OverallStatus::Healthy | OverallStatus::Degraded => StatusCode::OK,
    };

    (status_code, Json(report))
}
