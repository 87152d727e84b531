use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::SignaturePurpose;
use crate::error::AppError;
use crate::handlers::CallerId;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ChallengeRequest {
    pub address: String,
    pub purpose: SignaturePurpose,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub address: String,
    pub signature: String,
    pub nonce: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub user_id: Uuid,
}

/// Anonymous callers may ask for `login` and `signup` challenges; `connect` needs a caller.
pub async fn challenge(
    State(state): State<AppState>,
    caller: Option<CallerId>,
    Json(payload): Json<ChallengeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let challenge = state
        .wallets
        .issue_challenge(&payload.address, payload.purpose, caller.map(|c| c.0))
        .await?;
    Ok((StatusCode::CREATED, Json(challenge)))
}

pub async fn verify(
    State(state): State<AppState>,
    caller: Option<CallerId>,
    Json(payload): Json<VerifyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = state
        .wallets
        .verify(
            &payload.address,
            &payload.signature,
            &payload.nonce,
            caller.map(|c| c.0),
        )
        .await?;
    Ok(Json(VerifyResponse { user_id }))
}

pub async fn get_wallet(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
) -> Result<impl IntoResponse, AppError> {
    let wallet = state
        .wallets
        .wallet_for_user(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("wallet for user {}", user_id)))?;
    Ok(Json(wallet))
}

pub async fn reset(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.wallets.reset_wallet(user_id).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(wallet_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.wallets.delete_wallet(user_id, wallet_id).await?))
}
