use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{AppreciationPurpose, Currency, FlagMode, NewAppreciation};
use crate::error::AppError;
use crate::handlers::CallerId;
use crate::services::DonationRequest;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddCreditRequest {
    pub amount: BigDecimal,
    pub currency: Currency,
}

#[derive(Debug, Deserialize)]
pub struct SetCurrencyRequest {
    pub currency: Currency,
}

#[derive(Debug, Deserialize)]
pub struct PayoutRequest {
    pub amount: BigDecimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub transaction_id: Uuid,
    pub amount: Option<BigDecimal>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub currency: Currency,
    pub balance: BigDecimal,
    pub available: BigDecimal,
}

#[derive(Debug, Deserialize)]
pub struct DeltaQuery {
    pub currency: Option<Currency>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppreciateRequest {
    pub recipient_id: Uuid,
    pub amount: i32,
    pub purpose: AppreciationPurpose,
    pub reference_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct AppreciationQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct QuoteQuery {
    pub amount: BigDecimal,
    pub from: Currency,
    pub to: Currency,
}

#[derive(Debug, Serialize)]
pub struct QuoteResponse {
    pub amount: BigDecimal,
    pub from: Currency,
    pub to: Currency,
    pub quote: BigDecimal,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFlagRequest {
    pub mode: FlagMode,
}

pub async fn add_credit(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Json(payload): Json<AddCreditRequest>,
) -> Result<impl IntoResponse, AppError> {
    let credit = state
        .ledger
        .add_credit(user_id, payload.amount, payload.currency)
        .await?;
    Ok((StatusCode::CREATED, Json(credit)))
}

pub async fn set_currency(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Json(payload): Json<SetCurrencyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let account = state.ledger.set_currency(user_id, payload.currency).await?;
    Ok(Json(account))
}

pub async fn balance(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(currency): Path<Currency>,
) -> Result<impl IntoResponse, AppError> {
    let balance = state.ledger.balance_of(user_id, currency).await?;
    let available = state.ledger.available_balance(user_id, currency).await?;
    Ok(Json(BalanceResponse {
        currency,
        balance,
        available,
    }))
}

pub async fn deltas(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Query(query): Query<DeltaQuery>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.ledger.deltas_for(user_id, query.currency).await?))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let tx = state.ledger.get_transaction(id).await?;
    if !tx.involves(user_id) && !state.is_admin(user_id).await? {
        return Err(AppError::NotFound(format!("transaction {}", id)));
    }
    Ok(Json(tx))
}

pub async fn donate(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Json(payload): Json<DonationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let tx = state.ledger.donate(user_id, payload).await?;
    Ok((StatusCode::CREATED, Json(tx)))
}

pub async fn payout(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Json(payload): Json<PayoutRequest>,
) -> Result<impl IntoResponse, AppError> {
    let tx = state.ledger.payout(user_id, payload.amount).await?;
    Ok((StatusCode::CREATED, Json(tx)))
}

/// Operator-only.
pub async fn refund(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Json(payload): Json<RefundRequest>,
) -> Result<impl IntoResponse, AppError> {
    state.require_admin(user_id).await?;
    let tx = state
        .ledger
        .refund(payload.transaction_id, payload.amount)
        .await?;
    Ok((StatusCode::CREATED, Json(tx)))
}

/// Subsidies are granted by the platform, so only operators may record them.
pub async fn appreciate(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Json(payload): Json<AppreciateRequest>,
) -> Result<impl IntoResponse, AppError> {
    if payload.purpose == AppreciationPurpose::AppreciateSubsidy {
        state.require_admin(user_id).await?;
    }
    let appreciation = state
        .ledger
        .record_appreciation(NewAppreciation {
            sender_id: user_id,
            recipient_id: payload.recipient_id,
            amount: payload.amount,
            purpose: payload.purpose,
            reference_id: payload.reference_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(appreciation)))
}

pub async fn appreciations(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Query(query): Query<AppreciationQuery>,
) -> Result<impl IntoResponse, AppError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    Ok(Json(state.ledger.appreciations_for(user_id, limit).await?))
}

pub async fn quote(
    State(state): State<AppState>,
    Query(query): Query<QuoteQuery>,
) -> Result<impl IntoResponse, AppError> {
    let quote = state.rates.quote(&query.amount, query.from, query.to)?;
    Ok(Json(QuoteResponse {
        amount: query.amount,
        from: query.from,
        to: query.to,
        quote,
    }))
}

pub async fn list_flags(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
) -> Result<impl IntoResponse, AppError> {
    state.require_admin(user_id).await?;
    Ok(Json(state.flags.get_all().await?))
}

pub async fn update_flag(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(name): Path<String>,
    Json(payload): Json<UpdateFlagRequest>,
) -> Result<impl IntoResponse, AppError> {
    state.require_admin(user_id).await?;
    Ok(Json(state.flags.update(&name, payload.mode).await?))
}
