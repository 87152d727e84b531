use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{CircleSubscription, CircleSubscriptionItem, Currency};
use crate::error::AppError;
use crate::handlers::CallerId;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct PublishPriceRequest {
    pub amount: BigDecimal,
    pub currency: Currency,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub trial_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyCouponRequest {
    pub coupon_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    pub subscription: CircleSubscription,
    pub items: Vec<CircleSubscriptionItem>,
}

pub async fn publish_price(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(circle_id): Path<Uuid>,
    Json(payload): Json<PublishPriceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let price = state
        .billing
        .publish_price(user_id, circle_id, payload.amount, payload.currency)
        .await?;
    Ok((StatusCode::CREATED, Json(price)))
}

pub async fn subscribe(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(circle_id): Path<Uuid>,
    payload: Option<Json<SubscribeRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let trial_end = payload.and_then(|Json(request)| request.trial_end);
    let subscription = state
        .billing
        .subscribe(user_id, circle_id, trial_end)
        .await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

/// Moves the caller onto the circle's current price.
pub async fn change_price(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(circle_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.billing.change_price(user_id, circle_id).await?))
}

pub async fn unsubscribe(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(circle_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.billing.unsubscribe(user_id, circle_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn my_subscription(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
) -> Result<impl IntoResponse, AppError> {
    let subscription = state
        .billing
        .subscription_for(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("subscription for user {}", user_id)))?;
    let items = state.billing.items_for(subscription.id).await?;
    Ok(Json(SubscriptionView {
        subscription,
        items,
    }))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(subscription_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.billing.cancel(user_id, subscription_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn apply_coupon(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(invoice_id): Path<Uuid>,
    Json(payload): Json<ApplyCouponRequest>,
) -> Result<impl IntoResponse, AppError> {
    let invoice = state
        .billing
        .apply_coupon(user_id, invoice_id, payload.coupon_id)
        .await?;
    Ok(Json(invoice))
}
