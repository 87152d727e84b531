pub mod adapters;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod db;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod ports;
pub mod providers;
pub mod queue;
pub mod secrets;
pub mod services;
pub mod startup;
pub mod validation;
pub mod workers;

use axum::{
    http::HeaderValue,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::AppError;
use crate::health::HealthChecks;
use crate::middleware::{request_logger_middleware, RequestLogSettings};
use crate::ports::AccountRepository;
use crate::providers::stripe::StripeWebhookVerifier;
use crate::services::{
    BillingService, ExchangeRateService, FeatureFlagService, LedgerService, Services,
    StripeEventRouter, WalletService,
};

#[derive(Debug, Clone, Default)]
pub struct HttpSettings {
    /// Comma separated; unset disables CORS.
    pub cors_allowed_origins: Option<String>,
    pub log_request_body: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<LedgerService>,
    pub billing: Arc<BillingService>,
    pub wallets: Arc<WalletService>,
    pub rates: Arc<ExchangeRateService>,
    pub stripe_events: Arc<StripeEventRouter>,
    pub flags: FeatureFlagService,
    pub accounts: Arc<dyn AccountRepository>,
    pub webhook_verifier: StripeWebhookVerifier,
    pub health: HealthChecks,
    pub http: HttpSettings,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        services: &Services,
        accounts: Arc<dyn AccountRepository>,
        webhook_verifier: StripeWebhookVerifier,
        health: HealthChecks,
        http: HttpSettings,
    ) -> Self {
        Self {
            ledger: services.ledger.clone(),
            billing: services.billing.clone(),
            wallets: services.wallets.clone(),
            rates: services.rates.clone(),
            stripe_events: services.stripe_events.clone(),
            flags: services.flags.clone(),
            accounts,
            webhook_verifier,
            health,
            http,
            start_time: Instant::now(),
        }
    }

    pub async fn is_admin(&self, user_id: Uuid) -> Result<bool, AppError> {
        Ok(self.accounts.get_account(user_id).await?.is_admin)
    }

    pub async fn require_admin(&self, user_id: Uuid) -> Result<(), AppError> {
        if self.is_admin(user_id).await? {
            Ok(())
        } else {
            Err(AppError::Forbidden("admin only".to_string()))
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    let http = state.http.clone();

    let router = Router::new()
        .route("/health", get(handlers::health))
        .route("/webhooks/stripe", post(handlers::webhook::stripe))
        .route("/credits", post(handlers::payments::add_credit))
        .route("/currency", put(handlers::payments::set_currency))
        .route("/balances/:currency", get(handlers::payments::balance))
        .route("/deltas", get(handlers::payments::deltas))
        .route("/transactions/:id", get(handlers::payments::get_transaction))
        .route("/donations", post(handlers::payments::donate))
        .route("/payouts", post(handlers::payments::payout))
        .route("/refunds", post(handlers::payments::refund))
        .route(
            "/appreciations",
            get(handlers::payments::appreciations).post(handlers::payments::appreciate),
        )
        .route("/rates/quote", get(handlers::payments::quote))
        .route("/wallet", get(handlers::wallet::get_wallet))
        .route("/wallet/challenge", post(handlers::wallet::challenge))
        .route("/wallet/verify", post(handlers::wallet::verify))
        .route("/wallet/reset", post(handlers::wallet::reset))
        .route("/wallet/:id", delete(handlers::wallet::delete))
        .route("/circles/:id/prices", post(handlers::circles::publish_price))
        .route(
            "/circles/:id/subscription",
            post(handlers::circles::subscribe)
                .put(handlers::circles::change_price)
                .delete(handlers::circles::unsubscribe),
        )
        .route("/subscription", get(handlers::circles::my_subscription))
        .route("/subscriptions/:id", delete(handlers::circles::cancel_subscription))
        .route("/invoices/:id/coupon", post(handlers::circles::apply_coupon))
        .route("/admin/feature-flags", get(handlers::payments::list_flags))
        .route("/admin/feature-flags/:name", put(handlers::payments::update_flag))
        .layer(axum::middleware::from_fn_with_state(
            RequestLogSettings {
                log_body: http.log_request_body,
            },
            request_logger_middleware,
        ))
        .with_state(state);

    match cors_layer(http.cors_allowed_origins.as_deref()) {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

fn cors_layer(origins: Option<&str>) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = origins?
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    if origins.is_empty() {
        return None;
    }
    Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}
