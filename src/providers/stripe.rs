use async_trait::async_trait;
use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use chrono::{DateTime, Utc};
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use hmac::{Hmac, Mac};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::{
    ChargeDirection, ChargeReceipt, ChargeRequest, ConfirmLookup, Confirmation, InvoiceCharge,
    LookupKind, PaymentProvider, ProviderError, ProviderOutcome, ProviderSubscription,
    RefundRequest, Retryable, SubscriptionGateway,
};
use crate::domain::{Currency, ProviderKind};

type Breaker = StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>;

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    status: String,
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Transfer {
    id: String,
    #[serde(default)]
    reversed: bool,
}

#[derive(Debug, Deserialize)]
struct Refund {
    id: String,
    status: String,
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SearchResult<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Object {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Subscription {
    id: String,
    items: SearchResult<Object>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: Option<String>,
    code: Option<String>,
}

/// Card-network client. One instance serves both one-off charges and subscriptions.
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    base_url: String,
    secret_key: String,
    circuit_breaker: Breaker,
}

impl StripeClient {
    pub fn new(base_url: String, secret_key: String, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        let backoff = backoff::equal_jittered(Duration::from_secs(30), Duration::from_secs(60));
        let policy = failure_policy::consecutive_failures(5, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        Self {
            client,
            base_url,
            secret_key,
            circuit_breaker,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path)).bearer_auth(&self.secret_key)
    }

    fn post(&self, path: &str, idempotency_key: Option<&str>) -> RequestBuilder {
        let request = self.client.post(self.url(path)).bearer_auth(&self.secret_key);
        match idempotency_key {
            Some(key) => request.header("Idempotency-Key", key),
            None => request,
        }
    }

    fn delete(&self, path: &str) -> RequestBuilder {
        self.client.delete(self.url(path)).bearer_auth(&self.secret_key)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ProviderError> {
        let call = async move {
            let response = request.send().await?;
            let status = response.status();
            if status.is_success() {
                return response
                    .json::<T>()
                    .await
                    .map_err(|e| ProviderError::InvalidResponse(e.to_string()));
            }
            let body = response.text().await.unwrap_or_default();
            Err(error_from_status(status, &body))
        };

        match self.circuit_breaker.call_with(is_transient, call).await {
            Ok(value) => Ok(value),
            Err(FailsafeError::Rejected) => Err(ProviderError::Unavailable(
                "stripe circuit breaker is open".to_string(),
            )),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }

    async fn get_payment_intent(&self, id: &str) -> Result<Confirmation, ProviderError> {
        let intent: PaymentIntent = self.send(self.get(&format!("payment_intents/{}", id))).await?;
        Ok(Confirmation {
            provider_ref: Some(intent.id),
            outcome: intent_outcome(&intent.status),
            chain: None,
        })
    }

    /// Transfers carry the correlation id as their transfer group.
    async fn find_transfer(&self, correlation_id: Uuid) -> Result<Confirmation, ProviderError> {
        let group = correlation_id.to_string();
        let result: SearchResult<Transfer> = self
            .send(self.get("transfers").query(&[("transfer_group", group.as_str()), ("limit", "1")]))
            .await?;

        let transfer = result
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::NotFound(group))?;
        Ok(transfer_confirmation(transfer))
    }

    /// Refunds cannot be searched, so the most recent page is scanned for the
    /// correlation metadata.
    async fn find_refund(&self, correlation_id: Uuid) -> Result<Confirmation, ProviderError> {
        let wanted = correlation_id.to_string();
        let result: SearchResult<Refund> = self
            .send(self.get("refunds").query(&[("limit", "100")]))
            .await?;

        let refund = result
            .data
            .into_iter()
            .find(|refund| refund.metadata.get("correlation_id") == Some(&wanted))
            .ok_or_else(|| ProviderError::NotFound(wanted))?;
        Ok(Confirmation {
            outcome: refund_outcome(&refund.status),
            provider_ref: Some(refund.id),
            chain: None,
        })
    }

    async fn search_by_correlation(&self, correlation_id: Uuid) -> Result<Confirmation, ProviderError> {
        let query = format!("metadata['correlation_id']:'{}'", correlation_id);
        let result: SearchResult<PaymentIntent> = self
            .send(self.get("payment_intents/search").query(&[("query", query)]))
            .await?;

        let intent = result
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::NotFound(correlation_id.to_string()))?;

        Ok(Confirmation {
            provider_ref: Some(intent.id),
            outcome: intent_outcome(&intent.status),
            chain: None,
        })
    }
}

fn is_transient(error: &ProviderError) -> bool {
    error.is_retryable()
}

fn error_from_status(status: StatusCode, body: &str) -> ProviderError {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .map(|b| {
            b.error
                .code
                .or(b.error.message)
                .unwrap_or_else(|| status.to_string())
        })
        .unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
        StatusCode::NOT_FOUND => ProviderError::NotFound(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Misconfigured(detail),
        StatusCode::REQUEST_TIMEOUT => ProviderError::Timeout(detail),
        s if s.is_server_error() => ProviderError::Unavailable(detail),
        _ => ProviderError::Declined(detail),
    }
}

fn transfer_confirmation(transfer: Transfer) -> Confirmation {
    Confirmation {
        outcome: if transfer.reversed {
            ProviderOutcome::Failed
        } else {
            ProviderOutcome::Succeeded
        },
        provider_ref: Some(transfer.id),
        chain: None,
    }
}

fn intent_outcome(status: &str) -> ProviderOutcome {
    match status {
        "succeeded" => ProviderOutcome::Succeeded,
        "canceled" => ProviderOutcome::Canceled,
        _ => ProviderOutcome::Pending,
    }
}

fn refund_outcome(status: &str) -> ProviderOutcome {
    match status {
        "succeeded" => ProviderOutcome::Succeeded,
        "failed" => ProviderOutcome::Failed,
        "canceled" => ProviderOutcome::Canceled,
        _ => ProviderOutcome::Pending,
    }
}

/// Fiat amounts go over the wire in minor units.
pub fn to_minor_units(amount: &BigDecimal) -> Result<i64, ProviderError> {
    (amount * BigDecimal::from(100))
        .round(0)
        .to_i64()
        .ok_or_else(|| ProviderError::InvalidResponse(format!("amount {} out of range", amount)))
}

fn currency_code(currency: Currency) -> Result<String, ProviderError> {
    if !currency.is_fiat() {
        return Err(ProviderError::Declined(format!(
            "{} is not a card currency",
            currency
        )));
    }
    Ok(currency.as_str().to_ascii_lowercase())
}

#[async_trait]
impl PaymentProvider for StripeClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Stripe
    }

    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, ProviderError> {
        let amount = to_minor_units(&request.amount)?.to_string();
        let currency = currency_code(request.currency)?;
        let correlation_id = request.correlation_id.to_string();

        let mut form: Vec<(&str, String)> = vec![
            ("amount", amount),
            ("currency", currency),
            ("metadata[correlation_id]", correlation_id.clone()),
        ];
        if let Some(description) = &request.description {
            form.push(("description", description.clone()));
        }

        match &request.direction {
            ChargeDirection::Collect { customer_ref } => {
                if let Some(customer) = customer_ref {
                    form.push(("customer", customer.clone()));
                }
                form.push(("automatic_payment_methods[enabled]", "true".to_string()));

                let intent: PaymentIntent = self
                    .send(self.post("payment_intents", Some(&correlation_id)).form(&form))
                    .await?;
                Ok(ChargeReceipt {
                    outcome: intent_outcome(&intent.status),
                    provider_ref: Some(intent.id),
                    client_secret: intent.client_secret,
                })
            }
            ChargeDirection::Disburse { destination } => {
                form.push(("destination", destination.clone()));
                form.push(("transfer_group", correlation_id.clone()));

                let transfer: Transfer = self
                    .send(self.post("transfers", Some(&correlation_id)).form(&form))
                    .await?;
                Ok(ChargeReceipt {
                    provider_ref: Some(transfer.id),
                    outcome: if transfer.reversed {
                        ProviderOutcome::Failed
                    } else {
                        ProviderOutcome::Succeeded
                    },
                    client_secret: None,
                })
            }
        }
    }

    async fn confirm(&self, lookup: &ConfirmLookup) -> Result<Confirmation, ProviderError> {
        match (lookup.provider_ref.as_deref(), lookup.kind) {
            (Some(id), _) if id.starts_with("tr_") => {
                let transfer: Transfer = self.send(self.get(&format!("transfers/{}", id))).await?;
                Ok(transfer_confirmation(transfer))
            }
            (Some(id), _) if id.starts_with("re_") => {
                let refund: Refund = self.send(self.get(&format!("refunds/{}", id))).await?;
                Ok(Confirmation {
                    outcome: refund_outcome(&refund.status),
                    provider_ref: Some(refund.id),
                    chain: None,
                })
            }
            (Some(id), _) => self.get_payment_intent(id).await,
            (None, LookupKind::Charge) => self.search_by_correlation(lookup.correlation_id).await,
            (None, LookupKind::Payout) => self.find_transfer(lookup.correlation_id).await,
            (None, LookupKind::Refund) => self.find_refund(lookup.correlation_id).await,
        }
    }

    async fn refund(&self, request: &RefundRequest) -> Result<ChargeReceipt, ProviderError> {
        let correlation_id = request.correlation_id.to_string();
        let form = vec![
            ("payment_intent", request.charge_ref.clone()),
            ("amount", to_minor_units(&request.amount)?.to_string()),
            ("metadata[correlation_id]", correlation_id.clone()),
        ];
        let refund: Refund = self
            .send(self.post("refunds", Some(&correlation_id)).form(&form))
            .await?;
        Ok(ChargeReceipt {
            outcome: refund_outcome(&refund.status),
            provider_ref: Some(refund.id),
            client_secret: None,
        })
    }
}

#[async_trait]
impl SubscriptionGateway for StripeClient {
    async fn create_customer(&self, user_id: Uuid) -> Result<String, ProviderError> {
        let form = vec![("metadata[user_id]", user_id.to_string())];
        let customer: Object = self
            .send(self.post("customers", Some(&format!("customer-{}", user_id))).form(&form))
            .await?;
        Ok(customer.id)
    }

    async fn create_subscription(
        &self,
        customer_ref: &str,
        price_ref: &str,
        trial_end: Option<DateTime<Utc>>,
    ) -> Result<ProviderSubscription, ProviderError> {
        let mut form = vec![
            ("customer", customer_ref.to_string()),
            ("items[0][price]", price_ref.to_string()),
        ];
        if let Some(trial_end) = trial_end {
            form.push(("trial_end", trial_end.timestamp().to_string()));
        }

        let subscription: Subscription =
            self.send(self.post("subscriptions", None).form(&form)).await?;
        let item = subscription.items.data.into_iter().next().ok_or_else(|| {
            ProviderError::InvalidResponse("subscription without items".to_string())
        })?;

        Ok(ProviderSubscription {
            subscription_ref: subscription.id,
            item_ref: item.id,
        })
    }

    async fn add_item(&self, subscription_ref: &str, price_ref: &str) -> Result<String, ProviderError> {
        let form = vec![
            ("subscription", subscription_ref.to_string()),
            ("price", price_ref.to_string()),
            ("proration_behavior", "none".to_string()),
        ];
        let item: Object = self.send(self.post("subscription_items", None).form(&form)).await?;
        Ok(item.id)
    }

    async fn swap_item(&self, item_ref: &str, price_ref: &str) -> Result<String, ProviderError> {
        let form = vec![
            ("price", price_ref.to_string()),
            ("proration_behavior", "none".to_string()),
        ];
        let item: Object = self
            .send(self.post(&format!("subscription_items/{}", item_ref), None).form(&form))
            .await?;
        Ok(item.id)
    }

    async fn remove_item(&self, item_ref: &str) -> Result<(), ProviderError> {
        let _: Object = self
            .send(self.delete(&format!("subscription_items/{}", item_ref)))
            .await?;
        Ok(())
    }

    async fn cancel_subscription(&self, subscription_ref: &str) -> Result<(), ProviderError> {
        let _: Object = self
            .send(self.delete(&format!("subscriptions/{}", subscription_ref)))
            .await?;
        Ok(())
    }

    async fn create_price(
        &self,
        circle_id: Uuid,
        amount: &BigDecimal,
        currency: Currency,
    ) -> Result<String, ProviderError> {
        let form = vec![
            ("unit_amount", to_minor_units(amount)?.to_string()),
            ("currency", currency_code(currency)?),
            ("recurring[interval]", "month".to_string()),
            ("product_data[name]", format!("circle {}", circle_id)),
            ("metadata[circle_id]", circle_id.to_string()),
        ];
        let price: Object = self.send(self.post("prices", None).form(&form)).await?;
        Ok(price.id)
    }

    async fn create_invoice(&self, charge: &InvoiceCharge) -> Result<String, ProviderError> {
        let invoice_key = charge.invoice_id.to_string();
        let currency = currency_code(charge.currency)?;

        if charge.discount > BigDecimal::zero() {
            let form = vec![
                ("customer", charge.customer_ref.clone()),
                ("subscription", charge.subscription_ref.clone()),
                ("amount", (-to_minor_units(&charge.discount)?).to_string()),
                ("currency", currency.clone()),
                ("description", "coupon".to_string()),
            ];
            let _: Object = self
                .send(
                    self.post("invoiceitems", Some(&format!("{}-discount", invoice_key)))
                        .form(&form),
                )
                .await?;
        }

        let form = vec![
            ("customer", charge.customer_ref.clone()),
            ("subscription", charge.subscription_ref.clone()),
            ("auto_advance", "true".to_string()),
            ("metadata[invoice_id]", invoice_key.clone()),
        ];
        let invoice: Object = self
            .send(self.post("invoices", Some(&invoice_key)).form(&form))
            .await?;
        Ok(invoice.id)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WebhookError {
    #[error("missing Stripe-Signature header")]
    MissingHeader,
    #[error("malformed Stripe-Signature header")]
    MalformedHeader,
    #[error("timestamp outside the tolerance window")]
    TimestampOutsideTolerance,
    #[error("no matching v1 signature")]
    SignatureMismatch,
    #[error("webhook secret cannot key HMAC")]
    InvalidSecret,
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

/// Checks `Stripe-Signature` before any payload is trusted.
#[derive(Clone)]
pub struct StripeWebhookVerifier {
    secret: String,
    tolerance: chrono::Duration,
}

impl StripeWebhookVerifier {
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            tolerance: chrono::Duration::seconds(300),
        }
    }

    pub fn verify(
        &self,
        header: Option<&str>,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Result<StripeEvent, WebhookError> {
        let header = header.ok_or(WebhookError::MissingHeader)?;

        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => {
                    timestamp = Some(
                        value
                            .parse::<i64>()
                            .map_err(|_| WebhookError::MalformedHeader)?,
                    )
                }
                Some(("v1", value)) => signatures.push(value.to_string()),
                _ => {}
            }
        }
        let timestamp = timestamp.ok_or(WebhookError::MalformedHeader)?;
        if signatures.is_empty() {
            return Err(WebhookError::MalformedHeader);
        }

        let tolerance = u64::try_from(self.tolerance.num_seconds()).unwrap_or(0);
        if now.timestamp().abs_diff(timestamp) > tolerance {
            return Err(WebhookError::TimestampOutsideTolerance);
        }

        let mac = signing_mac(&self.secret, timestamp, payload)?;
        let matched = signatures.iter().any(|candidate| {
            let Ok(expected) = hex::decode(candidate) else {
                return false;
            };
            mac.clone().verify_slice(&expected).is_ok()
        });
        if !matched {
            return Err(WebhookError::SignatureMismatch);
        }

        serde_json::from_slice(payload).map_err(|e| WebhookError::InvalidPayload(e.to_string()))
    }
}

fn signing_mac(secret: &str, timestamp: i64, payload: &[u8]) -> Result<Hmac<Sha256>, WebhookError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::InvalidSecret)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Builds a `Stripe-Signature` value the way Stripe does.
pub fn signature_header(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, WebhookError> {
    let signature = hex::encode(signing_mac(secret, timestamp, payload)?.finalize().into_bytes());
    Ok(format!("t={},v1={}", timestamp, signature))
}
