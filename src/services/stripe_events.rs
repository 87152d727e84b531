//! Applies verified Stripe webhook events to the ledger and billing engine.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{ProviderKind, SettlementOutcome};
use crate::error::AppError;
use crate::ports::LedgerRepository;
use crate::providers::stripe::StripeEvent;
use crate::services::billing::BillingService;
use crate::services::ledger::{LedgerService, SettleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    Applied,
    /// Known event type whose target no longer needs updating.
    Unchanged,
    Ignored,
}

pub struct StripeEventRouter {
    ledger: Arc<dyn LedgerRepository>,
    ledger_service: Arc<LedgerService>,
    billing: Arc<BillingService>,
}

impl StripeEventRouter {
    pub fn new(
        ledger: Arc<dyn LedgerRepository>,
        ledger_service: Arc<LedgerService>,
        billing: Arc<BillingService>,
    ) -> Self {
        Self {
            ledger,
            ledger_service,
            billing,
        }
    }

    pub async fn handle(&self, event: &StripeEvent) -> Result<EventDisposition, AppError> {
        let object = &event.data.object;
        debug!(event_id = %event.id, event_type = %event.event_type, "Handling Stripe event");

        match event.event_type.as_str() {
            "payment_intent.succeeded" => self.settle(object, SettlementOutcome::Succeeded).await,
            "payment_intent.payment_failed" => self.settle(object, SettlementOutcome::Failed).await,
            "payment_intent.canceled" => self.settle(object, SettlementOutcome::Canceled).await,
            "refund.updated" | "charge.refund.updated" => {
                match object.get("status").and_then(Value::as_str) {
                    Some("succeeded") => self.settle(object, SettlementOutcome::Succeeded).await,
                    Some("failed") => self.settle(object, SettlementOutcome::Failed).await,
                    Some("canceled") => self.settle(object, SettlementOutcome::Canceled).await,
                    _ => Ok(EventDisposition::Unchanged),
                }
            }
            "transfer.reversed" => {
                let id = object_id(object)?;
                warn!(alert = true, transfer_id = %id, "Payout transfer was reversed");
                Ok(EventDisposition::Unchanged)
            }
            "invoice.paid" | "invoice.payment_succeeded" => match self.invoice_id(object).await? {
                Some(invoice_id) => {
                    self.billing.handle_invoice_paid(invoice_id).await?;
                    Ok(EventDisposition::Applied)
                }
                None => Ok(EventDisposition::Unchanged),
            },
            "invoice.payment_failed" => match self.invoice_id(object).await? {
                Some(invoice_id) => {
                    self.billing.handle_invoice_payment_failed(invoice_id).await?;
                    Ok(EventDisposition::Applied)
                }
                None => Ok(EventDisposition::Unchanged),
            },
            "customer.subscription.deleted" => {
                let id = object_id(object)?;
                self.billing.handle_subscription_deleted(id).await?;
                Ok(EventDisposition::Applied)
            }
            other => {
                debug!(event_type = other, "Ignoring Stripe event");
                Ok(EventDisposition::Ignored)
            }
        }
    }

    /// Finds the ledger row by the correlation id we sent as metadata, falling back to
    /// the provider reference.
    async fn settle(&self, object: &Value, outcome: SettlementOutcome) -> Result<EventDisposition, AppError> {
        let provider_ref = object_id(object)?;

        let tx = match metadata_uuid(object, "correlation_id") {
            Some(id) => Some(self.ledger_service.get_transaction(id).await?),
            None => {
                self.ledger
                    .find_by_provider_ref(ProviderKind::Stripe, provider_ref)
                    .await?
            }
        };
        let Some(tx) = tx else {
            warn!(provider_ref, "Stripe event for an unknown transaction");
            return Ok(EventDisposition::Unchanged);
        };

        if tx.provider_tx_id.is_none() {
            self.ledger.attach_provider_ref(tx.id, provider_ref).await?;
        }

        match self.ledger_service.settle(tx.id, outcome).await? {
            SettleResult::Settled(tx) => {
                info!(transaction_id = %tx.id, state = %tx.state, provider_ref, "Settled from webhook");
                Ok(EventDisposition::Applied)
            }
            SettleResult::AlreadyTerminal(_) => Ok(EventDisposition::Unchanged),
        }
    }

    async fn invoice_id(&self, object: &Value) -> Result<Option<Uuid>, AppError> {
        if let Some(id) = metadata_uuid(object, "invoice_id") {
            return Ok(Some(id));
        }
        let provider_ref = object_id(object)?;
        Ok(self
            .billing
            .find_invoice_by_provider_ref(provider_ref)
            .await?
            .map(|invoice| invoice.id))
    }
}

fn object_id(object: &Value) -> Result<&str, AppError> {
    object
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation("event object has no id".to_string()))
}

fn metadata_uuid(object: &Value, key: &str) -> Option<Uuid> {
    object
        .get("metadata")
        .and_then(|metadata| metadata.get(key))
        .and_then(Value::as_str)
        .and_then(|value| Uuid::parse_str(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_correlation_metadata() {
        let id = Uuid::new_v4();
        let object = json!({ "id": "pi_1", "metadata": { "correlation_id": id.to_string() } });
        assert_eq!(metadata_uuid(&object, "correlation_id"), Some(id));
        assert_eq!(metadata_uuid(&object, "invoice_id"), None);
        assert_eq!(object_id(&object).unwrap(), "pi_1");
        assert!(object_id(&json!({})).is_err());
    }
}
