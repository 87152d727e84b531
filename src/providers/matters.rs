use async_trait::async_trait;

use super::{
    ChargeReceipt, ChargeRequest, ConfirmLookup, Confirmation, PaymentProvider, ProviderError,
    ProviderOutcome, RefundRequest,
};
use crate::domain::{Currency, ProviderKind};

/// In-platform token rail. Movements are ledger rows only, so every call settles
/// immediately.
#[derive(Debug, Clone, Default)]
pub struct MattersProvider;

#[async_trait]
impl PaymentProvider for MattersProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Matters
    }

    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, ProviderError> {
        if request.currency == Currency::Like {
            return Err(ProviderError::Declined(
                "LIKE cannot move in-platform".to_string(),
            ));
        }
        Ok(ChargeReceipt {
            provider_ref: None,
            outcome: ProviderOutcome::Succeeded,
            client_secret: None,
        })
    }

    async fn confirm(&self, lookup: &ConfirmLookup) -> Result<Confirmation, ProviderError> {
        Ok(Confirmation {
            provider_ref: lookup.provider_ref.clone(),
            outcome: ProviderOutcome::Succeeded,
            chain: None,
        })
    }

    async fn refund(&self, _request: &RefundRequest) -> Result<ChargeReceipt, ProviderError> {
        Ok(ChargeReceipt {
            provider_ref: None,
            outcome: ProviderOutcome::Succeeded,
            client_secret: None,
        })
    }
}
