//! Settles on-chain donations once their transfer is confirmed.
//!
//! Messages carry only `{ "txId": ... }`. The transaction row is the source of truth
//! for the hash, sender and recipient; the receipt must agree with it before the
//! donation is marked succeeded.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::MessageHandler;
use crate::domain::{
    BlockchainCurationEvent, BlockchainTransaction, ProviderKind, SettlementOutcome, Transaction,
};
use crate::error::AppError;
use crate::ports::{LedgerRepository, WalletRepository};
use crate::providers::blockchain::to_token_units;
use crate::providers::{
    with_timeout, ChainReceipt, ConfirmLookup, PaymentProvider, ProviderError, RetryPolicy,
};
use crate::queue::Envelope;
use crate::services::LedgerService;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementMessage {
    pub tx_id: Uuid,
}

pub struct BlockchainSettlementHandler {
    ledger: Arc<dyn LedgerRepository>,
    ledger_service: Arc<LedgerService>,
    wallets: Arc<dyn WalletRepository>,
    chain: Arc<dyn PaymentProvider>,
    retry: RetryPolicy,
    token_decimals: u32,
    provider_timeout: Duration,
}

impl BlockchainSettlementHandler {
    pub fn new(
        ledger: Arc<dyn LedgerRepository>,
        ledger_service: Arc<LedgerService>,
        wallets: Arc<dyn WalletRepository>,
        chain: Arc<dyn PaymentProvider>,
        retry: RetryPolicy,
        token_decimals: u32,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            ledger_service,
            wallets,
            chain,
            retry,
            token_decimals,
            provider_timeout,
        }
    }

    /// Settles one transaction. Duplicate deliveries of an already settled transaction
    /// are no-ops.
    pub async fn settle_transaction(&self, tx_id: Uuid) -> Result<(), AppError> {
        let tx = self.ledger.get_transaction(tx_id).await?;
        if tx.state.is_terminal() {
            info!(transaction_id = %tx.id, state = %tx.state, "Duplicate settlement message");
            return Ok(());
        }
        if tx.provider != ProviderKind::Blockchain {
            return Err(AppError::Validation(format!(
                "transaction {} settles through {}, not the chain",
                tx.id, tx.provider
            )));
        }

        let lookup = ConfirmLookup::for_transaction(&tx);
        let chain = self.chain.as_ref();
        let timeout = self.provider_timeout;
        let confirmation = match self
            .retry
            .run("confirm chain transfer", || {
                with_timeout(timeout, "confirm", chain.confirm(&lookup))
            })
            .await
        {
            Ok(confirmation) => confirmation,
            Err(ProviderError::NotFound(reason)) => {
                warn!(transaction_id = %tx.id, reason = %reason, "Transfer cannot be located");
                self.ledger_service
                    .settle(tx.id, SettlementOutcome::Failed)
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let outcome = match confirmation.outcome.settlement() {
            Some(outcome) => outcome,
            None => {
                return Err(ProviderError::Unavailable(format!(
                    "transfer {} not mined yet",
                    lookup.provider_ref.as_deref().unwrap_or("?")
                ))
                .into())
            }
        };

        if outcome != SettlementOutcome::Succeeded {
            warn!(transaction_id = %tx.id, outcome = ?outcome, "Transfer did not succeed on chain");
            self.ledger_service.settle(tx.id, outcome).await?;
            return Ok(());
        }

        let receipt = confirmation.chain.ok_or_else(|| {
            AppError::Provider(ProviderError::InvalidResponse(
                "succeeded transfer without a receipt".to_string(),
            ))
        })?;

        let recipient_address = match self.check_receipt(&tx, &receipt).await? {
            ReceiptCheck::Matches { recipient_address } => recipient_address,
            ReceiptCheck::Mismatch(reason) => {
                warn!(transaction_id = %tx.id, tx_hash = %receipt.tx_hash, reason = %reason, "Receipt does not match transaction");
                self.ledger_service
                    .settle(tx.id, SettlementOutcome::Failed)
                    .await?;
                return Ok(());
            }
        };

        let (record, events) = chain_records(&tx, &receipt, &recipient_address);
        self.ledger.record_chain_receipt(&record, &events).await?;
        self.ledger_service
            .settle(tx.id, SettlementOutcome::Succeeded)
            .await?;
        info!(
            transaction_id = %tx.id,
            tx_hash = %receipt.tx_hash,
            block_number = receipt.block_number,
            "On-chain donation settled"
        );
        Ok(())
    }

    /// The sender's wallet must have sent the transfer, and a curation log must pay the
    /// recipient's wallet the recorded amount.
    async fn check_receipt(
        &self,
        tx: &Transaction,
        receipt: &ChainReceipt,
    ) -> Result<ReceiptCheck, AppError> {
        let (Some(sender), Some(recipient)) = (tx.sender_id, tx.recipient_id) else {
            return Ok(ReceiptCheck::Mismatch("donation without both participants".to_string()));
        };

        let Some(sender_wallet) = self.wallets.active_wallet_for_user(sender).await? else {
            return Ok(ReceiptCheck::Mismatch(format!("sender {} has no wallet", sender)));
        };
        if sender_wallet.address != receipt.from {
            return Ok(ReceiptCheck::Mismatch(format!(
                "sent from {}, sender wallet is {}",
                receipt.from, sender_wallet.address
            )));
        }

        let Some(recipient_wallet) = self.wallets.active_wallet_for_user(recipient).await? else {
            return Ok(ReceiptCheck::Mismatch(format!("recipient {} has no wallet", recipient)));
        };

        let expected = to_token_units(&tx.amount, self.token_decimals);
        let paid = receipt.curations.iter().any(|log| {
            log.creator == recipient_wallet.address && log.amount == expected
        });
        if !paid {
            return Ok(ReceiptCheck::Mismatch(format!(
                "no curation of {} units to {}",
                expected, recipient_wallet.address
            )));
        }
        Ok(ReceiptCheck::Matches {
            recipient_address: recipient_wallet.address,
        })
    }
}

enum ReceiptCheck {
    Matches { recipient_address: String },
    Mismatch(String),
}

fn chain_records(
    tx: &Transaction,
    receipt: &ChainReceipt,
    recipient_address: &str,
) -> (BlockchainTransaction, Vec<BlockchainCurationEvent>) {
    let now = Utc::now();
    let record = BlockchainTransaction {
        id: Uuid::new_v4(),
        chain_id: receipt.chain_id,
        tx_hash: receipt.tx_hash.clone(),
        from_address: receipt.from.clone(),
        to_address: receipt.to.clone(),
        block_number: receipt.block_number,
        transaction_id: Some(tx.id),
        created_at: now,
    };

    let events = receipt
        .curations
        .iter()
        .map(|log| BlockchainCurationEvent {
            id: Uuid::new_v4(),
            blockchain_transaction_id: record.id,
            curator_address: log.curator.clone(),
            creator_address: log.creator.clone(),
            creator_id: tx.recipient_id.filter(|_| log.creator == recipient_address),
            token_address: log.token.clone(),
            uri: log.uri.clone(),
            amount: log.amount.clone(),
            created_at: now,
        })
        .collect();

    (record, events)
}

#[async_trait]
impl MessageHandler for BlockchainSettlementHandler {
    fn name(&self) -> &'static str {
        "blockchain-settlement"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), AppError> {
        let message: SettlementMessage = envelope
            .payload_as()
            .map_err(|e| AppError::Validation(format!("invalid settlement message: {}", e)))?;
        self.settle_transaction(message.tx_id).await
    }
}
