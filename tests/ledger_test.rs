mod common;

use bigdecimal::{BigDecimal, Zero};
use chrono::{Duration, Utc};
use uuid::Uuid;

use common::{dec, Harness, SETTLEMENT_QUEUE};
use settlement_core::domain::{
    Currency, PayoutAccount, ProviderKind, Purpose, SettlementOutcome, TransactionState,
};
use settlement_core::error::AppError;
use settlement_core::providers::blockchain::to_token_units;
use settlement_core::providers::{
    ChainReceipt, Confirmation, CurationLog, LookupKind, ProviderError, ProviderOutcome,
    RetryPolicy,
};
use settlement_core::services::{DonationRequest, SettleResult};
use settlement_core::workers::BlockchainSettlementHandler;

const SENDER_WALLET: &str = "0x1111111111111111111111111111111111111111";
const RECIPIENT_WALLET: &str = "0x2222222222222222222222222222222222222222";
const TX_HASH: &str = "0xabababababababababababababababababababababababababababababababab";

fn settlement_handler(h: &Harness) -> BlockchainSettlementHandler {
    BlockchainSettlementHandler::new(
        h.repositories.ledger.clone(),
        h.services.ledger.clone(),
        h.repositories.wallets.clone(),
        h.chain.clone(),
        RetryPolicy::no_retry(),
        18,
        std::time::Duration::from_secs(5),
    )
}

fn like_tip(recipient: Uuid, amount: &str) -> DonationRequest {
    DonationRequest {
        recipient_id: recipient,
        article_id: Uuid::new_v4(),
        amount: dec(amount),
        currency: Currency::Like,
        tx_hash: Some(TX_HASH.to_string()),
        remark: None,
    }
}

fn mined(amount: &str, creator: &str) -> Confirmation {
    Confirmation {
        provider_ref: Some(TX_HASH.to_string()),
        outcome: ProviderOutcome::Succeeded,
        chain: Some(ChainReceipt {
            chain_id: 10,
            tx_hash: TX_HASH.to_string(),
            from: SENDER_WALLET.to_string(),
            to: Some("0x3333333333333333333333333333333333333333".to_string()),
            block_number: 120,
            curations: vec![CurationLog {
                curator: SENDER_WALLET.to_string(),
                creator: creator.to_string(),
                token: None,
                uri: "ipfs://article".to_string(),
                amount: to_token_units(&dec(amount), 18),
            }],
        }),
    }
}

#[tokio::test]
async fn like_tip_settles_after_chain_confirmation() {
    let h = Harness::new().await;
    let (sender, recipient) = (h.user(), h.user());
    h.store.add_wallet(sender, SENDER_WALLET);
    h.store.add_wallet(recipient, RECIPIENT_WALLET);

    let tx = h
        .services
        .ledger
        .donate(sender, like_tip(recipient, "10"))
        .await
        .unwrap();
    assert_eq!(tx.state, TransactionState::Pending);
    assert_eq!(tx.provider, ProviderKind::Blockchain);
    assert_eq!(h.queue.ready_len(SETTLEMENT_QUEUE), 1);

    // Nothing moves while pending.
    let ledger = &h.services.ledger;
    assert!(ledger.balance_of(recipient, Currency::Like).await.unwrap().is_zero());

    h.chain.confirm_with(TX_HASH, Ok(mined("10", RECIPIENT_WALLET)));
    settlement_handler(&h).settle_transaction(tx.id).await.unwrap();

    let settled = ledger.get_transaction(tx.id).await.unwrap();
    assert_eq!(settled.state, TransactionState::Succeeded);
    assert_eq!(ledger.balance_of(sender, Currency::Like).await.unwrap(), dec("-10"));
    assert_eq!(ledger.balance_of(recipient, Currency::Like).await.unwrap(), dec("10"));

    assert_eq!(h.store.chain_receipts().len(), 1);
    let events = h.store.curation_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].creator_id, Some(recipient));
}

#[tokio::test]
async fn receipt_paying_someone_else_fails_the_tip() {
    let h = Harness::new().await;
    let (sender, recipient) = (h.user(), h.user());
    h.store.add_wallet(sender, SENDER_WALLET);
    h.store.add_wallet(recipient, RECIPIENT_WALLET);

    let tx = h
        .services
        .ledger
        .donate(sender, like_tip(recipient, "10"))
        .await
        .unwrap();
    h.chain.confirm_with(
        TX_HASH,
        Ok(mined("10", "0x4444444444444444444444444444444444444444")),
    );
    settlement_handler(&h).settle_transaction(tx.id).await.unwrap();

    let failed = h.services.ledger.get_transaction(tx.id).await.unwrap();
    assert_eq!(failed.state, TransactionState::Failed);
    assert!(h.store.chain_receipts().is_empty());
}

#[tokio::test]
async fn unmined_transfer_stays_pending_and_is_retryable() {
    let h = Harness::new().await;
    let (sender, recipient) = (h.user(), h.user());
    h.store.add_wallet(sender, SENDER_WALLET);
    h.store.add_wallet(recipient, RECIPIENT_WALLET);

    let tx = h
        .services
        .ledger
        .donate(sender, like_tip(recipient, "3"))
        .await
        .unwrap();
    h.chain.confirm_with(
        TX_HASH,
        Ok(Confirmation {
            provider_ref: Some(TX_HASH.to_string()),
            outcome: ProviderOutcome::Pending,
            chain: None,
        }),
    );

    let err = settlement_handler(&h)
        .settle_transaction(tx.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Provider(ProviderError::Unavailable(_))));
    let still = h.services.ledger.get_transaction(tx.id).await.unwrap();
    assert_eq!(still.state, TransactionState::Pending);
}

#[tokio::test]
async fn duplicate_tx_hash_is_rejected() {
    let h = Harness::new().await;
    let (sender, recipient) = (h.user(), h.user());

    h.services
        .ledger
        .donate(sender, like_tip(recipient, "1"))
        .await
        .unwrap();
    let err = h
        .services
        .ledger
        .donate(sender, like_tip(recipient, "1"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn like_tip_without_hash_is_invalid() {
    let h = Harness::new().await;
    let (sender, recipient) = (h.user(), h.user());
    let mut request = like_tip(recipient, "1");
    request.tx_hash = None;

    let err = h.services.ledger.donate(sender, request).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert!(h.store.transactions().is_empty());
}

#[tokio::test]
async fn in_platform_donation_is_instant_and_guarded() {
    let h = Harness::new().await;
    let (sender, recipient) = (h.user(), h.user());
    h.fund(sender, 50).await;

    let request = DonationRequest {
        recipient_id: recipient,
        article_id: Uuid::new_v4(),
        amount: dec("20"),
        currency: Currency::Hkd,
        tx_hash: None,
        remark: Some("thanks".to_string()),
    };
    let tx = h.services.ledger.donate(sender, request.clone()).await.unwrap();
    assert_eq!(tx.state, TransactionState::Succeeded);
    assert_eq!(tx.provider, ProviderKind::Matters);

    let ledger = &h.services.ledger;
    assert_eq!(ledger.balance_of(sender, Currency::Hkd).await.unwrap(), dec("30"));
    assert_eq!(ledger.balance_of(recipient, Currency::Hkd).await.unwrap(), dec("20"));

    let overdraft = DonationRequest {
        amount: dec("31"),
        ..request
    };
    let err = ledger.donate(sender, overdraft).await.unwrap_err();
    assert!(matches!(err, AppError::InsufficientBalance(_)));
    assert_eq!(ledger.balance_of(sender, Currency::Hkd).await.unwrap(), dec("30"));
}

#[tokio::test]
async fn settled_transactions_net_to_zero() {
    let h = Harness::new().await;
    let (a, b, c) = (h.user(), h.user(), h.user());
    h.fund(a, 100).await;

    for (from, to, amount) in [(a, b, "40"), (b, c, "15.5"), (a, c, "0.25")] {
        h.services
            .ledger
            .donate(
                from,
                DonationRequest {
                    recipient_id: to,
                    article_id: Uuid::new_v4(),
                    amount: dec(amount),
                    currency: Currency::Hkd,
                    tx_hash: None,
                    remark: None,
                },
            )
            .await
            .unwrap();
    }

    let imbalances = h.services.reconciliation.check_zero_sum().await.unwrap();
    assert!(imbalances.is_empty());

    let ledger = &h.services.ledger;
    let total = ledger.balance_of(b, Currency::Hkd).await.unwrap()
        + ledger.balance_of(c, Currency::Hkd).await.unwrap();
    assert_eq!(total, dec("40.25"));
}

#[tokio::test]
async fn settling_twice_leaves_the_first_outcome() {
    let h = Harness::new().await;
    let user = h.user();

    let credit = h
        .services
        .ledger
        .add_credit(user, dec("12"), Currency::Hkd)
        .await
        .unwrap();
    assert_eq!(credit.transaction.state, TransactionState::Pending);
    assert_eq!(credit.client_secret.as_deref(), Some("secret_test"));

    let ledger = &h.services.ledger;
    let first = ledger
        .settle(credit.transaction.id, SettlementOutcome::Succeeded)
        .await
        .unwrap();
    assert!(matches!(first, SettleResult::Settled(_)));

    let second = ledger
        .settle(credit.transaction.id, SettlementOutcome::Failed)
        .await
        .unwrap();
    assert!(matches!(second, SettleResult::AlreadyTerminal(_)));
    assert_eq!(second.transaction().state, TransactionState::Succeeded);

    let entries = h.store.audit_entries(credit.transaction.id);
    assert_eq!(entries.iter().filter(|e| e.action == "state_updated").count(), 1);
}

#[tokio::test]
async fn declined_card_fails_the_credit() {
    let h = Harness::new().await;
    let user = h.user();
    h.stripe
        .charge_with(Err(ProviderError::Declined("card_declined".to_string())));

    let err = h
        .services
        .ledger
        .add_credit(user, dec("12"), Currency::Hkd)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Provider(ProviderError::Declined(_))));

    let rows = h.store.transactions();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].state, TransactionState::Failed);
}

#[tokio::test]
async fn provider_timeout_leaves_credit_pending_for_the_sweep() {
    let h = Harness::new().await;
    let user = h.user();
    h.stripe
        .charge_with(Err(ProviderError::Timeout("stripe".to_string())));

    let err = h
        .services
        .ledger
        .add_credit(user, dec("12"), Currency::Hkd)
        .await
        .unwrap_err();
    assert_eq!(err.class(), settlement_core::error::ErrorClass::Provider { retryable: true });

    let tx = h.store.transactions().remove(0);
    assert_eq!(tx.state, TransactionState::Pending);

    // The provider later reports the charge as succeeded.
    h.stripe.confirm_with(
        &tx.id.to_string(),
        Ok(Confirmation {
            provider_ref: Some("pi_late".to_string()),
            outcome: ProviderOutcome::Succeeded,
            chain: None,
        }),
    );
    h.store.backdate_transaction(tx.id, Duration::hours(1));

    let report = h
        .services
        .reconciliation
        .sweep_stale_pending(Utc::now())
        .await
        .unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.settled, 1);

    let settled = h.services.ledger.get_transaction(tx.id).await.unwrap();
    assert_eq!(settled.state, TransactionState::Succeeded);
    assert_eq!(settled.provider_tx_id.as_deref(), Some("pi_late"));
}

#[tokio::test]
async fn sweep_cancels_pending_past_expiry_and_requeues_chain_rows() {
    let h = Harness::new().await;
    let (sender, recipient) = (h.user(), h.user());

    let credit = h
        .services
        .ledger
        .add_credit(sender, dec("5"), Currency::Hkd)
        .await
        .unwrap();
    let tip = h
        .services
        .ledger
        .donate(sender, like_tip(recipient, "2"))
        .await
        .unwrap();

    let provider_ref = credit.transaction.provider_tx_id.clone().unwrap();
    h.stripe.confirm_with(
        &provider_ref,
        Ok(Confirmation {
            provider_ref: Some(provider_ref.clone()),
            outcome: ProviderOutcome::Pending,
            chain: None,
        }),
    );
    h.store.backdate_transaction(credit.transaction.id, Duration::days(2));
    h.store.backdate_transaction(tip.id, Duration::hours(1));

    let report = h
        .services
        .reconciliation
        .sweep_stale_pending(Utc::now())
        .await
        .unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.canceled, 1);
    assert_eq!(report.requeued, 1);

    let canceled = h
        .services
        .ledger
        .get_transaction(credit.transaction.id)
        .await
        .unwrap();
    assert_eq!(canceled.state, TransactionState::Canceled);
    // One message from the donation, one from the sweep.
    assert_eq!(h.queue.ready_len(SETTLEMENT_QUEUE), 2);
}

#[tokio::test]
async fn sweep_fails_chain_transfers_that_outlive_the_expiry() {
    let h = Harness::new().await;
    let (sender, recipient) = (h.user(), h.user());
    let tip = h
        .services
        .ledger
        .donate(sender, like_tip(recipient, "2"))
        .await
        .unwrap();
    h.store.backdate_transaction(tip.id, Duration::days(30));

    let report = h
        .services
        .reconciliation
        .sweep_stale_pending(Utc::now())
        .await
        .unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.requeued, 0);

    let failed = h.services.ledger.get_transaction(tip.id).await.unwrap();
    assert_eq!(failed.state, TransactionState::Failed);
    // Only the donation's own message; nothing was republished.
    assert_eq!(h.queue.ready_len(SETTLEMENT_QUEUE), 1);

    let again = h
        .services
        .reconciliation
        .sweep_stale_pending(Utc::now())
        .await
        .unwrap();
    assert_eq!(again.examined, 0);
}

#[tokio::test]
async fn expired_chain_transfer_that_was_mined_is_left_pending() {
    let h = Harness::new().await;
    let (sender, recipient) = (h.user(), h.user());
    let tip = h
        .services
        .ledger
        .donate(sender, like_tip(recipient, "2"))
        .await
        .unwrap();
    h.chain.confirm_with(TX_HASH, Ok(mined("2", RECIPIENT_WALLET)));
    h.store.backdate_transaction(tip.id, Duration::days(30));

    let report = h
        .services
        .reconciliation
        .sweep_stale_pending(Utc::now())
        .await
        .unwrap();
    assert_eq!(report.still_pending, 1);
    assert_eq!(report.requeued, 0);
    let kept = h.services.ledger.get_transaction(tip.id).await.unwrap();
    assert_eq!(kept.state, TransactionState::Pending);
}

#[tokio::test]
async fn sweep_finds_a_payout_whose_transfer_call_timed_out() {
    let h = Harness::new().await;
    let user = h.user();
    h.fund(user, 800).await;
    h.store.add_payout_account(PayoutAccount {
        id: Uuid::new_v4(),
        user_id: user,
        provider: ProviderKind::Stripe,
        account_ref: "acct_1".to_string(),
        country: Some("HK".to_string()),
        currency: Currency::Hkd,
        capabilities_transfers: true,
        archived: false,
        created_at: Utc::now(),
    });

    h.stripe
        .charge_with(Err(ProviderError::Timeout("transfer".to_string())));
    let err = h.services.ledger.payout(user, dec("600")).await.unwrap_err();
    assert!(matches!(err, AppError::Provider(ProviderError::Timeout(_))));

    let payout = h
        .store
        .transactions()
        .into_iter()
        .find(|tx| tx.purpose == Purpose::Payout)
        .unwrap();
    assert_eq!(payout.state, TransactionState::Pending);
    assert!(payout.provider_tx_id.is_none());

    h.stripe.confirm_with(
        &payout.id.to_string(),
        Ok(Confirmation {
            provider_ref: Some("tr_late".to_string()),
            outcome: ProviderOutcome::Succeeded,
            chain: None,
        }),
    );
    h.store.backdate_transaction(payout.id, Duration::hours(1));

    let report = h
        .services
        .reconciliation
        .sweep_stale_pending(Utc::now())
        .await
        .unwrap();
    assert_eq!(report.settled, 1);

    let lookups = h.stripe.lookups.lock().unwrap().clone();
    assert_eq!(lookups.len(), 1);
    assert_eq!(lookups[0].kind, LookupKind::Payout);
    assert_eq!(lookups[0].correlation_id, payout.id);

    let settled = h.services.ledger.get_transaction(payout.id).await.unwrap();
    assert_eq!(settled.state, TransactionState::Succeeded);
    assert_eq!(settled.provider_tx_id.as_deref(), Some("tr_late"));
    assert_eq!(
        h.services
            .ledger
            .available_balance(user, Currency::Hkd)
            .await
            .unwrap(),
        dec("200")
    );
}

#[tokio::test]
async fn refund_reverses_a_donation_up_to_its_amount() {
    let h = Harness::new().await;
    let (donor, author) = (h.user(), h.user());
    h.fund(donor, 30).await;

    let donation = h
        .services
        .ledger
        .donate(
            donor,
            DonationRequest {
                recipient_id: author,
                article_id: Uuid::new_v4(),
                amount: dec("30"),
                currency: Currency::Hkd,
                tx_hash: None,
                remark: None,
            },
        )
        .await
        .unwrap();

    let ledger = &h.services.ledger;
    let partial = ledger.refund(donation.id, Some(dec("10"))).await.unwrap();
    assert_eq!(partial.purpose, Purpose::Refund);
    assert_eq!(partial.parent_id, Some(donation.id));
    assert_eq!(partial.sender_id, Some(author));
    assert_eq!(partial.recipient_id, Some(donor));
    assert_eq!(partial.state, TransactionState::Succeeded);

    let err = ledger.refund(donation.id, Some(dec("25"))).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let rest = ledger.refund(donation.id, None).await.unwrap();
    assert_eq!(rest.amount, dec("20"));
    assert_eq!(ledger.balance_of(author, Currency::Hkd).await.unwrap(), BigDecimal::zero());
    assert_eq!(ledger.balance_of(donor, Currency::Hkd).await.unwrap(), dec("30"));

    // The original is never touched.
    let original = ledger.get_transaction(donation.id).await.unwrap();
    assert_eq!(original, donation);
}

#[tokio::test]
async fn card_credit_refund_goes_through_stripe() {
    let h = Harness::new().await;
    let user = h.user();
    h.fund(user, 40).await;
    let credit = h.store.transactions().remove(0);

    let refund = h.services.ledger.refund(credit.id, None).await.unwrap();
    assert_eq!(refund.provider, ProviderKind::Stripe);
    assert_eq!(refund.state, TransactionState::Succeeded);

    let refunds = h.stripe.refunds.lock().unwrap().clone();
    assert_eq!(refunds.len(), 1);
    assert_eq!(Some(&refunds[0].charge_ref), credit.provider_tx_id.as_ref());
    assert_eq!(refunds[0].amount, dec("40"));
    assert_eq!(refunds[0].correlation_id, refund.id);
}

#[tokio::test]
async fn payout_requires_minimum_and_a_transfer_capable_account() {
    let h = Harness::new().await;
    let user = h.user();
    h.fund(user, 800).await;
    let ledger = &h.services.ledger;

    let err = ledger.payout(user, dec("499")).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = ledger.payout(user, dec("600")).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    h.store.add_payout_account(PayoutAccount {
        id: Uuid::new_v4(),
        user_id: user,
        provider: ProviderKind::Stripe,
        account_ref: "acct_1".to_string(),
        country: Some("HK".to_string()),
        currency: Currency::Hkd,
        capabilities_transfers: true,
        archived: false,
        created_at: Utc::now(),
    });

    let payout = ledger.payout(user, dec("600")).await.unwrap();
    assert_eq!(payout.state, TransactionState::Pending);
    assert_eq!(payout.sender_id, Some(user));
    // Pending outgoing money is already unavailable.
    assert_eq!(ledger.available_balance(user, Currency::Hkd).await.unwrap(), dec("200"));

    let err = ledger.payout(user, dec("500")).await.unwrap_err();
    assert!(matches!(err, AppError::InsufficientBalance(_)));
}

#[tokio::test]
async fn disabled_payment_flag_blocks_credit() {
    let h = Harness::new().await;
    let user = h.user();
    h.services
        .flags
        .update(
            settlement_core::domain::feature_flag::FLAG_PAYMENT,
            settlement_core::domain::FlagMode::Off,
        )
        .await
        .unwrap();

    let err = h
        .services
        .ledger
        .add_credit(user, dec("5"), Currency::Hkd)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
    assert_eq!(h.stripe.charge_count(), 0);
}

#[tokio::test]
async fn deltas_cover_both_sides_of_a_transfer() {
    let h = Harness::new().await;
    let (a, b) = (h.user(), h.user());
    h.fund(a, 10).await;
    h.services
        .ledger
        .donate(
            a,
            DonationRequest {
                recipient_id: b,
                article_id: Uuid::new_v4(),
                amount: dec("4"),
                currency: Currency::Hkd,
                tx_hash: None,
                remark: None,
            },
        )
        .await
        .unwrap();

    let rows = h
        .services
        .ledger
        .deltas_for(a, Some(Currency::Hkd))
        .await
        .unwrap();
    let sum: BigDecimal = rows.iter().map(|row| row.delta.clone()).sum();
    assert_eq!(sum, dec("6"));
    assert!(rows.iter().any(|row| row.delta == dec("-4")));
}
