mod common;

use chrono::{Duration, Utc};
use uuid::Uuid;

use common::{dec, Harness};
use settlement_core::domain::{
    Circle, CircleCoupon, CircleInvoice, CircleSubscription, CircleSubscriptionItem, Currency,
    InvoiceState, Purpose, SubscriptionState, TransactionState,
};
use settlement_core::error::AppError;
use settlement_core::ports::SubscriptionRepository;

struct Circles {
    owner: Uuid,
    circle: Uuid,
}

async fn circle_with_price(h: &Harness, amount: &str) -> Circles {
    circle_priced_in(h, amount, Currency::Usd).await
}

async fn circle_priced_in(h: &Harness, amount: &str, currency: Currency) -> Circles {
    let owner = h.user();
    let circle = Uuid::new_v4();
    h.store.add_circle(Circle {
        id: circle,
        owner_id: owner,
        name: "Reading room".to_string(),
    });
    h.services
        .billing
        .publish_price(owner, circle, dec(amount), currency)
        .await
        .unwrap();
    Circles { owner, circle }
}

async fn latest_invoice(h: &Harness, subscription: &CircleSubscription) -> CircleInvoice {
    h.repositories
        .subscriptions
        .latest_invoice(subscription.id)
        .await
        .unwrap()
        .expect("subscription has an invoice")
}

#[tokio::test]
async fn price_change_archives_the_old_item() {
    let h = Harness::new().await;
    let c = circle_with_price(&h, "5").await;
    let member = h.user();

    let subscription = h.services.billing.subscribe(member, c.circle, None).await.unwrap();
    assert_eq!(subscription.state, SubscriptionState::Active);

    let ten = h
        .services
        .billing
        .publish_price(c.owner, c.circle, dec("10"), Currency::Usd)
        .await
        .unwrap();
    let new_item = h.services.billing.change_price(member, c.circle).await.unwrap();
    assert_eq!(new_item.price_id, ten.id);

    let all = h.store.all_items(subscription.id);
    assert_eq!(all.len(), 2);
    let archived: Vec<_> = all.iter().filter(|item| item.archived).collect();
    assert_eq!(archived.len(), 1);
    assert!(archived[0].canceled_at.is_some());

    let active = h.services.billing.items_for(subscription.id).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, new_item.id);
    assert!(h.gateway.calls().iter().any(|call| call.starts_with("swap_item")));

    // Already on the active price: nothing to swap.
    let again = h.services.billing.change_price(member, c.circle).await.unwrap();
    assert_eq!(again.id, new_item.id);
    assert_eq!(h.store.all_items(subscription.id).len(), 2);
}

#[tokio::test]
async fn only_the_owner_publishes_fiat_prices() {
    let h = Harness::new().await;
    let c = circle_with_price(&h, "5").await;
    let stranger = h.user();

    let err = h
        .services
        .billing
        .publish_price(stranger, c.circle, dec("7"), Currency::Usd)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    let err = h
        .services
        .billing
        .publish_price(c.owner, c.circle, dec("7"), Currency::Like)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn further_circles_join_the_open_subscription() {
    let h = Harness::new().await;
    let first = circle_with_price(&h, "5").await;
    let second = circle_with_price(&h, "3").await;
    let member = h.user();

    let subscription = h.services.billing.subscribe(member, first.circle, None).await.unwrap();
    let same = h.services.billing.subscribe(member, second.circle, None).await.unwrap();
    assert_eq!(same.id, subscription.id);
    assert_eq!(h.services.billing.items_for(subscription.id).await.unwrap().len(), 2);

    let err = h
        .services
        .billing
        .subscribe(member, second.circle, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    h.services.billing.unsubscribe(member, second.circle).await.unwrap();
    let kept = h
        .repositories
        .subscriptions
        .get_subscription(subscription.id)
        .await
        .unwrap();
    assert_eq!(kept.state, SubscriptionState::Active);

    h.services.billing.unsubscribe(member, first.circle).await.unwrap();
    let canceled = h
        .repositories
        .subscriptions
        .get_subscription(subscription.id)
        .await
        .unwrap();
    assert_eq!(canceled.state, SubscriptionState::Canceled);
    assert!(canceled.canceled_at.is_some());
    assert!(h.services.billing.subscription_for(member).await.unwrap().is_none());
}

#[tokio::test]
async fn subscription_bills_in_a_single_currency() {
    let h = Harness::new().await;
    let usd = circle_with_price(&h, "5").await;
    let hkd = circle_priced_in(&h, "40", Currency::Hkd).await;
    let member = h.user();

    let subscription = h.services.billing.subscribe(member, usd.circle, None).await.unwrap();
    let err = h
        .services
        .billing
        .subscribe(member, hkd.circle, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(h.services.billing.items_for(subscription.id).await.unwrap().len(), 1);
    assert!(!h.gateway.calls().iter().any(|call| call.starts_with("add_item")));

    // Repricing the only circle into another currency is fine.
    h.services
        .billing
        .publish_price(usd.owner, usd.circle, dec("40"), Currency::Hkd)
        .await
        .unwrap();
    let moved = h.services.billing.change_price(member, usd.circle).await.unwrap();
    let price = h.repositories.subscriptions.get_price(moved.price_id).await.unwrap();
    assert_eq!(price.currency, Currency::Hkd);
}

#[tokio::test]
async fn paid_invoice_books_split_and_platform_fee() {
    let h = Harness::new().await;
    let c = circle_with_price(&h, "5").await;
    let member = h.user();
    let subscription = h.services.billing.subscribe(member, c.circle, None).await.unwrap();

    let draft = latest_invoice(&h, &subscription).await;
    assert_eq!(draft.state, InvoiceState::Draft);
    assert_eq!(draft.amount, dec("5"));

    h.store.backdate_invoice(draft.id, Duration::hours(2));
    let finalized = h.services.billing.finalize_due_invoices(Utc::now()).await.unwrap();
    assert_eq!(finalized, 1);
    let open = h.repositories.subscriptions.get_invoice(draft.id).await.unwrap();
    assert_eq!(open.state, InvoiceState::Open);
    assert!(open.provider_invoice_id.is_some());

    let recorded = h.services.billing.handle_invoice_paid(draft.id).await.unwrap();
    assert_eq!(recorded.len(), 2);
    let split = recorded
        .iter()
        .find(|tx| tx.purpose == Purpose::SubscriptionSplit)
        .unwrap();
    let fee = recorded
        .iter()
        .find(|tx| tx.purpose == Purpose::PlatformFee)
        .unwrap();
    assert_eq!(split.amount, dec("5"));
    assert_eq!(split.recipient_id, Some(c.owner));
    assert_eq!(split.state, TransactionState::Succeeded);
    assert_eq!(fee.amount, dec("1"));
    assert_eq!(fee.sender_id, Some(c.owner));
    assert_eq!(fee.parent_id, Some(split.id));

    let balance = h.services.ledger.balance_of(c.owner, Currency::Usd).await.unwrap();
    assert_eq!(balance, dec("4"));

    let paid = h.repositories.subscriptions.get_invoice(draft.id).await.unwrap();
    assert_eq!(paid.state, InvoiceState::Paid);

    // A redelivered notification books nothing new.
    let again = h.services.billing.handle_invoice_paid(draft.id).await.unwrap();
    assert!(again.is_empty());
    assert_eq!(h.store.transactions().len(), 2);
}

#[tokio::test]
async fn drafts_wait_for_the_grace_period() {
    let h = Harness::new().await;
    let c = circle_with_price(&h, "5").await;
    let member = h.user();
    let subscription = h.services.billing.subscribe(member, c.circle, None).await.unwrap();

    assert_eq!(h.services.billing.finalize_due_invoices(Utc::now()).await.unwrap(), 0);
    let draft = latest_invoice(&h, &subscription).await;
    assert_eq!(draft.state, InvoiceState::Draft);
    assert!(!h.gateway.calls().iter().any(|call| call.starts_with("create_invoice")));
}

#[tokio::test]
async fn coupons_apply_once_and_only_to_drafts() {
    let h = Harness::new().await;
    let c = circle_with_price(&h, "5").await;
    let other = circle_with_price(&h, "8").await;
    let member = h.user();
    let subscription = h.services.billing.subscribe(member, c.circle, None).await.unwrap();
    let draft = latest_invoice(&h, &subscription).await;

    let half = Uuid::new_v4();
    h.store.add_coupon(CircleCoupon {
        id: half,
        circle_id: c.circle,
        percent_off: dec("50"),
        valid_until: None,
    });
    let foreign = Uuid::new_v4();
    h.store.add_coupon(CircleCoupon {
        id: foreign,
        circle_id: other.circle,
        percent_off: dec("10"),
        valid_until: None,
    });

    let err = h
        .services
        .billing
        .apply_coupon(member, draft.id, foreign)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let discounted = h.services.billing.apply_coupon(member, draft.id, half).await.unwrap();
    assert_eq!(discounted.discount, dec("2.5"));
    assert_eq!(discounted.amount, dec("2.5"));
    assert_eq!(discounted.coupon_id, Some(half));

    let err = h
        .services
        .billing
        .apply_coupon(member, draft.id, half)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    h.store.backdate_invoice(draft.id, Duration::hours(2));
    h.services.billing.finalize_due_invoices(Utc::now()).await.unwrap();
    let err = h
        .services
        .billing
        .apply_coupon(member, draft.id, half)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn expired_coupon_is_rejected() {
    let h = Harness::new().await;
    let c = circle_with_price(&h, "5").await;
    let member = h.user();
    let subscription = h.services.billing.subscribe(member, c.circle, None).await.unwrap();
    let draft = latest_invoice(&h, &subscription).await;

    let coupon = Uuid::new_v4();
    h.store.add_coupon(CircleCoupon {
        id: coupon,
        circle_id: c.circle,
        percent_off: dec("20"),
        valid_until: Some(Utc::now() - Duration::days(1)),
    });

    let err = h
        .services
        .billing
        .apply_coupon(member, draft.id, coupon)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn ending_trials_activate_and_invoice_once() {
    let h = Harness::new().await;
    let c = circle_with_price(&h, "5").await;
    let member = h.user();
    let trial_end = Utc::now() + Duration::hours(2);

    let subscription = h
        .services
        .billing
        .subscribe(member, c.circle, Some(trial_end))
        .await
        .unwrap();
    assert_eq!(subscription.state, SubscriptionState::Trialing);
    assert!(h
        .repositories
        .subscriptions
        .latest_invoice(subscription.id)
        .await
        .unwrap()
        .is_none());

    let activated = h.services.billing.activate_ending_trials(Utc::now()).await.unwrap();
    assert_eq!(activated, 1);
    let active = h
        .repositories
        .subscriptions
        .get_subscription(subscription.id)
        .await
        .unwrap();
    assert_eq!(active.state, SubscriptionState::Active);

    let invoice = latest_invoice(&h, &subscription).await;
    assert_eq!(invoice.period_start, trial_end);

    assert_eq!(h.services.billing.activate_ending_trials(Utc::now()).await.unwrap(), 0);
    assert_eq!(latest_invoice(&h, &subscription).await.id, invoice.id);
}

#[tokio::test]
async fn trial_stays_trialing_until_its_invoice_is_issued() {
    let h = Harness::new().await;
    let c = circle_with_price(&h, "5").await;
    let member = h.user();
    let trial_end = Utc::now() + Duration::hours(2);
    let subscription = h
        .services
        .billing
        .subscribe(member, c.circle, Some(trial_end))
        .await
        .unwrap();

    // With no active item there is nothing to invoice.
    let item = h.store.all_items(subscription.id).remove(0);
    h.repositories
        .subscriptions
        .archive_item(item.id, Utc::now())
        .await
        .unwrap();

    assert_eq!(h.services.billing.activate_ending_trials(Utc::now()).await.unwrap(), 0);
    let still = h
        .repositories
        .subscriptions
        .get_subscription(subscription.id)
        .await
        .unwrap();
    assert_eq!(still.state, SubscriptionState::Trialing);
    assert!(h
        .repositories
        .subscriptions
        .latest_invoice(subscription.id)
        .await
        .unwrap()
        .is_none());

    let price = h
        .repositories
        .subscriptions
        .active_price(c.circle)
        .await
        .unwrap()
        .unwrap();
    let restored = CircleSubscriptionItem::new(subscription.id, &price, member, "si_restored".to_string());
    h.repositories.subscriptions.insert_item(&restored).await.unwrap();

    assert_eq!(h.services.billing.activate_ending_trials(Utc::now()).await.unwrap(), 1);
    let active = h
        .repositories
        .subscriptions
        .get_subscription(subscription.id)
        .await
        .unwrap();
    assert_eq!(active.state, SubscriptionState::Active);
    let invoice = latest_invoice(&h, &subscription).await;
    assert_eq!(invoice.period_start, trial_end);
    assert_eq!(invoice.amount, dec("5"));
}

#[tokio::test]
async fn canceled_subscription_voids_its_draft() {
    let h = Harness::new().await;
    let c = circle_with_price(&h, "5").await;
    let member = h.user();
    let subscription = h.services.billing.subscribe(member, c.circle, None).await.unwrap();
    let draft = latest_invoice(&h, &subscription).await;

    h.services.billing.cancel(member, subscription.id).await.unwrap();
    h.store.backdate_invoice(draft.id, Duration::hours(2));
    h.services.billing.finalize_due_invoices(Utc::now()).await.unwrap();

    let voided = h.repositories.subscriptions.get_invoice(draft.id).await.unwrap();
    assert_eq!(voided.state, InvoiceState::Void);
}

#[tokio::test]
async fn failed_payment_puts_subscription_past_due() {
    let h = Harness::new().await;
    let c = circle_with_price(&h, "5").await;
    let member = h.user();
    let subscription = h.services.billing.subscribe(member, c.circle, None).await.unwrap();
    let draft = latest_invoice(&h, &subscription).await;
    h.store.backdate_invoice(draft.id, Duration::hours(2));
    h.services.billing.finalize_due_invoices(Utc::now()).await.unwrap();

    h.services.billing.handle_invoice_payment_failed(draft.id).await.unwrap();

    let past_due = h
        .repositories
        .subscriptions
        .get_subscription(subscription.id)
        .await
        .unwrap();
    assert_eq!(past_due.state, SubscriptionState::PastDue);
    let failed = h.repositories.subscriptions.get_invoice(draft.id).await.unwrap();
    assert_eq!(failed.state, InvoiceState::Failed);

    let err = h
        .services
        .billing
        .cancel(h.user(), subscription.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
}
