//! Circle subscriptions: prices, items, invoices, coupons and the revenue split that
//! follows a paid invoice.

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::circle::split_amount;
use crate::domain::{
    BillingPeriod, CircleInvoice, CirclePrice, CircleSubscription, CircleSubscriptionItem,
    Currency, Customer, InvoiceState, NewTransaction, PriceState, ProviderKind, Purpose,
    SubscriptionState, Target, Transaction,
};
use crate::error::AppError;
use crate::ports::{AccountRepository, LedgerRepository, RepositoryError, SubscriptionRepository};
use crate::providers::{with_timeout, InvoiceCharge, SubscriptionGateway};
use crate::validation::ValidationError;

#[derive(Debug, Clone)]
pub struct BillingSettings {
    pub trial_window: Duration,
    pub invoice_grace: Duration,
    pub platform_fee_rate: BigDecimal,
    pub provider_timeout: std::time::Duration,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            trial_window: Duration::hours(24),
            invoice_grace: Duration::hours(1),
            platform_fee_rate: BigDecimal::new(2.into(), 1),
            provider_timeout: std::time::Duration::from_secs(30),
        }
    }
}

pub struct BillingService {
    subscriptions: Arc<dyn SubscriptionRepository>,
    ledger: Arc<dyn LedgerRepository>,
    accounts: Arc<dyn AccountRepository>,
    gateway: Arc<dyn SubscriptionGateway>,
    settings: BillingSettings,
}

impl BillingService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        ledger: Arc<dyn LedgerRepository>,
        accounts: Arc<dyn AccountRepository>,
        gateway: Arc<dyn SubscriptionGateway>,
        settings: BillingSettings,
    ) -> Self {
        Self {
            subscriptions,
            ledger,
            accounts,
            gateway,
            settings,
        }
    }

    /// Makes `amount` the circle's only active price. Existing subscribers keep their
    /// price until [`change_price`](Self::change_price) moves them.
    pub async fn publish_price(
        &self,
        owner_id: Uuid,
        circle_id: Uuid,
        amount: BigDecimal,
        currency: Currency,
    ) -> Result<CirclePrice, AppError> {
        let circle = self.subscriptions.get_circle(circle_id).await?;
        if circle.owner_id != owner_id {
            return Err(AppError::Forbidden(format!("circle {} belongs to another user", circle_id)));
        }
        crate::validation::validate_positive_amount(&amount)?;
        if !currency.is_fiat() {
            return Err(ValidationError::new("currency", "circle prices are charged in fiat").into());
        }

        let provider_price_id = with_timeout(
            self.settings.provider_timeout,
            "create price",
            self.gateway.create_price(circle_id, &amount, currency),
        )
        .await?;

        let price = CirclePrice {
            id: Uuid::new_v4(),
            circle_id,
            amount,
            currency,
            provider: ProviderKind::Stripe,
            provider_price_id,
            state: PriceState::Active,
            created_at: Utc::now(),
        };
        let price = self.subscriptions.publish_price(&price).await?;
        info!(circle_id = %circle_id, price_id = %price.id, amount = %price.amount, "Published circle price");
        Ok(price)
    }

    /// Subscribes `user_id` to a circle at its active price. A user has at most one
    /// open subscription; further circles become items on it.
    pub async fn subscribe(
        &self,
        user_id: Uuid,
        circle_id: Uuid,
        trial_end: Option<DateTime<Utc>>,
    ) -> Result<CircleSubscription, AppError> {
        let circle = self.subscriptions.get_circle(circle_id).await?;
        if circle.owner_id == user_id {
            return Err(ValidationError::new("circle_id", "cannot subscribe to your own circle").into());
        }
        let price = self
            .subscriptions
            .active_price(circle_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("active price for circle {}", circle_id)))?;

        if let Some(subscription) = self.subscriptions.open_subscription(user_id).await? {
            let items = self.subscriptions.active_items(subscription.id).await?;
            if items.iter().any(|item| item.circle_id == circle_id) {
                return Err(AppError::Conflict(format!("already subscribed to circle {}", circle_id)));
            }
            self.check_billing_currency(&items, &price, None).await?;

            let item_ref = with_timeout(
                self.settings.provider_timeout,
                "add subscription item",
                self.gateway
                    .add_item(&subscription.provider_subscription_id, &price.provider_price_id),
            )
            .await?;
            let item = CircleSubscriptionItem::new(subscription.id, &price, user_id, item_ref);
            self.subscriptions.insert_item(&item).await?;
            info!(subscription_id = %subscription.id, circle_id = %circle_id, "Added circle to subscription");
            return Ok(subscription);
        }

        if let Some(end) = trial_end {
            if end <= Utc::now() {
                return Err(ValidationError::new("trial_end", "must be in the future").into());
            }
        }

        let customer = self.ensure_customer(user_id).await?;
        let remote = with_timeout(
            self.settings.provider_timeout,
            "create subscription",
            self.gateway
                .create_subscription(&customer.customer_ref, &price.provider_price_id, trial_end),
        )
        .await?;

        let now = Utc::now();
        let subscription = CircleSubscription {
            id: Uuid::new_v4(),
            user_id,
            provider: ProviderKind::Stripe,
            provider_subscription_id: remote.subscription_ref,
            state: if trial_end.is_some() {
                SubscriptionState::Trialing
            } else {
                SubscriptionState::Active
            },
            trial_end_at: trial_end,
            canceled_at: None,
            created_at: now,
        };
        let item = CircleSubscriptionItem::new(subscription.id, &price, user_id, remote.item_ref);
        self.subscriptions.insert_subscription(&subscription, &item).await?;
        info!(
            subscription_id = %subscription.id,
            circle_id = %circle_id,
            state = %subscription.state,
            "Created subscription"
        );

        if subscription.state == SubscriptionState::Active {
            self.issue_invoice(&subscription, now).await?;
        }
        Ok(subscription)
    }

    /// Moves the user's item in `circle_id` onto the circle's active price. The
    /// provider is updated first; the local swap archives the old item and inserts the
    /// new one in one unit of work.
    pub async fn change_price(
        &self,
        user_id: Uuid,
        circle_id: Uuid,
    ) -> Result<CircleSubscriptionItem, AppError> {
        let (subscription, item) = self.subscribed_item(user_id, circle_id).await?;
        let price = self
            .subscriptions
            .active_price(circle_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("active price for circle {}", circle_id)))?;
        if item.price_id == price.id {
            return Ok(item);
        }
        let items = self.subscriptions.active_items(subscription.id).await?;
        self.check_billing_currency(&items, &price, Some(item.id)).await?;

        let new_ref = with_timeout(
            self.settings.provider_timeout,
            "swap subscription item",
            self.gateway
                .swap_item(&item.provider_item_id, &price.provider_price_id),
        )
        .await?;

        let new_item = CircleSubscriptionItem::new(subscription.id, &price, user_id, new_ref);
        self.subscriptions
            .replace_item(item.id, &new_item, Utc::now())
            .await?;
        info!(
            subscription_id = %subscription.id,
            old_item_id = %item.id,
            new_item_id = %new_item.id,
            price_id = %price.id,
            "Changed subscription price"
        );
        Ok(new_item)
    }

    /// Leaves one circle. Leaving the last circle cancels the subscription.
    pub async fn unsubscribe(&self, user_id: Uuid, circle_id: Uuid) -> Result<(), AppError> {
        let (subscription, item) = self.subscribed_item(user_id, circle_id).await?;
        let items = self.subscriptions.active_items(subscription.id).await?;
        if items.len() <= 1 {
            return self.cancel(user_id, subscription.id).await;
        }

        with_timeout(
            self.settings.provider_timeout,
            "remove subscription item",
            self.gateway.remove_item(&item.provider_item_id),
        )
        .await?;
        self.subscriptions.archive_item(item.id, Utc::now()).await?;
        info!(subscription_id = %subscription.id, item_id = %item.id, "Removed circle from subscription");
        Ok(())
    }

    pub async fn cancel(&self, user_id: Uuid, subscription_id: Uuid) -> Result<(), AppError> {
        let subscription = self.subscriptions.get_subscription(subscription_id).await?;
        if subscription.user_id != user_id {
            return Err(AppError::Forbidden(format!(
                "subscription {} belongs to another user",
                subscription_id
            )));
        }
        if subscription.state == SubscriptionState::Canceled {
            return Ok(());
        }

        with_timeout(
            self.settings.provider_timeout,
            "cancel subscription",
            self.gateway
                .cancel_subscription(&subscription.provider_subscription_id),
        )
        .await?;
        self.cancel_locally(&subscription).await
    }

    pub async fn subscription_for(&self, user_id: Uuid) -> Result<Option<CircleSubscription>, AppError> {
        Ok(self.subscriptions.open_subscription(user_id).await?)
    }

    pub async fn items_for(&self, subscription_id: Uuid) -> Result<Vec<CircleSubscriptionItem>, AppError> {
        Ok(self.subscriptions.active_items(subscription_id).await?)
    }

    /// Creates the draft invoice for the period starting at `period_start`. Returns
    /// `None` when that period was already invoiced.
    pub async fn issue_invoice(
        &self,
        subscription: &CircleSubscription,
        period_start: DateTime<Utc>,
    ) -> Result<Option<CircleInvoice>, AppError> {
        let items = self.subscriptions.active_items(subscription.id).await?;
        if items.is_empty() {
            return Err(AppError::Conflict(format!(
                "subscription {} has no active items",
                subscription.id
            )));
        }

        let mut total = BigDecimal::zero();
        let mut currency = None;
        for item in &items {
            let price = self.subscriptions.get_price(item.price_id).await?;
            match currency {
                None => currency = Some(price.currency),
                Some(c) if c != price.currency => {
                    return Err(AppError::Internal(format!(
                        "subscription {} mixes {} and {} prices",
                        subscription.id, c, price.currency
                    )))
                }
                Some(_) => {}
            }
            total += price.amount;
        }
        let currency = currency.unwrap_or(Currency::Usd);

        let period = BillingPeriod::monthly_from(period_start);
        let invoice = CircleInvoice {
            id: Uuid::new_v4(),
            subscription_id: subscription.id,
            user_id: subscription.user_id,
            amount: total,
            discount: BigDecimal::zero(),
            currency,
            coupon_id: None,
            state: InvoiceState::Draft,
            provider_invoice_id: None,
            period_start: period.start,
            period_end: period.end,
            created_at: Utc::now(),
        };

        match self.subscriptions.insert_invoice(&invoice).await? {
            Some(invoice) => {
                info!(invoice_id = %invoice.id, subscription_id = %subscription.id, amount = %invoice.amount, "Issued invoice");
                Ok(Some(invoice))
            }
            None => {
                debug!(subscription_id = %subscription.id, period_start = %period.start, "Period already invoiced");
                Ok(None)
            }
        }
    }

    /// Discounts a draft invoice. Coupons never touch finalized invoices.
    pub async fn apply_coupon(
        &self,
        user_id: Uuid,
        invoice_id: Uuid,
        coupon_id: Uuid,
    ) -> Result<CircleInvoice, AppError> {
        let invoice = self.subscriptions.get_invoice(invoice_id).await?;
        if invoice.user_id != user_id {
            return Err(AppError::Forbidden(format!("invoice {} belongs to another user", invoice_id)));
        }
        if invoice.state != InvoiceState::Draft {
            return Err(ValidationError::new(
                "invoice_id",
                format!("coupons cannot be applied to a {} invoice", invoice.state),
            )
            .into());
        }
        if invoice.coupon_id.is_some() {
            return Err(AppError::Conflict(format!("invoice {} already has a coupon", invoice_id)));
        }

        let coupon = self.subscriptions.get_coupon(coupon_id).await?;
        if !coupon.is_valid_at(Utc::now()) {
            return Err(ValidationError::new("coupon_id", "coupon has expired").into());
        }

        let items = self.subscriptions.active_items(invoice.subscription_id).await?;
        let item = items
            .iter()
            .find(|item| item.circle_id == coupon.circle_id)
            .ok_or_else(|| ValidationError::new("coupon_id", "coupon is for a circle not on this invoice"))?;
        let price = self.subscriptions.get_price(item.price_id).await?;

        let gross = invoice.gross();
        let mut discount = coupon.discount_for(&price.amount);
        if discount > gross {
            discount = gross.clone();
        }
        let amount = &gross - &discount;

        if !self
            .subscriptions
            .apply_coupon(invoice.id, coupon.id, &discount, &amount)
            .await?
        {
            return Err(AppError::Conflict(format!("invoice {} changed concurrently", invoice_id)));
        }
        info!(invoice_id = %invoice.id, coupon_id = %coupon.id, discount = %discount, "Applied coupon");
        Ok(self.subscriptions.get_invoice(invoice.id).await?)
    }

    /// Finalizes drafts whose coupon window has passed and opens them at the provider.
    pub async fn finalize_due_invoices(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let drafts = self
            .subscriptions
            .drafts_created_before(now - self.settings.invoice_grace)
            .await?;

        let mut finalized = 0;
        for invoice in drafts {
            match self.finalize_invoice(&invoice).await {
                Ok(true) => finalized += 1,
                Ok(false) => {}
                Err(e) => warn!(invoice_id = %invoice.id, error = %e, "Failed to finalize invoice"),
            }
        }
        Ok(finalized)
    }

    async fn finalize_invoice(&self, invoice: &CircleInvoice) -> Result<bool, AppError> {
        let subscription = self.subscriptions.get_subscription(invoice.subscription_id).await?;
        if subscription.state == SubscriptionState::Canceled {
            let voided = self
                .subscriptions
                .transition_invoice(invoice.id, InvoiceState::Draft, InvoiceState::Void, None)
                .await?;
            info!(invoice_id = %invoice.id, "Voided invoice of canceled subscription");
            return Ok(voided);
        }

        let customer = self.ensure_customer(invoice.user_id).await?;
        let charge = InvoiceCharge {
            invoice_id: invoice.id,
            subscription_ref: subscription.provider_subscription_id.clone(),
            customer_ref: customer.customer_ref,
            amount: invoice.amount.clone(),
            discount: invoice.discount.clone(),
            currency: invoice.currency,
        };
        let provider_invoice_id = with_timeout(
            self.settings.provider_timeout,
            "create invoice",
            self.gateway.create_invoice(&charge),
        )
        .await?;

        let opened = self
            .subscriptions
            .transition_invoice(
                invoice.id,
                InvoiceState::Draft,
                InvoiceState::Open,
                Some(&provider_invoice_id),
            )
            .await?;
        if opened {
            info!(invoice_id = %invoice.id, provider_invoice_id = %provider_invoice_id, "Finalized invoice");
        }
        Ok(opened)
    }

    /// Activates trials ending within the look-ahead window and invoices their first
    /// period. The invoice is written before the state moves, so a trial whose
    /// invoice could not be issued stays `trialing` and is picked up by the next run.
    pub async fn activate_ending_trials(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let ending = self
            .subscriptions
            .trials_ending_before(now + self.settings.trial_window)
            .await?;

        let mut activated = 0;
        for subscription in ending {
            let period_start = subscription.trial_end_at.unwrap_or(now);
            if let Err(e) = self.issue_invoice(&subscription, period_start).await {
                warn!(subscription_id = %subscription.id, error = %e, "Failed to issue first invoice, trial left in place");
                continue;
            }

            let moved = self
                .subscriptions
                .transition_subscription(
                    subscription.id,
                    SubscriptionState::Trialing,
                    SubscriptionState::Active,
                )
                .await?;
            if moved {
                activated += 1;
                info!(subscription_id = %subscription.id, "Trial converted to active");
            }
        }
        Ok(activated)
    }

    /// Books the creators' shares of a paid invoice and marks it paid. Each item
    /// produces a `subscriptionSplit` to the circle owner and a `platformFee` child
    /// back to the platform. Redelivered notifications find the splits already written.
    pub async fn handle_invoice_paid(&self, invoice_id: Uuid) -> Result<Vec<Transaction>, AppError> {
        let invoice = self.subscriptions.get_invoice(invoice_id).await?;
        if invoice.state == InvoiceState::Paid {
            debug!(invoice_id = %invoice.id, "Invoice already paid");
            return Ok(Vec::new());
        }

        let mut recorded = Vec::new();
        let gross = invoice.gross();
        if !gross.is_zero() {
            let items = self.subscriptions.active_items(invoice.subscription_id).await?;
            for item in items {
                let price = self.subscriptions.get_price(item.price_id).await?;
                let circle = self.subscriptions.get_circle(item.circle_id).await?;

                let share = (&price.amount * &invoice.amount / &gross).round(2);
                if share <= BigDecimal::zero() {
                    continue;
                }
                let (gross_share, fee) = split_amount(&share, &self.settings.platform_fee_rate);

                let parent = NewTransaction::new(
                    Purpose::SubscriptionSplit,
                    ProviderKind::Matters,
                    gross_share,
                    invoice.currency,
                )
                .recipient(circle.owner_id)
                .target(Target::CirclePrice(price.id))
                .provider_tx_id(format!("invoice:{}:{}", invoice.id, item.id));
                parent.validate()?;

                let child = if fee > BigDecimal::zero() {
                    let child = NewTransaction::new(
                        Purpose::PlatformFee,
                        ProviderKind::Matters,
                        fee,
                        invoice.currency,
                    )
                    .sender(circle.owner_id)
                    .target(Target::CirclePrice(price.id))
                    .parent(parent.id);
                    child.validate()?;
                    Some(child)
                } else {
                    None
                };

                match self.ledger.insert_split(&parent, child.as_ref()).await {
                    Ok((parent, child)) => {
                        info!(
                            invoice_id = %invoice.id,
                            circle_id = %circle.id,
                            split_id = %parent.id,
                            amount = %parent.amount,
                            "Recorded subscription split"
                        );
                        recorded.push(parent);
                        recorded.extend(child);
                    }
                    Err(RepositoryError::Conflict(_)) => {
                        debug!(invoice_id = %invoice.id, item_id = %item.id, "Split already recorded");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        self.subscriptions
            .transition_invoice(invoice.id, InvoiceState::Open, InvoiceState::Paid, None)
            .await?;
        let recovered = self
            .subscriptions
            .transition_subscription(
                invoice.subscription_id,
                SubscriptionState::PastDue,
                SubscriptionState::Active,
            )
            .await?;
        if recovered {
            info!(subscription_id = %invoice.subscription_id, "Subscription recovered from past due");
        }
        Ok(recorded)
    }

    pub async fn handle_invoice_payment_failed(&self, invoice_id: Uuid) -> Result<(), AppError> {
        let invoice = self.subscriptions.get_invoice(invoice_id).await?;
        self.subscriptions
            .transition_invoice(invoice.id, InvoiceState::Open, InvoiceState::Failed, None)
            .await?;
        if self
            .subscriptions
            .transition_subscription(
                invoice.subscription_id,
                SubscriptionState::Active,
                SubscriptionState::PastDue,
            )
            .await?
        {
            warn!(subscription_id = %invoice.subscription_id, invoice_id = %invoice.id, "Subscription past due");
        }
        Ok(())
    }

    /// The provider ended the subscription on its side.
    pub async fn handle_subscription_deleted(&self, provider_subscription_id: &str) -> Result<(), AppError> {
        match self
            .subscriptions
            .find_subscription_by_provider_ref(provider_subscription_id)
            .await?
        {
            Some(subscription) if subscription.state != SubscriptionState::Canceled => {
                self.cancel_locally(&subscription).await
            }
            Some(_) => Ok(()),
            None => {
                warn!(provider_subscription_id, "Deleted subscription is unknown");
                Ok(())
            }
        }
    }

    pub async fn find_invoice_by_provider_ref(
        &self,
        provider_invoice_id: &str,
    ) -> Result<Option<CircleInvoice>, AppError> {
        Ok(self
            .subscriptions
            .find_invoice_by_provider_ref(provider_invoice_id)
            .await?)
    }

    async fn cancel_locally(&self, subscription: &CircleSubscription) -> Result<(), AppError> {
        let canceled = self
            .subscriptions
            .cancel_subscription(subscription.id, Utc::now())
            .await?;
        if canceled {
            info!(subscription_id = %subscription.id, "Canceled subscription");
        }
        Ok(())
    }

    /// A subscription bills in one currency, so `price` must match the items it
    /// joins. `replacing` is left out of the comparison.
    async fn check_billing_currency(
        &self,
        items: &[CircleSubscriptionItem],
        price: &CirclePrice,
        replacing: Option<Uuid>,
    ) -> Result<(), AppError> {
        let Some(other) = items.iter().find(|item| Some(item.id) != replacing) else {
            return Ok(());
        };
        let billed = self.subscriptions.get_price(other.price_id).await?;
        if billed.currency != price.currency {
            return Err(ValidationError::new(
                "circle_id",
                format!(
                    "circle is priced in {} but the subscription bills in {}",
                    price.currency, billed.currency
                ),
            )
            .into());
        }
        Ok(())
    }

    async fn subscribed_item(
        &self,
        user_id: Uuid,
        circle_id: Uuid,
    ) -> Result<(CircleSubscription, CircleSubscriptionItem), AppError> {
        let subscription = self
            .subscriptions
            .open_subscription(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("subscription for user {}", user_id)))?;
        let item = self
            .subscriptions
            .active_items(subscription.id)
            .await?
            .into_iter()
            .find(|item| item.circle_id == circle_id)
            .ok_or_else(|| AppError::NotFound(format!("subscription item for circle {}", circle_id)))?;
        Ok((subscription, item))
    }

    async fn ensure_customer(&self, user_id: Uuid) -> Result<Customer, AppError> {
        if let Some(customer) = self
            .accounts
            .active_customer(user_id, ProviderKind::Stripe)
            .await?
        {
            return Ok(customer);
        }

        let customer_ref = with_timeout(
            self.settings.provider_timeout,
            "create customer",
            self.gateway.create_customer(user_id),
        )
        .await?;
        let customer = Customer {
            id: Uuid::new_v4(),
            user_id,
            provider: ProviderKind::Stripe,
            customer_ref,
            card_last4: None,
            archived: false,
            created_at: Utc::now(),
        };
        Ok(self.accounts.insert_customer(&customer).await?)
    }
}
