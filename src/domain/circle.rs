//! Circle (paid channel) prices, subscriptions, invoices and coupons.

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::transaction::{string_enum, Currency, ProviderKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Circle {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceState {
    Active,
    Archived,
}

string_enum!(PriceState, "state", {
    Active => "active",
    Archived => "archived",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CirclePrice {
    pub id: Uuid,
    pub circle_id: Uuid,
    pub amount: BigDecimal,
    pub currency: Currency,
    pub provider: ProviderKind,
    pub provider_price_id: String,
    pub state: PriceState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Trialing,
    Active,
    PastDue,
    Canceled,
}

string_enum!(SubscriptionState, "state", {
    Trialing => "trialing",
    Active => "active",
    PastDue => "past_due",
    Canceled => "canceled",
});

impl SubscriptionState {
    /// `trialing -> active -> (canceled | past_due -> active | past_due -> canceled)`.
    /// A trial may also be canceled before it converts.
    pub fn can_transition_to(&self, next: SubscriptionState) -> bool {
        use SubscriptionState::*;
        matches!(
            (self, next),
            (Trialing, Active)
                | (Trialing, Canceled)
                | (Active, PastDue)
                | (Active, Canceled)
                | (PastDue, Active)
                | (PastDue, Canceled)
        )
    }

    pub fn is_open(&self) -> bool {
        *self != SubscriptionState::Canceled
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircleSubscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: ProviderKind,
    pub provider_subscription_id: String,
    pub state: SubscriptionState,
    pub trial_end_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircleSubscriptionItem {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub price_id: Uuid,
    pub circle_id: Uuid,
    pub user_id: Uuid,
    pub provider: ProviderKind,
    pub provider_item_id: String,
    pub archived: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CircleSubscriptionItem {
    pub fn new(
        subscription_id: Uuid,
        price: &CirclePrice,
        user_id: Uuid,
        provider_item_id: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            price_id: price.id,
            circle_id: price.circle_id,
            user_id,
            provider: price.provider,
            provider_item_id,
            archived: false,
            canceled_at: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceState {
    Draft,
    Open,
    Paid,
    Failed,
    Void,
}

string_enum!(InvoiceState, "state", {
    Draft => "draft",
    Open => "open",
    Paid => "paid",
    Failed => "failed",
    Void => "void",
});

/// One billing cycle of a subscription. Unique per `(subscription_id, period_start)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircleInvoice {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    /// Amount due after discount.
    pub amount: BigDecimal,
    pub discount: BigDecimal,
    pub currency: Currency,
    pub coupon_id: Option<Uuid>,
    pub state: InvoiceState,
    pub provider_invoice_id: Option<String>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl CircleInvoice {
    pub fn gross(&self) -> BigDecimal {
        &self.amount + &self.discount
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircleCoupon {
    pub id: Uuid,
    pub circle_id: Uuid,
    pub percent_off: BigDecimal,
    pub valid_until: Option<DateTime<Utc>>,
}

impl CircleCoupon {
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_until.map_or(true, |until| at <= until)
    }

    /// Discount on `gross`, rounded to cents and never more than `gross`.
    pub fn discount_for(&self, gross: &BigDecimal) -> BigDecimal {
        let discount = (gross * &self.percent_off / BigDecimal::from(100)).round(2);
        if &discount > gross {
            gross.clone()
        } else if discount < BigDecimal::zero() {
            BigDecimal::zero()
        } else {
            discount
        }
    }
}

/// Monthly billing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn monthly_from(start: DateTime<Utc>) -> Self {
        let end = start
            .checked_add_months(Months::new(1))
            .unwrap_or(start + chrono::Duration::days(30));
        Self { start, end }
    }
}

/// Splits a paid amount into the creator's gross share and the platform fee.
pub fn split_amount(amount: &BigDecimal, fee_rate: &BigDecimal) -> (BigDecimal, BigDecimal) {
    let fee = (amount * fee_rate).round(2);
    let fee = if &fee > amount { amount.clone() } else { fee };
    (amount.clone(), fee)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    #[test]
    fn subscription_state_machine() {
        use SubscriptionState::*;
        assert!(Trialing.can_transition_to(Active));
        assert!(Active.can_transition_to(PastDue));
        assert!(PastDue.can_transition_to(Active));
        assert!(PastDue.can_transition_to(Canceled));
        assert!(!Canceled.can_transition_to(Active));
        assert!(!Active.can_transition_to(Trialing));
        assert!(!Trialing.can_transition_to(PastDue));
    }

    #[test]
    fn coupon_discount_is_rounded_and_capped() {
        let coupon = CircleCoupon {
            id: Uuid::new_v4(),
            circle_id: Uuid::new_v4(),
            percent_off: BigDecimal::from_str("33.33").unwrap(),
            valid_until: None,
        };
        assert_eq!(
            coupon.discount_for(&BigDecimal::from(10)),
            BigDecimal::from_str("3.33").unwrap()
        );

        let full = CircleCoupon {
            percent_off: BigDecimal::from(100),
            ..coupon
        };
        assert_eq!(full.discount_for(&BigDecimal::from(10)), BigDecimal::from(10));
    }

    #[test]
    fn coupon_expiry() {
        let until = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        let coupon = CircleCoupon {
            id: Uuid::new_v4(),
            circle_id: Uuid::new_v4(),
            percent_off: BigDecimal::from(10),
            valid_until: Some(until),
        };
        assert!(coupon.is_valid_at(until));
        assert!(!coupon.is_valid_at(until + chrono::Duration::seconds(1)));
    }

    #[test]
    fn monthly_period_handles_month_ends() {
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        let period = BillingPeriod::monthly_from(start);
        assert_eq!(period.end, Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());
    }

    #[test]
    fn split_takes_platform_fee() {
        let (gross, fee) = split_amount(
            &BigDecimal::from(10),
            &BigDecimal::from_str("0.2").unwrap(),
        );
        assert_eq!(gross, BigDecimal::from(10));
        assert_eq!(fee, BigDecimal::from(2));
    }
}
