//! Ledger transaction entity and the closed vocabularies it is built from.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::validation::{validate_positive_amount, validate_remark, ValidationError};

macro_rules! string_enum {
    ($name:ident, $field:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::validation::ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err($crate::validation::ValidationError::new(
                        $field,
                        format!("unknown value '{}'", other),
                    )),
                }
            }
        }
    };
}

pub(crate) use string_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Hkd,
    Twd,
    Usd,
    Like,
    Mat,
}

string_enum!(Currency, "currency", {
    Hkd => "HKD",
    Twd => "TWD",
    Usd => "USD",
    Like => "LIKE",
    Mat => "MAT",
});

impl Currency {
    pub fn is_fiat(&self) -> bool {
        matches!(self, Currency::Hkd | Currency::Twd | Currency::Usd)
    }

    /// The rail that moves this currency between two platform users.
    pub fn transfer_provider(&self) -> ProviderKind {
        match self {
            Currency::Like => ProviderKind::Blockchain,
            _ => ProviderKind::Matters,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Purpose {
    Donation,
    AddCredit,
    Refund,
    Payout,
    SubscriptionSplit,
    PlatformFee,
}

string_enum!(Purpose, "purpose", {
    Donation => "donation",
    AddCredit => "addCredit",
    Refund => "refund",
    Payout => "payout",
    SubscriptionSplit => "subscriptionSplit",
    PlatformFee => "platformFee",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Pending,
    Succeeded,
    Failed,
    Canceled,
}

string_enum!(TransactionState, "state", {
    Pending => "pending",
    Succeeded => "succeeded",
    Failed => "failed",
    Canceled => "canceled",
});

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionState::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Stripe,
    Blockchain,
    Matters,
}

string_enum!(ProviderKind, "provider", {
    Stripe => "stripe",
    Blockchain => "blockchain",
    Matters => "matters",
});

impl ProviderKind {
    pub fn supports(&self, currency: Currency) -> bool {
        match self {
            ProviderKind::Stripe => currency.is_fiat(),
            ProviderKind::Blockchain => currency == Currency::Like,
            ProviderKind::Matters => currency != Currency::Like,
        }
    }
}

/// Terminal result reported to [`crate::services::LedgerService::settle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementOutcome {
    Succeeded,
    Failed,
    Canceled,
}

impl SettlementOutcome {
    pub fn state(&self) -> TransactionState {
        match self {
            SettlementOutcome::Succeeded => TransactionState::Succeeded,
            SettlementOutcome::Failed => TransactionState::Failed,
            SettlementOutcome::Canceled => TransactionState::Canceled,
        }
    }
}

impl FromStr for SettlementOutcome {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(SettlementOutcome::Succeeded),
            "failed" => Ok(SettlementOutcome::Failed),
            "canceled" => Ok(SettlementOutcome::Canceled),
            other => Err(ValidationError::new(
                "outcome",
                format!("unknown value '{}'", other),
            )),
        }
    }
}

/// What a transaction paid for. Stored as `target_type` + `target_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum Target {
    Article(Uuid),
    CirclePrice(Uuid),
    Transaction(Uuid),
}

impl Target {
    pub fn type_name(&self) -> &'static str {
        match self {
            Target::Article(_) => "article",
            Target::CirclePrice(_) => "circlePrice",
            Target::Transaction(_) => "transaction",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Target::Article(id) | Target::CirclePrice(id) | Target::Transaction(id) => *id,
        }
    }

    pub fn from_parts(
        target_type: Option<&str>,
        target_id: Option<Uuid>,
    ) -> Result<Option<Self>, ValidationError> {
        match (target_type, target_id) {
            (None, None) => Ok(None),
            (Some("article"), Some(id)) => Ok(Some(Target::Article(id))),
            (Some("circlePrice"), Some(id)) => Ok(Some(Target::CirclePrice(id))),
            (Some("transaction"), Some(id)) => Ok(Some(Target::Transaction(id))),
            (Some(other), Some(_)) => Err(ValidationError::new(
                "target_type",
                format!("unknown value '{}'", other),
            )),
            _ => Err(ValidationError::new(
                "target",
                "target_type and target_id must be set together",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub amount: BigDecimal,
    pub currency: Currency,
    pub purpose: Purpose,
    pub state: TransactionState,
    pub provider: ProviderKind,
    pub provider_tx_id: Option<String>,
    pub sender_id: Option<Uuid>,
    pub recipient_id: Option<Uuid>,
    pub target: Option<Target>,
    pub parent_id: Option<Uuid>,
    pub discount: Option<BigDecimal>,
    pub remark: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn involves(&self, user_id: Uuid) -> bool {
        self.sender_id == Some(user_id) || self.recipient_id == Some(user_id)
    }
}

/// Input to the ledger's single write path.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub id: Uuid,
    pub amount: BigDecimal,
    pub currency: Currency,
    pub purpose: Purpose,
    pub provider: ProviderKind,
    pub provider_tx_id: Option<String>,
    pub sender_id: Option<Uuid>,
    pub recipient_id: Option<Uuid>,
    pub target: Option<Target>,
    pub parent_id: Option<Uuid>,
    pub discount: Option<BigDecimal>,
    pub remark: Option<String>,
}

impl NewTransaction {
    pub fn new(
        purpose: Purpose,
        provider: ProviderKind,
        amount: BigDecimal,
        currency: Currency,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            amount,
            currency,
            purpose,
            provider,
            provider_tx_id: None,
            sender_id: None,
            recipient_id: None,
            target: None,
            parent_id: None,
            discount: None,
            remark: None,
        }
    }

    pub fn sender(mut self, user_id: Uuid) -> Self {
        self.sender_id = Some(user_id);
        self
    }

    pub fn recipient(mut self, user_id: Uuid) -> Self {
        self.recipient_id = Some(user_id);
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn provider_tx_id(mut self, provider_tx_id: impl Into<String>) -> Self {
        self.provider_tx_id = Some(provider_tx_id.into());
        self
    }

    pub fn remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = Some(remark.into());
        self
    }

    /// Instantaneous in-platform transfers are written as already succeeded.
    pub fn initial_state(&self) -> TransactionState {
        match self.provider {
            ProviderKind::Matters => TransactionState::Succeeded,
            ProviderKind::Stripe | ProviderKind::Blockchain => TransactionState::Pending,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_positive_amount(&self.amount)?;
        validate_remark(self.remark.as_deref())?;

        if let Some(discount) = &self.discount {
            if discount < &BigDecimal::from(0) {
                return Err(ValidationError::new("discount", "must not be negative"));
            }
        }

        if !self.provider.supports(self.currency) {
            return Err(ValidationError::new(
                "currency",
                format!("{} cannot settle {}", self.provider, self.currency),
            ));
        }

        if self.sender_id.is_some() && self.sender_id == self.recipient_id {
            return Err(ValidationError::new(
                "recipient_id",
                "sender and recipient must differ",
            ));
        }

        self.validate_participants()?;
        self.validate_target()?;

        let rail_ok = match self.purpose {
            Purpose::AddCredit | Purpose::Payout => self.provider == ProviderKind::Stripe,
            Purpose::SubscriptionSplit | Purpose::PlatformFee => {
                self.provider == ProviderKind::Matters
            }
            Purpose::Donation | Purpose::Refund => true,
        };
        if !rail_ok {
            return Err(ValidationError::new(
                "provider",
                format!("{} cannot be settled through {}", self.purpose, self.provider),
            ));
        }

        Ok(())
    }

    fn validate_participants(&self) -> Result<(), ValidationError> {
        let (sender, recipient) = (self.sender_id.is_some(), self.recipient_id.is_some());
        let ok = match self.purpose {
            Purpose::Donation => sender && recipient,
            Purpose::AddCredit | Purpose::SubscriptionSplit => !sender && recipient,
            Purpose::Payout | Purpose::PlatformFee => sender && !recipient,
            Purpose::Refund => sender || recipient,
        };

        if ok {
            Ok(())
        } else {
            Err(ValidationError::new(
                "participants",
                format!("invalid sender/recipient combination for {}", self.purpose),
            ))
        }
    }

    fn validate_target(&self) -> Result<(), ValidationError> {
        let ok = match (self.purpose, self.target) {
            (Purpose::Donation, Some(Target::Article(_))) => true,
            (Purpose::SubscriptionSplit, Some(Target::CirclePrice(_))) => true,
            (Purpose::PlatformFee, None | Some(Target::CirclePrice(_))) => {
                self.parent_id.is_some()
            }
            (Purpose::Refund, Some(Target::Transaction(original))) => {
                self.parent_id == Some(original)
            }
            (Purpose::AddCredit | Purpose::Payout, None) => true,
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            Err(ValidationError::new(
                "target",
                format!("invalid target for {}", self.purpose),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn donation() -> NewTransaction {
        NewTransaction::new(
            Purpose::Donation,
            ProviderKind::Blockchain,
            BigDecimal::from(10),
            Currency::Like,
        )
        .sender(Uuid::new_v4())
        .recipient(Uuid::new_v4())
        .target(Target::Article(Uuid::new_v4()))
    }

    #[test]
    fn parses_and_prints_vocabularies() {
        for currency in Currency::ALL {
            assert_eq!(currency.as_str().parse::<Currency>().unwrap(), *currency);
        }
        for purpose in Purpose::ALL {
            assert_eq!(purpose.as_str().parse::<Purpose>().unwrap(), *purpose);
        }
        assert!("EUR".parse::<Currency>().is_err());
        assert!("tip".parse::<Purpose>().is_err());
    }

    #[test]
    fn accepts_valid_donation() {
        assert!(donation().validate().is_ok());
        assert_eq!(donation().initial_state(), TransactionState::Pending);
    }

    #[test]
    fn in_platform_transfers_start_succeeded() {
        let mut tx = donation();
        tx.provider = ProviderKind::Matters;
        tx.currency = Currency::Mat;
        assert!(tx.validate().is_ok());
        assert_eq!(tx.initial_state(), TransactionState::Succeeded);
    }

    #[test]
    fn rejects_donation_without_article() {
        let mut tx = donation();
        tx.target = Some(Target::CirclePrice(Uuid::new_v4()));
        assert_eq!(tx.validate().unwrap_err().field, "target");
        tx.target = None;
        assert!(tx.validate().is_err());
    }

    #[test]
    fn rejects_non_positive_amount() {
        let mut tx = donation();
        tx.amount = BigDecimal::from(0);
        assert_eq!(tx.validate().unwrap_err().field, "amount");
    }

    #[test]
    fn rejects_self_transfer() {
        let user = Uuid::new_v4();
        let tx = donation().sender(user).recipient(user);
        assert_eq!(tx.validate().unwrap_err().field, "recipient_id");
    }

    #[test]
    fn rejects_currency_the_rail_cannot_move() {
        let mut tx = donation();
        tx.currency = Currency::Hkd;
        assert_eq!(tx.validate().unwrap_err().field, "currency");
    }

    #[test]
    fn add_credit_is_a_system_issued_credit() {
        let user = Uuid::new_v4();
        let credit = NewTransaction::new(
            Purpose::AddCredit,
            ProviderKind::Stripe,
            BigDecimal::from(100),
            Currency::Hkd,
        )
        .recipient(user);
        assert!(credit.validate().is_ok());
        assert!(credit.clone().sender(Uuid::new_v4()).validate().is_err());
    }

    #[test]
    fn refund_must_point_at_its_parent() {
        let original = Uuid::new_v4();
        let refund = NewTransaction::new(
            Purpose::Refund,
            ProviderKind::Stripe,
            BigDecimal::from(5),
            Currency::Hkd,
        )
        .sender(Uuid::new_v4())
        .target(Target::Transaction(original));
        assert!(refund.validate().is_err());
        assert!(refund.parent(original).validate().is_ok());
    }

    #[test]
    fn target_round_trips_through_columns() {
        let target = Target::CirclePrice(Uuid::new_v4());
        let parsed = Target::from_parts(Some(target.type_name()), Some(target.id())).unwrap();
        assert_eq!(parsed, Some(target));
        assert!(Target::from_parts(Some("comment"), Some(Uuid::new_v4())).is_err());
        assert!(Target::from_parts(Some("article"), None).is_err());
        assert_eq!(Target::from_parts(None, None).unwrap(), None);
    }
}
