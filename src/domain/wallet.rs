//! Crypto wallets and the signed challenges that link them to accounts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::transaction::string_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignaturePurpose {
    Login,
    Signup,
    Connect,
}

string_enum!(SignaturePurpose, "purpose", {
    Login => "login",
    Signup => "signup",
    Connect => "connect",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureStatus {
    Active,
    Used,
    Expired,
    Inactive,
}

string_enum!(SignatureStatus, "status", {
    Active => "active",
    Used => "used",
    Expired => "expired",
    Inactive => "inactive",
});

impl SignatureStatus {
    /// Only `active` moves, and nothing ever returns to it.
    pub fn can_transition_to(&self, next: SignatureStatus) -> bool {
        *self == SignatureStatus::Active && next != SignatureStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoWallet {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Lowercase `0x` address.
    pub address: String,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoWalletSignature {
    pub id: Uuid,
    pub address: String,
    /// Empty until the signature is consumed by a login or a link.
    pub user_id: Option<Uuid>,
    pub nonce: String,
    pub signed_message: String,
    pub purpose: SignaturePurpose,
    pub status: SignatureStatus,
    pub expired_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CryptoWalletSignature {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expired_at
    }
}

/// Text the wallet owner signs with `personal_sign`.
pub fn challenge_message(
    domain: &str,
    address: &str,
    purpose: SignaturePurpose,
    nonce: &str,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> String {
    format!(
        "{domain} wants you to sign in with your Ethereum account:\n{address}\n\n\
         Action: {purpose}\nNonce: {nonce}\nIssued At: {issued}\nExpiration Time: {expires}",
        domain = domain,
        address = address,
        purpose = purpose,
        nonce = nonce,
        issued = issued_at.to_rfc3339(),
        expires = expires_at.to_rfc3339(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_status_is_one_way() {
        use SignatureStatus::*;
        assert!(Active.can_transition_to(Used));
        assert!(Active.can_transition_to(Expired));
        assert!(Active.can_transition_to(Inactive));
        assert!(!Used.can_transition_to(Active));
        assert!(!Expired.can_transition_to(Used));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn challenge_message_carries_nonce_and_purpose() {
        let now = Utc::now();
        let message = challenge_message(
            "matters.town",
            "0xabc",
            SignaturePurpose::Connect,
            "n0nce",
            now,
            now + chrono::Duration::minutes(10),
        );
        assert!(message.starts_with("matters.town wants you to sign in"));
        assert!(message.contains("Action: connect"));
        assert!(message.contains("Nonce: n0nce"));
    }
}
