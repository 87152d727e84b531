mod common;

use chrono::Duration;
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use uuid::Uuid;

use common::Harness;
use settlement_core::crypto::{address_of, sign_personal_message};
use settlement_core::domain::{Currency, SignaturePurpose, SignatureStatus, UserAccount};
use settlement_core::error::AppError;
use settlement_core::ports::WalletRepository;
use settlement_core::services::WalletError;

struct Signer {
    secret: SecretKey,
    address: String,
}

fn signer(byte: u8) -> Signer {
    let secret = SecretKey::from_slice(&[byte; 32]).unwrap();
    let address = address_of(&PublicKey::from_secret_key(SECP256K1, &secret));
    Signer { secret, address }
}

/// Runs the challenge flow end to end.
async fn sign_in(
    h: &Harness,
    wallet: &Signer,
    purpose: SignaturePurpose,
    user: Option<Uuid>,
) -> Result<Uuid, AppError> {
    let challenge = h
        .services
        .wallets
        .issue_challenge(&wallet.address, purpose, user)
        .await?;
    let signature = sign_personal_message(&wallet.secret, &challenge.signed_message);
    h.services
        .wallets
        .verify(&wallet.address, &signature, &challenge.nonce, user)
        .await
}

#[tokio::test]
async fn signup_links_wallet_and_login_finds_it() {
    let h = Harness::new().await;
    let user = h.user();
    let wallet = signer(7);

    let linked = sign_in(&h, &wallet, SignaturePurpose::Signup, Some(user)).await.unwrap();
    assert_eq!(linked, user);
    let stored = h.services.wallets.wallet_for_user(user).await.unwrap().unwrap();
    assert_eq!(stored.address, wallet.address);

    let logged_in = sign_in(&h, &wallet, SignaturePurpose::Login, None).await.unwrap();
    assert_eq!(logged_in, user);
}

#[tokio::test]
async fn challenge_cannot_be_replayed() {
    let h = Harness::new().await;
    let user = h.user();
    let wallet = signer(8);

    let challenge = h
        .services
        .wallets
        .issue_challenge(&wallet.address, SignaturePurpose::Signup, Some(user))
        .await
        .unwrap();
    assert!(challenge.signed_message.contains(&challenge.nonce));
    let signature = sign_personal_message(&wallet.secret, &challenge.signed_message);

    h.services
        .wallets
        .verify(&wallet.address, &signature, &challenge.nonce, Some(user))
        .await
        .unwrap();
    let err = h
        .services
        .wallets
        .verify(&wallet.address, &signature, &challenge.nonce, Some(user))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Wallet(WalletError::ChallengeNotActive(SignatureStatus::Used))
    ));
}

#[tokio::test]
async fn newer_challenge_supersedes_the_open_one() {
    let h = Harness::new().await;
    let user = h.user();
    let wallet = signer(14);
    let wallets = &h.services.wallets;

    let first = wallets
        .issue_challenge(&wallet.address, SignaturePurpose::Signup, Some(user))
        .await
        .unwrap();
    let login = wallets
        .issue_challenge(&wallet.address, SignaturePurpose::Login, None)
        .await
        .unwrap();
    let second = wallets
        .issue_challenge(&wallet.address, SignaturePurpose::Signup, Some(user))
        .await
        .unwrap();

    let status = |nonce: String| {
        let address = wallet.address.clone();
        let repository = h.repositories.wallets.clone();
        async move {
            repository
                .find_signature(&address, &nonce)
                .await
                .unwrap()
                .unwrap()
                .status
        }
    };
    assert_eq!(status(first.nonce.clone()).await, SignatureStatus::Inactive);
    assert_eq!(status(login.nonce.clone()).await, SignatureStatus::Active);
    assert_eq!(status(second.nonce.clone()).await, SignatureStatus::Active);

    let signature = sign_personal_message(&wallet.secret, &first.signed_message);
    let err = wallets
        .verify(&wallet.address, &signature, &first.nonce, Some(user))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Wallet(WalletError::ChallengeNotActive(SignatureStatus::Inactive))
    ));

    let signature = sign_personal_message(&wallet.secret, &second.signed_message);
    let linked = wallets
        .verify(&wallet.address, &signature, &second.nonce, Some(user))
        .await
        .unwrap();
    assert_eq!(linked, user);
}

#[tokio::test]
async fn signature_from_another_key_is_rejected() {
    let h = Harness::new().await;
    let user = h.user();
    let wallet = signer(9);
    let impostor = signer(10);

    let challenge = h
        .services
        .wallets
        .issue_challenge(&wallet.address, SignaturePurpose::Signup, Some(user))
        .await
        .unwrap();
    let forged = sign_personal_message(&impostor.secret, &challenge.signed_message);

    let err = h
        .services
        .wallets
        .verify(&wallet.address, &forged, &challenge.nonce, Some(user))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Wallet(WalletError::AddressMismatch(_))));
    assert!(h.services.wallets.wallet_for_user(user).await.unwrap().is_none());

    // The soft variant reports refusal without an error.
    let soft = h
        .services
        .wallets
        .verify_signature(&wallet.address, &forged, &challenge.nonce, Some(user))
        .await
        .unwrap();
    assert_eq!(soft, None);
}

#[tokio::test]
async fn expired_challenge_is_rejected() {
    let h = Harness::new().await;
    let user = h.user();
    let wallet = signer(11);

    let challenge = h
        .services
        .wallets
        .issue_challenge(&wallet.address, SignaturePurpose::Signup, Some(user))
        .await
        .unwrap();
    let stored = h
        .repositories
        .wallets
        .find_signature(&wallet.address, &challenge.nonce)
        .await
        .unwrap()
        .unwrap();
    h.store.backdate_signature(stored.id, Duration::hours(1));

    let signature = sign_personal_message(&wallet.secret, &challenge.signed_message);
    let err = h
        .services
        .wallets
        .verify(&wallet.address, &signature, &challenge.nonce, Some(user))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Wallet(WalletError::ChallengeExpired)));
}

#[tokio::test]
async fn stale_challenges_are_swept() {
    let h = Harness::new().await;
    let wallet = signer(12);

    let challenge = h
        .services
        .wallets
        .issue_challenge(&wallet.address, SignaturePurpose::Login, None)
        .await
        .unwrap();
    let stored = h
        .repositories
        .wallets
        .find_signature(&wallet.address, &challenge.nonce)
        .await
        .unwrap()
        .unwrap();
    h.store.backdate_signature(stored.id, Duration::hours(1));

    assert_eq!(h.services.wallets.expire_stale_signatures().await.unwrap(), 1);
    assert_eq!(h.services.wallets.expire_stale_signatures().await.unwrap(), 0);
}

#[tokio::test]
async fn connect_needs_a_signed_in_user() {
    let h = Harness::new().await;
    let wallet = signer(13);

    let err = h
        .services
        .wallets
        .issue_challenge(&wallet.address, SignaturePurpose::Connect, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Wallet(WalletError::UserRequired(SignaturePurpose::Connect))
    ));
}

#[tokio::test]
async fn linked_address_cannot_be_taken_until_archived() {
    let h = Harness::new().await;
    let (first, second) = (h.user(), h.user());
    let wallet = signer(14);

    sign_in(&h, &wallet, SignaturePurpose::Signup, Some(first)).await.unwrap();
    let err = sign_in(&h, &wallet, SignaturePurpose::Connect, Some(second))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Wallet(WalletError::AddressTaken)));

    let archived = h.services.wallets.reset_wallet(first).await.unwrap();
    assert!(archived.archived);

    let reclaimed = sign_in(&h, &wallet, SignaturePurpose::Connect, Some(second))
        .await
        .unwrap();
    assert_eq!(reclaimed, second);
    assert!(h.services.wallets.wallet_for_user(first).await.unwrap().is_none());
}

#[tokio::test]
async fn removing_a_wallet_requires_a_password() {
    let h = Harness::new().await;
    let user = Uuid::new_v4();
    h.store.add_account(UserAccount {
        id: user,
        has_password: false,
        currency: Currency::Hkd,
        is_admin: false,
    });
    let wallet = signer(15);
    let linked = h.store.add_wallet(user, &wallet.address);

    let err = h.services.wallets.reset_wallet(user).await.unwrap_err();
    assert!(matches!(err, AppError::Wallet(WalletError::PasswordRequired)));
    let err = h
        .services
        .wallets
        .delete_wallet(user, linked.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Wallet(WalletError::PasswordRequired)));
}

#[tokio::test]
async fn only_the_owner_deletes_a_wallet() {
    let h = Harness::new().await;
    let (owner, other) = (h.user(), h.user());
    let wallet = h.store.add_wallet(owner, &signer(16).address);

    let err = h
        .services
        .wallets
        .delete_wallet(other, wallet.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    let deleted = h.services.wallets.delete_wallet(owner, wallet.id).await.unwrap();
    assert!(deleted.archived);
    let err = h
        .services
        .wallets
        .delete_wallet(owner, wallet.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}
