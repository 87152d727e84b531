//! `personal_sign` (EIP-191) signatures over secp256k1.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use sha3::{Digest, Keccak256};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature is not valid hex")]
    Encoding,
    #[error("signature must be 65 bytes, got {0}")]
    Length(usize),
    #[error("invalid recovery id {0}")]
    RecoveryId(u8),
    #[error("signature does not recover to a public key")]
    Unrecoverable,
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// `keccak256("\x19Ethereum Signed Message:\n" + len(message) + message)`.
pub fn personal_message_hash(message: &str) -> [u8; 32] {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", message.len());
    let mut hasher = Keccak256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(message.as_bytes());
    hasher.finalize().into()
}

/// Lowercase `0x` address of an uncompressed public key.
pub fn address_of(public_key: &PublicKey) -> String {
    let uncompressed = public_key.serialize_uncompressed();
    let hash = keccak256(&uncompressed[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

/// Recovers the lowercase address that produced `signature` (hex `r || s || v`,
/// `v` in {0, 1, 27, 28}) over `message`.
pub fn recover_address(message: &str, signature: &str) -> Result<String, SignatureError> {
    let bytes = hex::decode(signature.trim().trim_start_matches("0x"))
        .map_err(|_| SignatureError::Encoding)?;
    if bytes.len() != 65 {
        return Err(SignatureError::Length(bytes.len()));
    }

    let v = bytes[64];
    let recovery = match v {
        0 | 1 => v,
        27 | 28 => v - 27,
        other => return Err(SignatureError::RecoveryId(other)),
    };
    let recovery_id =
        RecoveryId::from_i32(i32::from(recovery)).map_err(|_| SignatureError::RecoveryId(v))?;
    let signature = RecoverableSignature::from_compact(&bytes[..64], recovery_id)
        .map_err(|_| SignatureError::Unrecoverable)?;

    let message = Message::from_digest_slice(&personal_message_hash(message))
        .map_err(|_| SignatureError::Unrecoverable)?;
    let public_key = SECP256K1
        .recover_ecdsa(&message, &signature)
        .map_err(|_| SignatureError::Unrecoverable)?;

    Ok(address_of(&public_key))
}

/// Signs like a wallet's `personal_sign`; returns hex `r || s || v` with `v` in {27, 28}.
pub fn sign_personal_message(secret_key: &SecretKey, message: &str) -> String {
    let message = Message::from_digest(personal_message_hash(message));
    let (recovery_id, compact) = SECP256K1
        .sign_ecdsa_recoverable(&message, secret_key)
        .serialize_compact();

    let mut bytes = compact.to_vec();
    bytes.push(27 + recovery_id.to_i32() as u8);
    format!("0x{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).unwrap()
    }

    #[test]
    fn recovers_signer_address() {
        let secret = key(7);
        let expected = address_of(&PublicKey::from_secret_key(SECP256K1, &secret));

        let signature = sign_personal_message(&secret, "hello");
        assert_eq!(recover_address("hello", &signature).unwrap(), expected);
    }

    #[test]
    fn accepts_zero_based_recovery_id() {
        let secret = key(9);
        let expected = address_of(&PublicKey::from_secret_key(SECP256K1, &secret));

        let signature = sign_personal_message(&secret, "nonce");
        let mut bytes = hex::decode(signature.trim_start_matches("0x")).unwrap();
        bytes[64] -= 27;
        assert_eq!(
            recover_address("nonce", &hex::encode(bytes)).unwrap(),
            expected
        );
    }

    #[test]
    fn different_message_recovers_different_address() {
        let secret = key(3);
        let expected = address_of(&PublicKey::from_secret_key(SECP256K1, &secret));

        let signature = sign_personal_message(&secret, "original");
        assert_ne!(recover_address("tampered", &signature).unwrap(), expected);
    }

    #[test]
    fn rejects_malformed_signatures() {
        assert_eq!(recover_address("m", "0xzz"), Err(SignatureError::Encoding));
        assert_eq!(recover_address("m", "0x1234"), Err(SignatureError::Length(2)));

        let mut bytes = vec![1u8; 65];
        bytes[64] = 5;
        assert_eq!(
            recover_address("m", &hex::encode(bytes)),
            Err(SignatureError::RecoveryId(5))
        );
    }

    #[test]
    fn known_address_vector() {
        // Private key 0x01 maps to a well-known address.
        let mut bytes = [0u8; 32];
        bytes[31] = 1;
        let secret = SecretKey::from_slice(&bytes).unwrap();
        assert_eq!(
            address_of(&PublicKey::from_secret_key(SECP256K1, &secret)),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }
}
