//! Dual signature capability.
//!
//! Validators and proof-of-delivery checkpoints sign with Ed25519
//! (deterministic, fast verification); user wallets sign with ECDSA over
//! secp256k1. Both schemes live behind one [`Keypair`]/[`PublicKey`] pair so
//! callers never branch on the curve.

use crate::hashing::sha256;
use crate::CryptoError;
use ed25519_dalek::{Signer as _, Verifier as _};
use k256::ecdsa::signature::{Signer as _, Verifier as _};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Signature length shared by both schemes (Ed25519 and compact ECDSA).
pub const SIGNATURE_BYTES: usize = 64;

/// Number of trailing digest bytes that form an address payload.
pub const ADDRESS_TAIL_BYTES: usize = 20;

/// Wire tag selecting a signature scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureScheme {
    /// Validators and checkpoint attestations.
    Ed25519,
    /// User wallets.
    EcdsaSecp256k1,
}

impl SignatureScheme {
    pub fn as_byte(self) -> u8 {
        match self {
            SignatureScheme::Ed25519 => 0,
            SignatureScheme::EcdsaSecp256k1 => 1,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(SignatureScheme::Ed25519),
            1 => Some(SignatureScheme::EcdsaSecp256k1),
            _ => None,
        }
    }

    /// Encoded public key length for this scheme (SEC1-compressed for ECDSA).
    pub fn public_key_len(self) -> usize {
        match self {
            SignatureScheme::Ed25519 => 32,
            SignatureScheme::EcdsaSecp256k1 => 33,
        }
    }
}

/// A signing key under one of the supported schemes.
pub enum Keypair {
    Ed25519(ed25519_dalek::SigningKey),
    Ecdsa(k256::ecdsa::SigningKey),
}

impl Keypair {
    /// Generate a fresh random keypair for the given scheme.
    pub fn generate(scheme: SignatureScheme) -> Self {
        match scheme {
            SignatureScheme::Ed25519 => {
                Keypair::Ed25519(ed25519_dalek::SigningKey::generate(&mut OsRng))
            }
            SignatureScheme::EcdsaSecp256k1 => {
                Keypair::Ecdsa(k256::ecdsa::SigningKey::random(&mut OsRng))
            }
        }
    }

    /// Reconstruct a keypair from 32 bytes of secret material.
    pub fn from_secret_bytes(scheme: SignatureScheme, secret: &[u8]) -> Result<Self, CryptoError> {
        if secret.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: secret.len(),
            });
        }
        match scheme {
            SignatureScheme::Ed25519 => {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(secret);
                Ok(Keypair::Ed25519(ed25519_dalek::SigningKey::from_bytes(
                    &bytes,
                )))
            }
            SignatureScheme::EcdsaSecp256k1 => k256::ecdsa::SigningKey::from_slice(secret)
                .map(Keypair::Ecdsa)
                .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string())),
        }
    }

    pub fn scheme(&self) -> SignatureScheme {
        match self {
            Keypair::Ed25519(_) => SignatureScheme::Ed25519,
            Keypair::Ecdsa(_) => SignatureScheme::EcdsaSecp256k1,
        }
    }

    /// The 32 bytes of secret material backing this key.
    pub fn secret_bytes(&self) -> [u8; 32] {
        match self {
            Keypair::Ed25519(key) => key.to_bytes(),
            Keypair::Ecdsa(key) => {
                let mut out = [0u8; 32];
                out.copy_from_slice(&key.to_bytes());
                out
            }
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            Keypair::Ed25519(key) => PublicKey {
                scheme: SignatureScheme::Ed25519,
                bytes: key.verifying_key().to_bytes().to_vec(),
            },
            Keypair::Ecdsa(key) => PublicKey {
                scheme: SignatureScheme::EcdsaSecp256k1,
                bytes: key
                    .verifying_key()
                    .to_encoded_point(true)
                    .as_bytes()
                    .to_vec(),
            },
        }
    }

    /// Sign a canonical message, producing a 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_BYTES] {
        match self {
            Keypair::Ed25519(key) => key.sign(message).to_bytes(),
            Keypair::Ecdsa(key) => {
                let signature: k256::ecdsa::Signature = key.sign(message);
                let mut out = [0u8; SIGNATURE_BYTES];
                out.copy_from_slice(&signature.to_bytes());
                out
            }
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("scheme", &self.scheme())
            .field("public_key", &hex::encode(self.public_key().bytes))
            .finish_non_exhaustive()
    }
}

/// An encoded public key plus its scheme tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub scheme: SignatureScheme,
    #[serde(with = "serde_bytes_hex")]
    pub bytes: Vec<u8>,
}

impl PublicKey {
    pub fn from_bytes(scheme: SignatureScheme, bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != scheme.public_key_len() {
            return Err(CryptoError::InvalidKeyLength {
                expected: scheme.public_key_len(),
                actual: bytes.len(),
            });
        }
        Ok(Self {
            scheme,
            bytes: bytes.to_vec(),
        })
    }

    /// Verify a 64-byte signature over a canonical message.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        if signature.len() != SIGNATURE_BYTES {
            return Err(CryptoError::InvalidSignature(format!(
                "expected {SIGNATURE_BYTES} bytes, got {}",
                signature.len()
            )));
        }
        match self.scheme {
            SignatureScheme::Ed25519 => {
                let key_bytes: [u8; 32] = self
                    .bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CryptoError::InvalidPublicKey("bad length".into()))?;
                let key = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
                    .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
                let mut sig_bytes = [0u8; SIGNATURE_BYTES];
                sig_bytes.copy_from_slice(signature);
                let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
                key.verify(message, &signature)
                    .map_err(|_| CryptoError::VerificationFailed)
            }
            SignatureScheme::EcdsaSecp256k1 => {
                let key = k256::ecdsa::VerifyingKey::from_sec1_bytes(&self.bytes)
                    .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
                let signature = k256::ecdsa::Signature::from_slice(signature)
                    .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
                key.verify(message, &signature)
                    .map_err(|_| CryptoError::VerificationFailed)
            }
        }
    }

    /// The last 20 bytes of SHA-256(public key), the address payload.
    pub fn address_tail(&self) -> [u8; ADDRESS_TAIL_BYTES] {
        let digest = sha256(&self.bytes);
        let mut tail = [0u8; ADDRESS_TAIL_BYTES];
        tail.copy_from_slice(&digest[32 - ADDRESS_TAIL_BYTES..]);
        tail
    }
}

/// Hex-string serde representation for raw key bytes.
mod serde_bytes_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(&encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ed25519_sign_verify_roundtrip() {
        let keypair = Keypair::generate(SignatureScheme::Ed25519);
        let signature = keypair.sign(b"checkpoint payload");
        keypair
            .public_key()
            .verify(b"checkpoint payload", &signature)
            .expect("signature should verify");
    }

    #[test]
    fn ecdsa_sign_verify_roundtrip() {
        let keypair = Keypair::generate(SignatureScheme::EcdsaSecp256k1);
        let signature = keypair.sign(b"wallet transfer");
        keypair
            .public_key()
            .verify(b"wallet transfer", &signature)
            .expect("signature should verify");
    }

    #[test]
    fn tampered_message_rejected() {
        let keypair = Keypair::generate(SignatureScheme::Ed25519);
        let signature = keypair.sign(b"original");
        assert!(keypair.public_key().verify(b"tampered", &signature).is_err());
    }

    #[test]
    fn wrong_scheme_key_rejected_by_length() {
        let ed = Keypair::generate(SignatureScheme::Ed25519).public_key();
        assert!(PublicKey::from_bytes(SignatureScheme::EcdsaSecp256k1, &ed.bytes).is_err());
    }

    #[test]
    fn secret_bytes_roundtrip() {
        for scheme in [SignatureScheme::Ed25519, SignatureScheme::EcdsaSecp256k1] {
            let keypair = Keypair::generate(scheme);
            let restored = Keypair::from_secret_bytes(scheme, &keypair.secret_bytes()).unwrap();
            assert_eq!(keypair.public_key(), restored.public_key());
        }
    }

    #[test]
    fn address_tail_is_twenty_bytes_of_digest() {
        let keypair = Keypair::generate(SignatureScheme::EcdsaSecp256k1);
        let public = keypair.public_key();
        let digest = sha256(&public.bytes);
        assert_eq!(public.address_tail(), &digest[12..]);
    }
}
