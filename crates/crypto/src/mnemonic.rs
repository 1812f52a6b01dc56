//! BIP-39 seed phrases.
//!
//! Wallets are derived from twelve-word English mnemonics. The 64-byte
//! BIP-39 seed is hashed down to 32 bytes of key material, which seeds
//! either signature scheme deterministically.

use crate::hashing::sha256;
use crate::keys::{Keypair, SignatureScheme};
use crate::CryptoError;
use bip39::{Language, Mnemonic};
use rand::RngCore;

/// Word count for generated phrases (128 bits of entropy).
pub const MNEMONIC_WORDS: usize = 12;

/// Generate a fresh twelve-word mnemonic phrase.
pub fn generate_mnemonic() -> String {
    let mut entropy = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut entropy);
    // 16 bytes of entropy always form a valid 12-word mnemonic.
    Mnemonic::from_entropy_in(Language::English, &entropy)
        .expect("16-byte entropy is always valid")
        .to_string()
}

/// Derive a keypair from a mnemonic phrase.
///
/// The same phrase yields the same keypair for a given scheme. An empty
/// BIP-39 passphrase is used throughout.
pub fn keypair_from_mnemonic(
    phrase: &str,
    scheme: SignatureScheme,
) -> Result<Keypair, CryptoError> {
    let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase)
        .map_err(|e| CryptoError::InvalidMnemonic(e.to_string()))?;
    if mnemonic.word_count() != MNEMONIC_WORDS {
        return Err(CryptoError::InvalidMnemonic(format!(
            "expected {MNEMONIC_WORDS} words, got {}",
            mnemonic.word_count()
        )));
    }

    let seed = mnemonic.to_seed("");
    let mut material = sha256(&seed);
    // A secp256k1 scalar derived this way is invalid with probability
    // ~2^-128; rehash until accepted so derivation stays total.
    loop {
        match Keypair::from_secret_bytes(scheme, &material) {
            Ok(keypair) => return Ok(keypair),
            Err(_) => material = sha256(&material),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHRASE: &str = "legal winner thank year wave sausage worth useful legal winner thank yellow";

    #[test]
    fn derivation_is_deterministic() {
        let a = keypair_from_mnemonic(PHRASE, SignatureScheme::EcdsaSecp256k1).unwrap();
        let b = keypair_from_mnemonic(PHRASE, SignatureScheme::EcdsaSecp256k1).unwrap();
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn schemes_derive_distinct_keys() {
        let wallet = keypair_from_mnemonic(PHRASE, SignatureScheme::EcdsaSecp256k1).unwrap();
        let validator = keypair_from_mnemonic(PHRASE, SignatureScheme::Ed25519).unwrap();
        assert_ne!(wallet.public_key().bytes, validator.public_key().bytes);
    }

    #[test]
    fn generated_phrase_has_twelve_words() {
        let phrase = generate_mnemonic();
        assert_eq!(phrase.split_whitespace().count(), MNEMONIC_WORDS);
        keypair_from_mnemonic(&phrase, SignatureScheme::Ed25519).unwrap();
    }

    #[test]
    fn garbage_phrase_rejected() {
        assert!(keypair_from_mnemonic("not a mnemonic", SignatureScheme::Ed25519).is_err());
    }

    #[test]
    fn wrong_word_count_rejected() {
        // A valid 24-word phrase is still refused: wallets are 12-word only.
        let phrase = "legal winner thank year wave sausage worth useful legal winner thank year \
                      wave sausage worth useful legal winner thank year wave sausage worth title";
        assert!(keypair_from_mnemonic(phrase, SignatureScheme::Ed25519).is_err());
    }
}
