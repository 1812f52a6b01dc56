//! Wallet keyfiles.
//!
//! A keypair persisted as a small JSON document: scheme, hex secret, and
//! the derived public key for quick display. Key-file lifecycle tooling
//! (passphrases, rotation) lives outside the core.

use crate::keys::{Keypair, SignatureScheme};
use crate::CryptoError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize)]
struct KeyfileDocument {
    scheme: SignatureScheme,
    secret: String,
    public_key: String,
}

/// Write a keypair to `path` as JSON.
pub fn save_keypair(keypair: &Keypair, path: &Path) -> Result<(), CryptoError> {
    let document = KeyfileDocument {
        scheme: keypair.scheme(),
        secret: hex::encode(keypair.secret_bytes()),
        public_key: hex::encode(&keypair.public_key().bytes),
    };
    let json = serde_json::to_vec_pretty(&document)
        .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
    fs::write(path, json).map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))
}

/// Load a keypair previously written by [`save_keypair`].
pub fn load_keypair(path: &Path) -> Result<Keypair, CryptoError> {
    let bytes = fs::read(path).map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
    let document: KeyfileDocument = serde_json::from_slice(&bytes)
        .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
    let secret = hex::decode(&document.secret)
        .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
    let keypair = Keypair::from_secret_bytes(document.scheme, &secret)?;

    // The stored public key is advisory; refuse files that disagree.
    if hex::encode(&keypair.public_key().bytes) != document.public_key {
        return Err(CryptoError::InvalidPublicKey(
            "keyfile public key does not match secret".into(),
        ));
    }
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        for scheme in [SignatureScheme::Ed25519, SignatureScheme::EcdsaSecp256k1] {
            let keypair = Keypair::generate(scheme);
            let path = dir.path().join(format!("wallet-{}.json", scheme.as_byte()));
            save_keypair(&keypair, &path).unwrap();
            let restored = load_keypair(&path).unwrap();
            assert_eq!(restored.public_key(), keypair.public_key());
        }
    }

    #[test]
    fn tampered_keyfile_rejected() {
        let dir = TempDir::new().unwrap();
        let keypair = Keypair::generate(SignatureScheme::Ed25519);
        let path = dir.path().join("wallet.json");
        save_keypair(&keypair, &path).unwrap();

        let mut text = std::fs::read_to_string(&path).unwrap();
        // Corrupt the advisory public key.
        text = text.replacen("\"public_key\": \"", "\"public_key\": \"00", 1);
        std::fs::write(&path, text).unwrap();
        assert!(load_keypair(&path).is_err());
    }
}
