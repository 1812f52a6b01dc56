//! LogiChain Cryptographic Primitives
//!
//! Hashing, signing, and identity derivation for the LogiChain core.
//!
//! ## Modules
//! - `hashing`: SHA-256 and double-SHA-256 digests
//! - `keys`: the dual signature capability (Ed25519 for validators and
//!   checkpoints, secp256k1 ECDSA for user wallets)
//! - `mnemonic`: BIP-39 twelve-word seed phrase derivation
//! - `merkle`: double-SHA-256 merkle roots and inclusion proofs
//! - `encoding`: canonical length-prefixed field encoding for signed tuples

use thiserror::Error;

/// Cryptographic operation errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("signature verification failed")]
    VerificationFailed,

    #[error("invalid mnemonic phrase: {0}")]
    InvalidMnemonic(String),

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("truncated canonical encoding")]
    TruncatedEncoding,
}

pub mod encoding;
pub mod hashing;
pub mod keyfile;
pub mod keys;
pub mod merkle;
pub mod mnemonic;

pub use encoding::{ByteReader, ByteWriter};
pub use hashing::{double_sha256, leading_zero_bits, sha256};
pub use keyfile::{load_keypair, save_keypair};
pub use keys::{Keypair, PublicKey, SignatureScheme, ADDRESS_TAIL_BYTES, SIGNATURE_BYTES};
pub use merkle::{merkle_proof, merkle_root, verify_merkle_proof, MerkleProof};
pub use mnemonic::{generate_mnemonic, keypair_from_mnemonic, MNEMONIC_WORDS};
