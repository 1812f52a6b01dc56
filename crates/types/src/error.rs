//! The core error taxonomy.
//!
//! One tagged union covers every failure the core can surface. Validation
//! errors are local (the offending submission is rejected, the node keeps
//! running); persistence and consensus failures carry their own recovery
//! policies in the owning components.

use logichain_crypto::CryptoError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum CoreError {
    // Transaction validation
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid nonce: expected {expected}, got {actual}")]
    InvalidNonce { expected: u64, actual: u64 },
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("duplicate transaction")]
    DuplicateTransaction,

    // Block validation
    #[error("invalid block structure: {0}")]
    InvalidBlockStructure(String),
    #[error("proof-of-work target missed")]
    PoWTargetMissed,
    #[error("merkle root mismatch")]
    MerkleMismatch,
    #[error("parent block unknown")]
    ParentUnknown,
    #[error("timestamp drift beyond tolerance")]
    TimestampDrift,
    #[error("block exceeds size or transaction cap")]
    BlockTooLarge,

    // Consensus
    #[error("quorum insufficient: {got} of {required}")]
    QuorumInsufficient { got: usize, required: usize },
    #[error("view change timed out")]
    ViewChangeTimeout,
    #[error("proposer misbehavior: {0}")]
    ProposerMisbehavior(String),

    // Contracts and proof of delivery
    #[error("illegal contract transition from {from} on {event}")]
    ContractStateIllegalTransition { from: String, event: String },
    #[error("checkpoint out of tolerance")]
    CheckpointOutOfTolerance,
    #[error("checkpoint out of order")]
    CheckpointOutOfOrder,
    #[error("contract expired")]
    ContractExpired,

    // Ingress protection
    #[error("coordinate cell saturated")]
    CoordinateSaturated,
    #[error("rate limited")]
    RateLimited,
    #[error("replay detected")]
    ReplayDetected,

    // Persistence
    #[error("persistence I/O error: {0}")]
    PersistenceIoError(String),
    #[error("index corruption: {0}")]
    IndexCorruption(String),
    #[error("reorg depth {depth} beyond window {window}")]
    ReorgBeyondWindow { depth: u64, window: u64 },

    // Resource control
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out")]
    Timeout,
}

impl From<CryptoError> for CoreError {
    fn from(error: CryptoError) -> Self {
        match error {
            CryptoError::VerificationFailed
            | CryptoError::InvalidSignature(_)
            | CryptoError::InvalidPublicKey(_)
            | CryptoError::InvalidKeyLength { .. } => CoreError::InvalidSignature,
            CryptoError::TruncatedEncoding => {
                CoreError::InvalidBlockStructure("truncated encoding".into())
            }
            other => CoreError::InvalidBlockStructure(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let error = CoreError::InvalidNonce {
            expected: 3,
            actual: 7,
        };
        assert_eq!(error.to_string(), "invalid nonce: expected 3, got 7");

        let error = CoreError::ReorgBeyondWindow {
            depth: 12,
            window: 6,
        };
        assert_eq!(error.to_string(), "reorg depth 12 beyond window 6");
    }

    #[test]
    fn crypto_failures_map_to_invalid_signature() {
        let error: CoreError = CryptoError::VerificationFailed.into();
        assert_eq!(error, CoreError::InvalidSignature);
    }
}
