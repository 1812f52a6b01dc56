//! Stateless block validation.
//!
//! Everything here is checkable from the block bytes and the chain
//! configuration alone. Stateful checks (parent linkage, nonces against
//! the account snapshot, contract transitions, quorum membership) run in
//! the chain's application path, in the order the protocol prescribes.

use logichain_crypto::merkle_root;
use logichain_types::{Block, ChainConfig, CoreError, CoreResult, TxType};

/// Validate block structure, caps, signatures, merkle root, and the
/// proof-of-work target. `now` is the validator's wall clock; blocks from
/// more than twice the drift tolerance in the future are refused.
pub fn validate_structure(block: &Block, config: &ChainConfig, now: f64) -> CoreResult<()> {
    if block.header.mode != config.mode {
        return Err(CoreError::InvalidBlockStructure(format!(
            "block mode {} does not match node mode {}",
            block.header.mode, config.mode
        )));
    }

    if block.header.timestamp > now + 2.0 * config.t_drift_secs {
        return Err(CoreError::TimestampDrift);
    }

    if block.transactions.len() > config.tx_count_cap {
        return Err(CoreError::BlockTooLarge);
    }
    if block.size() > config.block_size_cap_bytes {
        return Err(CoreError::BlockTooLarge);
    }

    check_reward_placement(block)?;

    for tx in &block.transactions {
        tx.verify_signature()?;
    }

    if merkle_root(&block.tx_hashes()) != block.header.merkle_root {
        return Err(CoreError::MerkleMismatch);
    }

    if !block.header.meets_difficulty() {
        return Err(CoreError::PoWTargetMissed);
    }

    Ok(())
}

/// Exactly one reward transaction, and it sits at index 0. The genesis
/// block is the one block allowed to carry no transactions.
fn check_reward_placement(block: &Block) -> CoreResult<()> {
    if block.transactions.is_empty() {
        if block.header.height == 0 {
            return Ok(());
        }
        return Err(CoreError::InvalidBlockStructure(
            "block carries no reward transaction".into(),
        ));
    }
    if block.transactions[0].tx_type != TxType::MiningReward {
        return Err(CoreError::InvalidBlockStructure(
            "reward transaction must be at index 0".into(),
        ));
    }
    if block.transactions[1..]
        .iter()
        .any(|tx| tx.tx_type == TxType::MiningReward)
    {
        return Err(CoreError::InvalidBlockStructure(
            "multiple reward transactions".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use logichain_types::{
        Address, Amount, Block, BlockHeader, ChainMode, Transaction, BLOCK_VERSION,
    };

    fn block_with(transactions: Vec<Transaction>, height: u64) -> Block {
        let hashes: Vec<[u8; 32]> = transactions.iter().map(Transaction::hash).collect();
        Block {
            header: BlockHeader {
                version: BLOCK_VERSION,
                height,
                parent_hash: [0; 32],
                merkle_root: merkle_root(&hashes),
                timestamp: 1_000.0,
                difficulty: 0,
                nonce: 0,
                miner: Address([1; 20]),
                mode: ChainMode::OnGrid,
            },
            attestations: Vec::new(),
            transactions,
        }
    }

    fn reward() -> Transaction {
        Transaction::mining_reward(Address([1; 20]), Amount::from_units(50), 1_000.0)
    }

    #[test]
    fn well_formed_block_passes() {
        let block = block_with(vec![reward()], 1);
        validate_structure(&block, &ChainConfig::on_grid(), 1_000.0).unwrap();
    }

    #[test]
    fn empty_genesis_passes() {
        let block = block_with(Vec::new(), 0);
        validate_structure(&block, &ChainConfig::on_grid(), 1_000.0).unwrap();
    }

    #[test]
    fn missing_reward_rejected() {
        let block = block_with(Vec::new(), 1);
        assert!(matches!(
            validate_structure(&block, &ChainConfig::on_grid(), 1_000.0),
            Err(CoreError::InvalidBlockStructure(_))
        ));
    }

    #[test]
    fn far_future_timestamp_rejected() {
        let config = ChainConfig::on_grid();
        let block = block_with(vec![reward()], 1);
        assert_eq!(
            validate_structure(&block, &config, 1_000.0 - 2.0 * config.t_drift_secs - 1.0),
            Err(CoreError::TimestampDrift)
        );
    }

    #[test]
    fn merkle_mismatch_rejected() {
        let mut block = block_with(vec![reward()], 1);
        block.header.merkle_root = [9; 32];
        assert_eq!(
            validate_structure(&block, &ChainConfig::on_grid(), 1_000.0),
            Err(CoreError::MerkleMismatch)
        );
    }

    #[test]
    fn pow_target_enforced() {
        let mut block = block_with(vec![reward()], 1);
        block.header.difficulty = 255;
        assert_eq!(
            validate_structure(&block, &ChainConfig::on_grid(), 1_000.0),
            Err(CoreError::PoWTargetMissed)
        );
    }

    #[test]
    fn off_grid_caps_bind() {
        let config = ChainConfig::off_grid();
        let transactions: Vec<Transaction> = std::iter::once(reward())
            .chain((0..10).map(|i| {
                Transaction::mining_reward(Address([2; 20]), Amount::from_units(1), i as f64)
            }))
            .collect();
        let mut block = block_with(transactions, 1);
        block.header.mode = ChainMode::OffGrid;
        assert_eq!(
            validate_structure(&block, &config, 1_000.0),
            Err(CoreError::BlockTooLarge)
        );
    }

    #[test]
    fn wrong_mode_rejected() {
        let block = block_with(vec![reward()], 1);
        assert!(matches!(
            validate_structure(&block, &ChainConfig::off_grid(), 1_000.0),
            Err(CoreError::InvalidBlockStructure(_))
        ));
    }

    #[test]
    fn duplicate_reward_rejected() {
        let block = block_with(vec![reward(), reward()], 1);
        assert!(matches!(
            validate_structure(&block, &ChainConfig::on_grid(), 1_000.0),
            Err(CoreError::InvalidBlockStructure(_))
        ));
    }
}
