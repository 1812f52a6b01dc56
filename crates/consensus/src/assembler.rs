//! Block assembly and mining.
//!
//! The assembler pulls the highest-priority bundles from the mempool,
//! prepends the coinbase, and mines by scanning nonces until the header
//! hash clears the difficulty target. Mining checks a cancellation flag
//! so a new parent can preempt a running search.

use crate::chain::Chain;
use crate::emission::scheduled_reward;
use logichain_mempool::Mempool;
use logichain_types::{
    Address, Amount, Block, BlockHeader, ChainMode, CoreError, CoreResult, Transaction, TxType,
    BLOCK_HEADER_BYTES, BLOCK_VERSION,
};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// How many nonces to try between cancellation checks.
const CANCEL_CHECK_INTERVAL: u64 = 4096;

/// Build an unmined candidate block on the current tip.
pub fn build_template(
    chain: &Chain,
    mempool: &Mempool,
    miner: Address,
    timestamp: f64,
) -> CoreResult<Block> {
    let tip = chain.tip_info().ok_or(CoreError::ParentUnknown)?;
    let config = chain.config();
    let height = tip.height + 1;

    // Reserve room for the header, the attestation count, and a coinbase.
    let coinbase_probe = Transaction::mining_reward(miner, Amount::ZERO, timestamp);
    let overhead = BLOCK_HEADER_BYTES + 2 + 9 + coinbase_probe.size();
    let byte_budget = config.block_size_cap_bytes.saturating_sub(overhead);

    let mut selected = mempool.select_for_block(byte_budget, config.tx_count_cap - 1);
    if config.mode == ChainMode::OffGrid {
        // Finality is queued while off grid; finalize transactions wait in
        // the pool for reconnection.
        selected.retain(|tx| tx.tx_type != TxType::ContractFinalize);
    }

    let fees: Amount = selected.iter().map(|tx| tx.fee).sum();
    let reward = scheduled_reward(height, chain.issued(), config)
        .checked_add(fees)
        .ok_or_else(|| CoreError::ResourceExhausted("reward overflow".into()))?;

    let mut transactions = Vec::with_capacity(selected.len() + 1);
    transactions.push(Transaction::mining_reward(miner, reward, timestamp));
    transactions.extend(selected);

    let hashes: Vec<[u8; 32]> = transactions.iter().map(Transaction::hash).collect();
    let header = BlockHeader {
        version: BLOCK_VERSION,
        height,
        parent_hash: tip.hash,
        merkle_root: logichain_crypto::merkle_root(&hashes),
        timestamp,
        difficulty: chain.next_difficulty()?,
        nonce: 0,
        miner,
        mode: config.mode,
    };
    Ok(Block {
        header,
        attestations: Vec::new(),
        transactions,
    })
}

/// Search nonces until the proof-of-work target is met or `cancel` is
/// raised (a new parent arrived).
pub fn mine(block: &mut Block, cancel: &AtomicBool) -> CoreResult<()> {
    let mut nonce: u64 = rand::thread_rng().gen();
    let mut tried: u64 = 0;
    loop {
        block.header.nonce = nonce;
        if block.header.meets_difficulty() {
            debug!(
                nonce,
                tried,
                difficulty = block.header.difficulty,
                "nonce found"
            );
            return Ok(());
        }
        nonce = nonce.wrapping_add(1);
        tried += 1;
        if tried % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            return Err(CoreError::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mining_honors_cancellation() {
        let mut block = Block {
            header: BlockHeader {
                version: BLOCK_VERSION,
                height: 1,
                parent_hash: [0; 32],
                merkle_root: [0; 32],
                timestamp: 0.0,
                // Practically unreachable, so only cancellation can end
                // the search.
                difficulty: 200,
                nonce: 0,
                miner: Address([1; 20]),
                mode: ChainMode::OnGrid,
            },
            attestations: Vec::new(),
            transactions: Vec::new(),
        };
        let cancel = AtomicBool::new(true);
        assert_eq!(mine(&mut block, &cancel), Err(CoreError::Cancelled));
    }

    #[test]
    fn low_difficulty_mines_quickly() {
        let mut block = Block {
            header: BlockHeader {
                version: BLOCK_VERSION,
                height: 1,
                parent_hash: [0; 32],
                merkle_root: [0; 32],
                timestamp: 0.0,
                difficulty: 4,
                nonce: 0,
                miner: Address([1; 20]),
                mode: ChainMode::OnGrid,
            },
            attestations: Vec::new(),
            transactions: Vec::new(),
        };
        let cancel = AtomicBool::new(false);
        mine(&mut block, &cancel).unwrap();
        assert!(block.header.meets_difficulty());
    }
}
