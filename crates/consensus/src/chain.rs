//! The chain state machine.
//!
//! One writer owns this structure and applies blocks serially; everything
//! other components observe (balances, nonces, contract states, cell
//! counters) changes only through [`Chain::submit_block`]. Application is
//! all-or-nothing: transactions execute against working copies of the
//! account map and the contract registry, and nothing is committed until
//! the whole block validates.

use crate::bft::{epoch_of, ValidatorRegistry};
use crate::difficulty::{is_retarget_height, retarget};
use crate::emission::scheduled_reward;
use crate::fork::{challenger_wins, TipCandidate};
use crate::validator::validate_structure;
use logichain_contracts::ContractRegistry;
use logichain_grid::CoordinateGrid;
use logichain_storage::{ChainStore, StorageError, TipInfo, UndoRecord};
use logichain_types::{
    Account, Address, Amount, Block, BlockHash, CellSnapshot, ChainConfig, ChainMode, Contract,
    ContractAction, ContractCreatePayload, ContractFinalizePayload, ContractId, ContractState,
    CoreError, CoreEvent, CoreResult, GeoPoint, Transaction, TxType,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{error, info, warn};

/// Network reserve share of contract payouts accrues here.
pub const RESERVE_ADDRESS: Address = Address([0u8; 20]);

/// Validator pool share of contract payouts accrues here.
pub const VALIDATOR_POOL_ADDRESS: Address = Address([0xFFu8; 20]);

/// Reputation weights for delivery outcomes.
const REPUTATION_SUCCESS_WEIGHT: f64 = 0.05;
const REPUTATION_FAILURE_WEIGHT: f64 = 0.2;

const META_EMISSION: &str = "emission";
const META_GENESIS: &str = "genesis_allocations";

#[derive(Debug, Serialize, Deserialize, Default)]
struct EmissionMeta {
    issued: Amount,
    burned: Amount,
    finalized_height: u64,
}

/// Everything the chain knows about a block header, best chain or not.
#[derive(Debug, Clone, Copy)]
struct HeaderMeta {
    height: u64,
    parent: BlockHash,
    cumulative_work: u128,
    timestamp: f64,
    difficulty: u32,
}

/// The result of accepting a block.
#[derive(Debug, Default)]
pub struct BlockOutcome {
    pub events: Vec<CoreEvent>,
    /// Transactions from abandoned blocks to offer back to the mempool.
    pub readmit: Vec<Transaction>,
}

/// Aggregate chain facts, used by queries and the conservation audit.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainStats {
    pub height: u64,
    pub tip_hash: BlockHash,
    pub cumulative_work: u128,
    pub issued: Amount,
    pub burned: Amount,
    pub escrowed: Amount,
    pub finalized_height: u64,
}

pub struct Chain {
    config: ChainConfig,
    store: ChainStore,
    grid: CoordinateGrid,
    registry: ContractRegistry,
    accounts: HashMap<Address, Account>,
    headers: HashMap<BlockHash, HeaderMeta>,
    /// Bodies of known blocks off the best chain.
    side_blocks: HashMap<BlockHash, Block>,
    pub validators: ValidatorRegistry,
    tip: Option<TipInfo>,
    issued: Amount,
    burned: Amount,
    finalized_height: u64,
    halted: bool,
}

impl Chain {
    /// Open a chain over an existing store, replaying segments when the
    /// index is inconsistent.
    pub fn open(config: ChainConfig, store: ChainStore) -> CoreResult<Self> {
        let mut chain = Self {
            config,
            store,
            grid: CoordinateGrid::new(0),
            registry: ContractRegistry::new(),
            accounts: HashMap::new(),
            headers: HashMap::new(),
            side_blocks: HashMap::new(),
            validators: ValidatorRegistry::new(),
            tip: None,
            issued: Amount::ZERO,
            burned: Amount::ZERO,
            finalized_height: 0,
            halted: false,
        };
        chain.grid = CoordinateGrid::new(chain.config.max_coordinate_ops_per_minute);

        if chain.store.needs_replay().map_err(persistence)? {
            chain.rebuild_from_segments()?;
        } else {
            chain.load_state()?;
        }
        Ok(chain)
    }

    fn load_state(&mut self) -> CoreResult<()> {
        self.tip = self.store.tip().map_err(persistence)?;
        self.accounts = self
            .store
            .all_accounts()
            .map_err(persistence)?
            .into_iter()
            .map(|account| (account.address, account))
            .collect();
        self.registry
            .restore(self.store.all_contracts().map_err(persistence)?);
        self.grid
            .restore(self.store.all_cells().map_err(persistence)?);

        if let Some(bytes) = self.store.meta_blob(META_EMISSION).map_err(persistence)? {
            let meta: EmissionMeta = serde_json::from_slice(&bytes)
                .map_err(|e| CoreError::IndexCorruption(e.to_string()))?;
            self.issued = meta.issued;
            self.burned = meta.burned;
            self.finalized_height = meta.finalized_height;
        }

        // Seed header metadata for the best chain.
        if let Some(tip) = self.tip {
            let mut work = 0u128;
            for height in 0..=tip.height {
                let block = self
                    .store
                    .block_by_height(height)
                    .map_err(persistence)?
                    .ok_or_else(|| {
                        CoreError::IndexCorruption(format!("missing block at height {height}"))
                    })?;
                work += block.header.work();
                self.headers.insert(
                    block.hash(),
                    HeaderMeta {
                        height,
                        parent: block.header.parent_hash,
                        cumulative_work: work,
                        timestamp: block.header.timestamp,
                        difficulty: block.header.difficulty,
                    },
                );
            }
        }
        Ok(())
    }

    /// Reconstruct state by re-applying replayed blocks along parent
    /// links from genesis.
    fn rebuild_from_segments(&mut self) -> CoreResult<()> {
        let blocks = self.store.replay_index().map_err(persistence)?;
        let by_parent: HashMap<BlockHash, Vec<&Block>> = {
            let mut map: HashMap<BlockHash, Vec<&Block>> = HashMap::new();
            for block in &blocks {
                map.entry(block.header.parent_hash).or_default().push(block);
            }
            map
        };

        let Some(genesis) = blocks.iter().find(|b| b.header.height == 0) else {
            warn!("no genesis in segments; starting empty");
            return Ok(());
        };
        let allocations: Vec<(Address, Amount)> = self
            .store
            .meta_blob(META_GENESIS)
            .map_err(persistence)?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .map_err(|e| CoreError::IndexCorruption(e.to_string()))?
            .unwrap_or_default();
        self.store.reset_state().map_err(persistence)?;

        // Walk the heaviest path greedily from genesis.
        let mut path = vec![genesis.clone()];
        let mut cursor = genesis.hash();
        while let Some(children) = by_parent.get(&cursor) {
            let best = children
                .iter()
                .max_by_key(|b| (b.header.work(), std::cmp::Reverse(b.hash())))
                .copied();
            match best {
                Some(block) => {
                    path.push(block.clone());
                    cursor = block.hash();
                }
                None => break,
            }
        }

        info!(blocks = path.len(), "re-applying best chain from segments");
        let genesis = path.remove(0);
        self.apply_genesis_block(genesis, &allocations)?;
        for block in path {
            let timestamp = block.header.timestamp;
            self.submit_block(block, timestamp + self.config.t_drift_secs)?;
        }
        Ok(())
    }

    /// Create and commit the genesis block with the configured wallet
    /// allocations. Refused once a tip exists.
    pub fn init_genesis(
        &mut self,
        allocations: &[(Address, Amount)],
        timestamp: f64,
    ) -> CoreResult<BlockHash> {
        if self.tip.is_some() {
            return Err(CoreError::InvalidBlockStructure(
                "genesis already initialized".into(),
            ));
        }
        let genesis = Block {
            header: logichain_types::BlockHeader {
                version: logichain_types::BLOCK_VERSION,
                height: 0,
                parent_hash: [0; 32],
                merkle_root: [0; 32],
                timestamp,
                difficulty: 0,
                nonce: 0,
                miner: RESERVE_ADDRESS,
                mode: self.config.mode,
            },
            attestations: Vec::new(),
            transactions: Vec::new(),
        };
        let hash = genesis.hash();
        let bytes = serde_json::to_vec(&allocations.to_vec())
            .map_err(|e| CoreError::PersistenceIoError(e.to_string()))?;
        self.store
            .put_meta_blob(META_GENESIS, &bytes)
            .map_err(persistence)?;
        self.apply_genesis_block(genesis, allocations)?;
        Ok(hash)
    }

    fn apply_genesis_block(
        &mut self,
        genesis: Block,
        allocations: &[(Address, Amount)],
    ) -> CoreResult<()> {
        let hash = genesis.hash();
        let timestamp = genesis.header.timestamp;

        let mut created = Vec::new();
        let mut minted = Amount::ZERO;
        for (address, balance) in allocations {
            self.accounts
                .insert(*address, Account::with_balance(*address, *balance, timestamp));
            self.store
                .put_account(&self.accounts[address])
                .map_err(persistence)?;
            created.push(*address);
            minted = minted
                .checked_add(*balance)
                .ok_or_else(|| CoreError::ResourceExhausted("genesis overflow".into()))?;
        }
        self.issued = minted;

        let undo = UndoRecord {
            block_hash: hash,
            parent_hash: genesis.header.parent_hash,
            height: 0,
            accounts_before: Vec::new(),
            created_accounts: created,
            contracts_before: Vec::new(),
            created_contracts: Vec::new(),
            cells_before: Vec::new(),
            tx_hashes: genesis.tx_hashes(),
        };
        let tip = TipInfo {
            hash,
            height: 0,
            cumulative_work: genesis.header.work(),
        };
        self.store
            .store_block(&genesis, &undo, tip)
            .map_err(persistence)?;
        self.persist_emission()?;

        self.headers.insert(
            hash,
            HeaderMeta {
                height: 0,
                parent: genesis.header.parent_hash,
                cumulative_work: tip.cumulative_work,
                timestamp,
                difficulty: genesis.header.difficulty,
            },
        );
        self.tip = Some(tip);
        info!(hash = %hex::encode(hash), wallets = allocations.len(), "genesis committed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn tip_info(&self) -> Option<TipInfo> {
        self.tip
    }

    pub fn account(&self, address: &Address) -> Option<&Account> {
        self.accounts.get(address)
    }

    /// Committed nonce of a sender (0 for unknown accounts).
    pub fn next_nonce_base(&self, address: &Address) -> u64 {
        self.accounts.get(address).map(|a| a.nonce).unwrap_or(0)
    }

    pub fn contract(&self, id: &ContractId) -> Option<&Contract> {
        self.registry.get(id)
    }

    pub fn grid(&self) -> &CoordinateGrid {
        &self.grid
    }

    pub fn issued(&self) -> Amount {
        self.issued
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn stats(&self) -> Option<ChainStats> {
        let tip = self.tip?;
        Some(ChainStats {
            height: tip.height,
            tip_hash: tip.hash,
            cumulative_work: tip.cumulative_work,
            issued: self.issued,
            burned: self.burned,
            escrowed: self.registry.escrowed_total(),
            finalized_height: self.finalized_height,
        })
    }

    /// Conservation invariant: balances + escrow + burned == issued.
    pub fn audit_conservation(&self) -> CoreResult<()> {
        let balances: Amount = self.accounts.values().map(|a| a.balance).sum();
        let total = balances
            .checked_add(self.registry.escrowed_total())
            .and_then(|t| t.checked_add(self.burned))
            .ok_or_else(|| CoreError::ResourceExhausted("conservation overflow".into()))?;
        if total != self.issued {
            return Err(CoreError::IndexCorruption(format!(
                "conservation violated: {total} held vs {} issued",
                self.issued
            )));
        }
        Ok(())
    }

    /// Difficulty the next block must carry.
    pub fn next_difficulty(&self) -> CoreResult<u32> {
        let Some(tip) = self.tip else {
            return Ok(self.config.initial_difficulty_bits);
        };
        let tip_meta = self.headers[&tip.hash];
        let height = tip.height + 1;
        if tip.height == 0 {
            return Ok(self.config.initial_difficulty_bits);
        }
        if !is_retarget_height(height, &self.config) {
            return Ok(tip_meta.difficulty);
        }
        let window_start = self
            .store
            .block_by_height(height - self.config.difficulty_retarget_interval)
            .map_err(persistence)?
            .ok_or_else(|| CoreError::IndexCorruption("missing retarget window start".into()))?;
        Ok(retarget(
            tip_meta.difficulty,
            tip_meta.timestamp - window_start.header.timestamp,
            &self.config,
        ))
    }

    // ------------------------------------------------------------------
    // Block intake
    // ------------------------------------------------------------------

    /// Accept a block: extend the best chain, record a fork, or reorg.
    pub fn submit_block(&mut self, block: Block, now: f64) -> CoreResult<BlockOutcome> {
        if self.halted {
            return Err(CoreError::PersistenceIoError(
                "block application halted; operator action required".into(),
            ));
        }
        let hash = block.hash();
        if self.headers.contains_key(&hash) {
            return Err(CoreError::DuplicateTransaction);
        }
        let Some(tip) = self.tip else {
            return Err(CoreError::ParentUnknown);
        };

        if block.header.parent_hash == tip.hash {
            let events = self.validate_and_apply(&block, now)?;
            return Ok(BlockOutcome {
                events,
                readmit: Vec::new(),
            });
        }

        // Off the tip: either a known fork point or an orphan.
        let Some(parent_meta) = self.headers.get(&block.header.parent_hash).copied() else {
            return Err(CoreError::ParentUnknown);
        };

        validate_structure(&block, &self.config, now)?;
        if block.header.height != parent_meta.height + 1 {
            return Err(CoreError::InvalidBlockStructure(format!(
                "height {} does not extend parent at {}",
                block.header.height, parent_meta.height
            )));
        }

        let candidate_work = parent_meta.cumulative_work + block.header.work();
        self.headers.insert(
            hash,
            HeaderMeta {
                height: block.header.height,
                parent: block.header.parent_hash,
                cumulative_work: candidate_work,
                timestamp: block.header.timestamp,
                difficulty: block.header.difficulty,
            },
        );
        self.side_blocks.insert(hash, block);

        let current = TipCandidate {
            hash: tip.hash,
            cumulative_work: tip.cumulative_work,
            finalized_height: self.finalized_height,
        };
        let challenger = TipCandidate {
            hash,
            cumulative_work: candidate_work,
            // A fork cannot claim finality it has not earned.
            finalized_height: 0,
        };
        if !challenger_wins(&current, &challenger) {
            info!(hash = %hex::encode(hash), "fork block recorded, best chain unchanged");
            return Ok(BlockOutcome::default());
        }

        self.reorg_to(hash, now)
    }

    /// Path from a side-chain tip back to the best-chain fork point.
    fn branch_to(&self, tip_hash: BlockHash) -> CoreResult<(u64, Vec<Block>)> {
        let mut branch = Vec::new();
        let mut cursor = tip_hash;
        loop {
            let meta = self
                .headers
                .get(&cursor)
                .ok_or(CoreError::ParentUnknown)?;
            let on_best_chain = self
                .store
                .block_by_height(meta.height)
                .map_err(persistence)?
                .map(|b| b.hash() == cursor)
                .unwrap_or(false);
            if on_best_chain {
                return Ok((meta.height, branch));
            }
            let block = self
                .side_blocks
                .get(&cursor)
                .cloned()
                .ok_or(CoreError::ParentUnknown)?;
            cursor = block.header.parent_hash;
            branch.push(block);
        }
    }

    /// Switch the best chain to the branch ending at `new_tip_hash`.
    fn reorg_to(&mut self, new_tip_hash: BlockHash, now: f64) -> CoreResult<BlockOutcome> {
        let old_tip = self.tip.expect("reorg requires a tip");
        let (ancestor_height, mut branch) = self.branch_to(new_tip_hash)?;
        branch.reverse();

        let depth = old_tip.height - ancestor_height;
        if depth > self.config.reorg_window {
            warn!(
                depth,
                window = self.config.reorg_window,
                "refusing reorg beyond window; recording suspicious fork"
            );
            return Err(CoreError::ReorgBeyondWindow {
                depth,
                window: self.config.reorg_window,
            });
        }

        // Undo the disjoint suffix, remembering it for restore.
        let mut abandoned: Vec<Block> = Vec::new();
        for height in (ancestor_height + 1..=old_tip.height).rev() {
            let block = self
                .store
                .block_by_height(height)
                .map_err(persistence)?
                .ok_or_else(|| {
                    CoreError::IndexCorruption(format!("missing block at height {height}"))
                })?;
            self.rollback_one(&block)?;
            abandoned.push(block);
        }

        // Apply the new suffix; restore from the snapshot on any failure.
        let mut applied = 0usize;
        let mut apply_error = None;
        for block in &branch {
            match self.validate_and_apply(block, now) {
                Ok(_) => applied += 1,
                Err(error) => {
                    apply_error = Some(error);
                    break;
                }
            }
        }

        if let Some(error) = apply_error {
            warn!(%error, "reorg failed; restoring previous chain");
            for block in branch.iter().take(applied).rev() {
                self.rollback_one(block)?;
            }
            for block in abandoned.iter().rev() {
                self.validate_and_apply(block, now)?;
            }
            return Err(error);
        }

        // The branch blocks are canonical now.
        for block in &branch {
            self.side_blocks.remove(&block.hash());
        }
        let new_tip = self.tip.expect("branch applied");
        let readmit: Vec<Transaction> = abandoned
            .iter()
            .rev()
            .flat_map(|block| block.transactions.clone())
            .collect();
        // Abandoned blocks become side blocks, available for a switch back.
        for block in abandoned {
            self.side_blocks.insert(block.hash(), block);
        }

        info!(
            depth,
            new_height = new_tip.height,
            "reorg complete"
        );
        Ok(BlockOutcome {
            events: vec![CoreEvent::Reorg {
                old_tip: old_tip.hash,
                new_tip: new_tip.hash,
                depth,
            }],
            readmit,
        })
    }

    /// Undo the current tip (which must be `block`), restoring memory and
    /// storage state.
    fn rollback_one(&mut self, block: &Block) -> CoreResult<()> {
        let parent_meta = self
            .headers
            .get(&block.header.parent_hash)
            .copied()
            .ok_or(CoreError::ParentUnknown)?;
        let new_tip = TipInfo {
            hash: block.header.parent_hash,
            height: parent_meta.height,
            cumulative_work: parent_meta.cumulative_work,
        };
        self.store
            .rollback_tip(Some(new_tip))
            .map_err(persistence)?;

        // Reverse the emission of this block.
        let minted = self.minted_in(block);
        self.issued = self.issued.checked_sub(minted).unwrap_or(Amount::ZERO);
        self.persist_emission()?;

        // Memory mirrors reload from restored storage.
        self.accounts = self
            .store
            .all_accounts()
            .map_err(persistence)?
            .into_iter()
            .map(|account| (account.address, account))
            .collect();
        self.registry
            .restore(self.store.all_contracts().map_err(persistence)?);
        self.grid
            .restore(self.store.all_cells().map_err(persistence)?);
        self.tip = Some(new_tip);
        Ok(())
    }

    /// Freshly minted units in a block: the scheduled part of the coinbase
    /// plus any contract payout pools (fees are transfers, not issuance).
    fn minted_in(&self, block: &Block) -> Amount {
        let fees: Amount = block
            .transactions
            .iter()
            .skip(1)
            .map(|tx| tx.fee)
            .sum();
        let coinbase = block
            .transactions
            .first()
            .map(|tx| tx.amount)
            .unwrap_or(Amount::ZERO);
        let scheduled = coinbase.checked_sub(fees).unwrap_or(Amount::ZERO);

        let finalizations = block
            .transactions
            .iter()
            .filter(|tx| tx.tx_type == TxType::ContractFinalize)
            .count() as i128;
        let base = crate::emission::base_reward(block.header.height, &self.config);
        scheduled
            .checked_add(Amount::from_atomic(base.atomic() * finalizations))
            .unwrap_or(scheduled)
    }

    // ------------------------------------------------------------------
    // Application
    // ------------------------------------------------------------------

    /// Full stateful validation and commit of a block extending the tip.
    fn validate_and_apply(&mut self, block: &Block, now: f64) -> CoreResult<Vec<CoreEvent>> {
        let tip = self.tip.ok_or(CoreError::ParentUnknown)?;
        let tip_meta = self.headers[&tip.hash];

        if block.header.parent_hash != tip.hash {
            return Err(CoreError::ParentUnknown);
        }
        if block.header.height != tip.height + 1 {
            return Err(CoreError::InvalidBlockStructure(format!(
                "expected height {}, got {}",
                tip.height + 1,
                block.header.height
            )));
        }
        validate_structure(block, &self.config, now)?;
        if block.header.timestamp < tip_meta.timestamp - self.config.t_drift_secs {
            return Err(CoreError::TimestampDrift);
        }
        let expected_bits = self.next_difficulty()?;
        if block.header.difficulty != expected_bits {
            return Err(CoreError::InvalidBlockStructure(format!(
                "difficulty {} does not match expected {}",
                block.header.difficulty, expected_bits
            )));
        }

        // Quorum, when the block claims contract finality.
        let has_finalize = block
            .transactions
            .iter()
            .any(|tx| tx.tx_type == TxType::ContractFinalize);
        if has_finalize {
            if self.config.mode == ChainMode::OffGrid {
                // Finality is queued while off grid.
                return Err(CoreError::QuorumInsufficient {
                    got: 0,
                    required: 1,
                });
            }
            let committee = self
                .validators
                .committee(epoch_of(tip.height, &self.config), self.config.committee_size);
            committee.verify_quorum(&block.hash(), &block.attestations)?;
        }

        // Execute against working copies.
        let mut delta = WorkingDelta::new(self, block.header.timestamp);
        delta.execute(block)?;

        // Commit: persist with one retry, then halt.
        let new_tip = TipInfo {
            hash: block.hash(),
            height: block.header.height,
            cumulative_work: tip.cumulative_work + block.header.work(),
        };
        let undo = delta.undo_record(block);
        let WorkingDelta {
            accounts,
            registry,
            issued,
            grid_ops,
            mut events,
            ..
        } = delta;

        if let Err(first) = self.store.store_block(block, &undo, new_tip) {
            warn!(error = %first, "block persistence failed; retrying once");
            if let Err(second) = self
                .store
                .flush()
                .and_then(|_| self.store.store_block(block, &undo, new_tip))
            {
                error!(error = %second, "persistence failed twice; halting block application");
                self.halted = true;
                events.clear();
                events.push(CoreEvent::FatalPersistence {
                    detail: second.to_string(),
                });
                return Err(persistence(second));
            }
        }

        // Commit memory state.
        self.accounts = accounts;
        self.registry = registry;
        self.issued = issued;
        for op in grid_ops {
            op.apply(&self.grid, block.header.timestamp);
        }
        self.sync_cells(&undo)?;
        self.persist_emission()?;

        self.headers.insert(
            new_tip.hash,
            HeaderMeta {
                height: new_tip.height,
                parent: block.header.parent_hash,
                cumulative_work: new_tip.cumulative_work,
                timestamp: block.header.timestamp,
                difficulty: block.header.difficulty,
            },
        );
        self.tip = Some(new_tip);
        if !block.attestations.is_empty() && self.config.requires_bft() {
            self.finalized_height = new_tip.height;
        }

        events.insert(
            0,
            CoreEvent::BlockAppended {
                hash: new_tip.hash,
                height: new_tip.height,
            },
        );
        info!(
            height = new_tip.height,
            hash = %hex::encode(new_tip.hash),
            txs = block.transactions.len(),
            "block appended"
        );
        Ok(events)
    }

    /// Persist the post-block cell counters for every touched cell.
    fn sync_cells(&self, undo: &UndoRecord) -> CoreResult<()> {
        for before in &undo.cells_before {
            let cell = (before.lat, before.lng);
            let snapshot = self
                .grid
                .stats(cell)
                .map(|stats| CellSnapshot {
                    lat: cell.0,
                    lng: cell.1,
                    active_contracts: stats.active_contracts,
                    successes: stats.successes,
                    failures: stats.failures,
                    last_activity: stats.last_activity,
                    success_rate: stats.success_rate,
                    avg_duration_secs: stats.avg_duration_secs,
                })
                .unwrap_or_else(|| CellSnapshot {
                    lat: cell.0,
                    lng: cell.1,
                    active_contracts: 0,
                    successes: 0,
                    failures: 0,
                    last_activity: None,
                    success_rate: 0.0,
                    avg_duration_secs: 0.0,
                });
            self.store.put_cell(&snapshot).map_err(persistence)?;
        }
        Ok(())
    }

    fn persist_emission(&self) -> CoreResult<()> {
        let meta = EmissionMeta {
            issued: self.issued,
            burned: self.burned,
            finalized_height: self.finalized_height,
        };
        let bytes = serde_json::to_vec(&meta)
            .map_err(|e| CoreError::PersistenceIoError(e.to_string()))?;
        self.store
            .put_meta_blob(META_EMISSION, &bytes)
            .map_err(persistence)
    }
}

fn persistence(error: StorageError) -> CoreError {
    CoreError::PersistenceIoError(error.to_string())
}

/// Deferred grid mutation, applied only after the block commits.
enum GridOp {
    Opened(GeoPoint),
    Closed {
        point: GeoPoint,
        success: bool,
        duration_secs: f64,
    },
}

impl GridOp {
    fn point(&self) -> &GeoPoint {
        match self {
            GridOp::Opened(point) => point,
            GridOp::Closed { point, .. } => point,
        }
    }

    fn apply(&self, grid: &CoordinateGrid, now: f64) {
        let result = match self {
            GridOp::Opened(point) => grid.contract_opened(point, now),
            GridOp::Closed {
                point,
                success,
                duration_secs,
            } => grid.contract_closed(point, *success, *duration_secs, now),
        };
        if let Err(error) = result {
            // Validation already vetted the coordinates.
            error!(%error, "grid update failed after commit");
        }
    }
}

/// Working copies of everything a block mutates, plus the undo trail.
struct WorkingDelta<'a> {
    chain: &'a Chain,
    block_time: f64,
    accounts: HashMap<Address, Account>,
    registry: ContractRegistry,
    issued: Amount,
    touched_accounts: HashMap<Address, Option<Account>>,
    touched_contracts: HashMap<ContractId, Option<Contract>>,
    touched_cells: HashSet<(i16, i16)>,
    grid_ops: Vec<GridOp>,
    events: Vec<CoreEvent>,
}

impl<'a> WorkingDelta<'a> {
    fn new(chain: &'a Chain, block_time: f64) -> Self {
        Self {
            chain,
            block_time,
            accounts: chain.accounts.clone(),
            registry: chain.registry.clone(),
            issued: chain.issued,
            touched_accounts: HashMap::new(),
            touched_contracts: HashMap::new(),
            touched_cells: HashSet::new(),
            grid_ops: Vec::new(),
            events: Vec::new(),
        }
    }

    fn execute(&mut self, block: &Block) -> CoreResult<()> {
        let height = block.header.height;

        // Coinbase first: its amount must equal schedule + fees.
        let fees: Amount = block.transactions.iter().skip(1).map(|tx| tx.fee).sum();
        if let Some(coinbase) = block.transactions.first() {
            let scheduled = scheduled_reward(height, self.issued, self.chain.config());
            let expected = scheduled
                .checked_add(fees)
                .ok_or_else(|| CoreError::ResourceExhausted("reward overflow".into()))?;
            if coinbase.amount != expected {
                return Err(CoreError::InvalidBlockStructure(format!(
                    "reward {} does not match schedule {}",
                    coinbase.amount, expected
                )));
            }
            let miner = coinbase.to.ok_or_else(|| {
                CoreError::InvalidBlockStructure("reward without recipient".into())
            })?;
            self.credit(miner, coinbase.amount)?;
            self.issued = self
                .issued
                .checked_add(scheduled)
                .ok_or_else(|| CoreError::ResourceExhausted("issuance overflow".into()))?;
        }

        for tx in block.transactions.iter().skip(1) {
            self.apply_transaction(tx, block)?;
        }

        // Expiration sweep at the block's timestamp.
        let expired = {
            let releases = self.registry.expire_due(self.block_time);
            for release in &releases {
                self.touch_contract_pre(&release.contract_id);
            }
            releases
        };
        for release in expired {
            self.credit(release.creator, release.escrow)?;
            if let Some(driver) = release.driver {
                let account = self.account_mut(driver)?;
                account.nudge_reputation(0.0, REPUTATION_FAILURE_WEIGHT);
            }
            let delivery = self
                .registry
                .get(&release.contract_id)
                .map(|contract| contract.delivery);
            if let Some(point) = delivery {
                self.note_cell(&point);
                self.grid_ops.push(GridOp::Closed {
                    point,
                    success: false,
                    duration_secs: release.duration_secs,
                });
            }
            self.events.push(CoreEvent::ContractStateChanged {
                contract_id: release.contract_id,
                state: ContractState::Expired,
            });
        }

        Ok(())
    }

    fn apply_transaction(&mut self, tx: &Transaction, block: &Block) -> CoreResult<()> {
        let sender = tx
            .from
            .ok_or_else(|| CoreError::InvalidBlockStructure("missing sender".into()))?;

        // Nonce contiguity against the working snapshot.
        let committed = self.accounts.get(&sender).map(|a| a.nonce).unwrap_or(0);
        if tx.nonce != committed + 1 {
            return Err(CoreError::InvalidNonce {
                expected: committed + 1,
                actual: tx.nonce,
            });
        }

        // Spendable charge per type.
        let charge = match tx.tx_type {
            TxType::Transfer | TxType::ContractCreate => tx
                .amount
                .checked_add(tx.fee)
                .ok_or_else(|| CoreError::ResourceExhausted("charge overflow".into()))?,
            _ => tx.fee,
        };
        {
            let account = self.account_mut(sender)?;
            account.debit(charge)?;
            account.nonce += 1;
        }

        match tx.tx_type {
            TxType::Transfer => {
                let recipient = tx.to.ok_or_else(|| {
                    CoreError::InvalidBlockStructure("transfer without recipient".into())
                })?;
                self.credit(recipient, tx.amount)?;
            }
            TxType::ContractCreate => {
                let payload = ContractCreatePayload::decode(&tx.payload)?;
                let id = tx.hash();
                self.touched_contracts.entry(id).or_insert(None);
                self.registry
                    .create(id, sender, tx.amount, self.block_time, &payload)?;
                self.note_cell(&payload.pickup);
                self.grid_ops.push(GridOp::Opened(payload.pickup));
                self.events.push(CoreEvent::ContractStateChanged {
                    contract_id: id,
                    state: ContractState::Open,
                });
            }
            TxType::ContractCheckpoint => {
                let action = ContractAction::decode(&tx.payload)?;
                let id = *action.contract_id();
                self.touch_contract_pre(&id);
                match action {
                    ContractAction::Accept {
                        contract_id,
                        driver_key,
                    } => {
                        let reputation = self
                            .accounts
                            .get(&sender)
                            .map(|a| a.reputation)
                            .unwrap_or(0.0);
                        self.registry.accept(
                            &contract_id,
                            sender,
                            &driver_key,
                            reputation,
                            self.block_time,
                            self.chain.config(),
                        )?;
                        self.events.push(CoreEvent::ContractStateChanged {
                            contract_id,
                            state: ContractState::Accepted,
                        });
                    }
                    ContractAction::Checkpoint {
                        contract_id,
                        checkpoint,
                    } => {
                        let state = self.registry.apply_checkpoint(
                            &contract_id,
                            checkpoint,
                            block.header.timestamp,
                            self.chain.config(),
                        )?;
                        self.events.push(CoreEvent::ContractStateChanged {
                            contract_id,
                            state,
                        });
                    }
                    ContractAction::Dispute { contract_id, .. } => {
                        self.registry.dispute(&contract_id, sender)?;
                        self.events.push(CoreEvent::ContractStateChanged {
                            contract_id,
                            state: ContractState::Disputed,
                        });
                    }
                }
            }
            TxType::ContractFinalize => {
                let payload = ContractFinalizePayload::decode(&tx.payload)?;
                self.touch_contract_pre(&payload.contract_id);
                let release = self
                    .registry
                    .finalize(&payload.contract_id, self.block_time)?;

                // Payout pool: freshly minted base reward plus the escrow.
                let minted = scheduled_reward(block.header.height, self.issued, self.chain.config());
                self.issued = self
                    .issued
                    .checked_add(minted)
                    .ok_or_else(|| CoreError::ResourceExhausted("issuance overflow".into()))?;
                let pool = minted
                    .checked_add(release.escrow)
                    .ok_or_else(|| CoreError::ResourceExhausted("payout overflow".into()))?;

                let (driver_bp, validator_bp, _) =
                    self.chain.config().reward_split.basis_points();
                let driver_share = pool
                    .mul_div(driver_bp, 10_000)
                    .ok_or_else(|| CoreError::ResourceExhausted("payout overflow".into()))?;
                let validator_share = pool
                    .mul_div(validator_bp, 10_000)
                    .ok_or_else(|| CoreError::ResourceExhausted("payout overflow".into()))?;
                let reserve_share = pool
                    .checked_sub(driver_share)
                    .and_then(|rest| rest.checked_sub(validator_share))
                    .ok_or_else(|| CoreError::ResourceExhausted("payout overflow".into()))?;

                let driver = release.driver.ok_or_else(|| {
                    CoreError::ContractStateIllegalTransition {
                        from: "DELIVERED".into(),
                        event: "finalize without driver".into(),
                    }
                })?;
                self.credit(driver, driver_share)?;
                self.credit(VALIDATOR_POOL_ADDRESS, validator_share)?;
                self.credit(RESERVE_ADDRESS, reserve_share)?;

                {
                    let account = self.account_mut(driver)?;
                    account.nudge_reputation(1.0, REPUTATION_SUCCESS_WEIGHT);
                    account.metrics.deliveries += 1;
                    account.metrics.revenue = account
                        .metrics
                        .revenue
                        .checked_add(driver_share)
                        .unwrap_or(account.metrics.revenue);
                }
                {
                    let account = self.account_mut(release.creator)?;
                    account.metrics.completed_contracts += 1;
                }

                let delivery = self
                    .registry
                    .get(&payload.contract_id)
                    .map(|contract| contract.delivery);
                if let Some(point) = delivery {
                    self.note_cell(&point);
                    self.grid_ops.push(GridOp::Closed {
                        point,
                        success: true,
                        duration_secs: release.duration_secs,
                    });
                }
                self.events.push(CoreEvent::ContractStateChanged {
                    contract_id: payload.contract_id,
                    state: ContractState::Validated,
                });
            }
            TxType::MiningReward => {
                return Err(CoreError::InvalidBlockStructure(
                    "reward transaction outside index 0".into(),
                ));
            }
        }
        Ok(())
    }

    /// Mutable access to an account, creating it on first touch and
    /// recording its pre-state for the undo trail.
    fn account_mut(&mut self, address: Address) -> CoreResult<&mut Account> {
        if !self.touched_accounts.contains_key(&address) {
            self.touched_accounts
                .insert(address, self.chain.accounts.get(&address).cloned());
        }
        Ok(self
            .accounts
            .entry(address)
            .or_insert_with(|| Account::new(address, self.block_time)))
    }

    fn credit(&mut self, address: Address, amount: Amount) -> CoreResult<()> {
        self.account_mut(address)?.credit(amount)
    }

    fn touch_contract_pre(&mut self, id: &ContractId) {
        if !self.touched_contracts.contains_key(id) {
            self.touched_contracts
                .insert(*id, self.chain.registry.get(id).cloned());
        }
    }

    fn note_cell(&mut self, point: &GeoPoint) {
        self.touched_cells.insert(point.cell());
    }

    /// Build the reverse delta and write the post-state through to
    /// storage.
    fn undo_record(&mut self, block: &Block) -> UndoRecord {
        // Cells touched by grid ops too.
        let cells: Vec<(i16, i16)> = self
            .grid_ops
            .iter()
            .map(|op| op.point().cell())
            .chain(self.touched_cells.iter().copied())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut accounts_before = Vec::new();
        let mut created_accounts = Vec::new();
        for (address, before) in &self.touched_accounts {
            match before {
                Some(account) => accounts_before.push(account.clone()),
                None => created_accounts.push(*address),
            }
            if let Some(after) = self.accounts.get(address) {
                let _ = self.chain.store.put_account(after);
            }
        }

        let mut contracts_before = Vec::new();
        let mut created_contracts = Vec::new();
        for (id, before) in &self.touched_contracts {
            match before {
                Some(contract) => contracts_before.push(contract.clone()),
                None => created_contracts.push(*id),
            }
            if let Some(after) = self.registry.get(id) {
                let _ = self.chain.store.put_contract(after);
            }
        }

        let cells_before = cells
            .into_iter()
            .map(|cell| {
                self.chain
                    .grid
                    .stats(cell)
                    .map(|stats| CellSnapshot {
                        lat: cell.0,
                        lng: cell.1,
                        active_contracts: stats.active_contracts,
                        successes: stats.successes,
                        failures: stats.failures,
                        last_activity: stats.last_activity,
                        success_rate: stats.success_rate,
                        avg_duration_secs: stats.avg_duration_secs,
                    })
                    .unwrap_or(CellSnapshot {
                        lat: cell.0,
                        lng: cell.1,
                        active_contracts: 0,
                        successes: 0,
                        failures: 0,
                        last_activity: None,
                        success_rate: 0.0,
                        avg_duration_secs: 0.0,
                    })
            })
            .collect();

        UndoRecord {
            block_hash: block.hash(),
            parent_hash: block.header.parent_hash,
            height: block.header.height,
            accounts_before,
            created_accounts,
            contracts_before,
            created_contracts,
            cells_before,
            tx_hashes: block.tx_hashes(),
        }
    }
}
