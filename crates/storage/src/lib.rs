//! Persistence for the LogiChain core.
//!
//! Block bodies go to append-only segment files; everything that must be
//! looked up (block locations, the height index, the transaction index,
//! account state, contract state, coordinate cells, undo records) lives
//! in a sled keyspace under `chainstate/`. A small MANIFEST/CURRENT pair
//! records the committed tip; if it disagrees with the index on startup,
//! the index is reconstructed by replaying the segments.

pub mod segments;

use logichain_types::{
    Account, Address, Block, BlockHash, CellSnapshot, Contract, ContractId, TxHash,
};
use parking_lot::Mutex;
use segments::{BlockLocation, SegmentStore};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub use segments::SEGMENT_MAGIC;

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("block not found")]
    BlockNotFound,
    #[error("undo record not found for height {0}")]
    UndoNotFound(u64),
}

/// The committed best-chain tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipInfo {
    pub hash: BlockHash,
    pub height: u64,
    pub cumulative_work: u128,
}

/// Manifest file contents; work is kept as a string because JSON numbers
/// do not span 128 bits.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    tip_hash: String,
    height: u64,
    cumulative_work: String,
}

/// Reverse delta for one applied block, enough to restore the chainstate
/// that existed before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoRecord {
    pub block_hash: BlockHash,
    pub parent_hash: BlockHash,
    pub height: u64,
    /// Prior state of every account the block touched (excluding created).
    pub accounts_before: Vec<Account>,
    /// Accounts that did not exist before this block.
    pub created_accounts: Vec<Address>,
    /// Prior state of every contract the block touched (excluding created).
    pub contracts_before: Vec<Contract>,
    /// Contracts created by this block.
    pub created_contracts: Vec<ContractId>,
    /// Prior state of every grid cell the block touched.
    pub cells_before: Vec<CellSnapshot>,
    pub tx_hashes: Vec<TxHash>,
}

/// Where one transaction landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLocation {
    pub block_hash: BlockHash,
    pub index: u32,
}

/// The persistent chainstate.
pub struct ChainStore {
    db: Db,
    blocks: Tree,
    heights: Tree,
    txs: Tree,
    accounts: Tree,
    contracts: Tree,
    cells: Tree,
    undo: Tree,
    meta: Tree,
    segments: Mutex<SegmentStore>,
    chainstate_dir: PathBuf,
}

const META_TIP: &[u8] = b"tip";

impl ChainStore {
    /// Open (or create) a store rooted at `root`: segments under
    /// `root/blocks`, index under `root/chainstate`.
    pub fn open(root: impl AsRef<Path>, segment_max_bytes: u64) -> Result<Self, StorageError> {
        let root = root.as_ref();
        let chainstate_dir = root.join("chainstate");
        fs::create_dir_all(&chainstate_dir)?;
        let db = sled::open(chainstate_dir.join("index"))?;

        let store = Self {
            blocks: db.open_tree("blocks")?,
            heights: db.open_tree("heights")?,
            txs: db.open_tree("txs")?,
            accounts: db.open_tree("coins")?,
            contracts: db.open_tree("contracts")?,
            cells: db.open_tree("cells")?,
            undo: db.open_tree("undo")?,
            meta: db.open_tree("meta")?,
            db,
            segments: Mutex::new(SegmentStore::open(root.join("blocks"), segment_max_bytes)?),
            chainstate_dir,
        };
        store.write_current()?;
        Ok(store)
    }

    /// Whether the manifest and the index disagree, requiring a segment
    /// replay before the chain may serve reads.
    pub fn needs_replay(&self) -> Result<bool, StorageError> {
        let manifest = self.read_manifest()?;
        let indexed = self.tip()?;
        Ok(match (manifest, indexed) {
            (None, None) => false,
            (Some(manifest), Some(tip)) => {
                manifest.tip_hash != hex::encode(tip.hash) || manifest.height != tip.height
            }
            // One side missing: a crash between commits.
            _ => true,
        })
    }

    /// Append a block plus its undo record and advance the tip atomically
    /// from the index's point of view (segment first, index second; a torn
    /// write leaves a replayable segment tail).
    pub fn store_block(
        &self,
        block: &Block,
        undo: &UndoRecord,
        tip: TipInfo,
    ) -> Result<(), StorageError> {
        let hash = block.hash();
        // Bodies are content-addressed: re-applying an already-stored
        // block (replay, reorg switch-back) must not duplicate its record.
        if self.blocks.get(hash)?.is_none() {
            let location = self.segments.lock().append(&block.encode())?;
            self.blocks.insert(hash, serde_json::to_vec(&location)?)?;
        }
        for (index, tx) in block.transactions.iter().enumerate() {
            let tx_location = TxLocation {
                block_hash: hash,
                index: index as u32,
            };
            self.txs
                .insert(tx.hash(), serde_json::to_vec(&tx_location)?)?;
        }
        self.heights
            .insert(block.header.height.to_be_bytes(), &hash[..])?;
        self.undo
            .insert(block.header.height.to_be_bytes(), serde_json::to_vec(undo)?)?;
        self.set_tip(tip)?;
        self.db.flush()?;
        Ok(())
    }

    /// Undo the current tip block, restoring the prior chainstate. The
    /// caller supplies the tip that results (storage does not recompute
    /// cumulative work). The block body remains in its segment.
    pub fn rollback_tip(&self, new_tip: Option<TipInfo>) -> Result<UndoRecord, StorageError> {
        let tip = self.tip()?.ok_or(StorageError::BlockNotFound)?;
        let undo_bytes = self
            .undo
            .get(tip.height.to_be_bytes())?
            .ok_or(StorageError::UndoNotFound(tip.height))?;
        let record: UndoRecord = serde_json::from_slice(&undo_bytes)?;
        if record.block_hash != tip.hash {
            return Err(StorageError::Corruption(format!(
                "undo record at height {} does not match tip",
                tip.height
            )));
        }

        for account in &record.accounts_before {
            self.put_account(account)?;
        }
        for address in &record.created_accounts {
            self.accounts.remove(address.0)?;
        }
        for contract in &record.contracts_before {
            self.put_contract(contract)?;
        }
        for id in &record.created_contracts {
            self.contracts.remove(id)?;
        }
        for cell in &record.cells_before {
            self.put_cell(cell)?;
        }
        for tx_hash in &record.tx_hashes {
            self.txs.remove(tx_hash)?;
        }
        self.heights.remove(tip.height.to_be_bytes())?;
        self.undo.remove(tip.height.to_be_bytes())?;

        match new_tip {
            Some(tip) => self.set_tip(tip)?,
            None => {
                self.meta.remove(META_TIP)?;
                self.write_manifest(None)?;
            }
        }
        self.db.flush()?;
        info!(height = record.height, "rolled back tip block");
        Ok(record)
    }

    pub fn tip(&self) -> Result<Option<TipInfo>, StorageError> {
        let Some(bytes) = self.meta.get(META_TIP)? else {
            return Ok(None);
        };
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        Ok(Some(Self::tip_from_manifest(&manifest)?))
    }

    fn tip_from_manifest(manifest: &Manifest) -> Result<TipInfo, StorageError> {
        let decoded = hex::decode(&manifest.tip_hash)
            .map_err(|e| StorageError::Corruption(format!("bad tip hash: {e}")))?;
        let hash: BlockHash = decoded
            .try_into()
            .map_err(|_| StorageError::Corruption("tip hash must be 32 bytes".into()))?;
        let cumulative_work = manifest
            .cumulative_work
            .parse()
            .map_err(|e| StorageError::Corruption(format!("bad cumulative work: {e}")))?;
        Ok(TipInfo {
            hash,
            height: manifest.height,
            cumulative_work,
        })
    }

    fn set_tip(&self, tip: TipInfo) -> Result<(), StorageError> {
        let manifest = Manifest {
            tip_hash: hex::encode(tip.hash),
            height: tip.height,
            cumulative_work: tip.cumulative_work.to_string(),
        };
        self.meta.insert(META_TIP, serde_json::to_vec(&manifest)?)?;
        self.write_manifest(Some(&manifest))?;
        self.append_log(&format!("tip {} {}", tip.height, hex::encode(tip.hash)))?;
        Ok(())
    }

    pub fn block(&self, hash: &BlockHash) -> Result<Option<Block>, StorageError> {
        let Some(bytes) = self.blocks.get(hash)? else {
            return Ok(None);
        };
        let location: BlockLocation = serde_json::from_slice(&bytes)?;
        let body = self.segments.lock().read(location)?;
        let block = Block::decode(&body)
            .map_err(|e| StorageError::Corruption(format!("undecodable block body: {e}")))?;
        Ok(Some(block))
    }

    pub fn block_by_height(&self, height: u64) -> Result<Option<Block>, StorageError> {
        let Some(hash_bytes) = self.heights.get(height.to_be_bytes())? else {
            return Ok(None);
        };
        let hash: BlockHash = hash_bytes
            .as_ref()
            .try_into()
            .map_err(|_| StorageError::Corruption("height index entry must be 32 bytes".into()))?;
        self.block(&hash)
    }

    pub fn has_block(&self, hash: &BlockHash) -> Result<bool, StorageError> {
        Ok(self.blocks.contains_key(hash)?)
    }

    /// Locate a transaction on the best chain.
    pub fn transaction_location(&self, hash: &TxHash) -> Result<Option<TxLocation>, StorageError> {
        let Some(bytes) = self.txs.get(hash)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn put_account(&self, account: &Account) -> Result<(), StorageError> {
        self.accounts
            .insert(account.address.0, serde_json::to_vec(account)?)?;
        Ok(())
    }

    pub fn account(&self, address: &Address) -> Result<Option<Account>, StorageError> {
        let Some(bytes) = self.accounts.get(address.0)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn all_accounts(&self) -> Result<Vec<Account>, StorageError> {
        let mut accounts = Vec::new();
        for entry in self.accounts.iter() {
            let (_, bytes) = entry?;
            accounts.push(serde_json::from_slice(&bytes)?);
        }
        Ok(accounts)
    }

    pub fn put_contract(&self, contract: &Contract) -> Result<(), StorageError> {
        self.contracts
            .insert(contract.id, serde_json::to_vec(contract)?)?;
        Ok(())
    }

    pub fn contract(&self, id: &ContractId) -> Result<Option<Contract>, StorageError> {
        let Some(bytes) = self.contracts.get(id)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn all_contracts(&self) -> Result<Vec<Contract>, StorageError> {
        let mut contracts = Vec::new();
        for entry in self.contracts.iter() {
            let (_, bytes) = entry?;
            contracts.push(serde_json::from_slice(&bytes)?);
        }
        Ok(contracts)
    }

    pub fn put_cell(&self, cell: &CellSnapshot) -> Result<(), StorageError> {
        let mut key = [0u8; 4];
        key[..2].copy_from_slice(&cell.lat.to_be_bytes());
        key[2..].copy_from_slice(&cell.lng.to_be_bytes());
        self.cells.insert(key, serde_json::to_vec(cell)?)?;
        Ok(())
    }

    pub fn all_cells(&self) -> Result<Vec<CellSnapshot>, StorageError> {
        let mut cells = Vec::new();
        for entry in self.cells.iter() {
            let (_, bytes) = entry?;
            cells.push(serde_json::from_slice(&bytes)?);
        }
        Ok(cells)
    }

    /// Rebuild the block, height, and transaction indexes from the
    /// segments. State trees are left to the chain, which re-applies
    /// blocks through the normal path. Returns the replayed blocks in
    /// segment order.
    pub fn replay_index(&self) -> Result<Vec<Block>, StorageError> {
        warn!("chainstate inconsistent; replaying block segments");
        self.blocks.clear()?;
        self.heights.clear()?;
        self.txs.clear()?;

        let records = self.segments.lock().replay()?;
        let mut blocks = Vec::with_capacity(records.len());
        for (location, bytes) in records {
            let block = Block::decode(&bytes)
                .map_err(|e| StorageError::Corruption(format!("undecodable block body: {e}")))?;
            self.blocks
                .insert(block.hash(), serde_json::to_vec(&location)?)?;
            blocks.push(block);
        }
        info!(count = blocks.len(), "segment replay complete");
        Ok(blocks)
    }

    /// Drop all state trees (accounts, contracts, cells, undo, height
    /// index). Used before a full re-application of the chain.
    pub fn reset_state(&self) -> Result<(), StorageError> {
        self.accounts.clear()?;
        self.contracts.clear()?;
        self.cells.clear()?;
        self.undo.clear()?;
        self.heights.clear()?;
        self.meta.remove(META_TIP)?;
        self.write_manifest(None)?;
        Ok(())
    }

    /// Small opaque metadata blobs (emission totals, finalized height).
    pub fn put_meta_blob(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.meta.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn meta_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.meta.get(key.as_bytes())?.map(|ivec| ivec.to_vec()))
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn manifest_path(&self) -> PathBuf {
        self.chainstate_dir.join("MANIFEST")
    }

    fn read_manifest(&self) -> Result<Option<Manifest>, StorageError> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn write_manifest(&self, manifest: Option<&Manifest>) -> Result<(), StorageError> {
        let path = self.manifest_path();
        match manifest {
            Some(manifest) => fs::write(path, serde_json::to_vec_pretty(manifest)?)?,
            None => {
                if path.exists() {
                    fs::remove_file(path)?;
                }
            }
        }
        Ok(())
    }

    fn write_current(&self) -> Result<(), StorageError> {
        fs::write(self.chainstate_dir.join("CURRENT"), b"MANIFEST\n")?;
        Ok(())
    }

    fn append_log(&self, line: &str) -> Result<(), StorageError> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.chainstate_dir.join("LOG"))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}
