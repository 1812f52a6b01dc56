//! Core context assembly.
//!
//! Builds the storage, chain, mempool, and consensus actor from a loaded
//! configuration, checking genesis compatibility on the way. Every
//! process-wide component is owned here and torn down when the context
//! drops.

use crate::settings::NodeConfig;
use logichain_consensus::{Chain, ConsensusEngine, EngineCommand, EngineHandle};
use logichain_mempool::{Mempool, MempoolConfig};
use logichain_storage::ChainStore;
use logichain_types::{Address, Amount};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Fatal startup failures, mapped to daemon exit codes.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// Exit code 1.
    #[error("configuration error: {0}")]
    Config(String),
    /// Exit code 2.
    #[error("persistence corruption: {0}")]
    Persistence(String),
    /// Exit code 3.
    #[error("incompatible genesis: {0}")]
    Genesis(String),
}

/// The assembled core, ready to run.
pub struct Core {
    pub engine: ConsensusEngine,
    pub handle: EngineHandle,
    pub commands: mpsc::Receiver<EngineCommand>,
    pub mempool: Arc<Mempool>,
    pub miner: Option<Address>,
    pub mine_interval_secs: u64,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core").finish_non_exhaustive()
    }
}

/// Build the core context from configuration.
pub fn build(node_config: &NodeConfig) -> Result<Core, StartupError> {
    let chain_config = node_config
        .chain_config()
        .map_err(StartupError::Config)?;
    let miner = node_config.miner().map_err(StartupError::Config)?;
    let allocations = node_config
        .genesis(&chain_config)
        .map_err(StartupError::Config)?;

    let store = ChainStore::open(&node_config.data_dir, chain_config.segment_max_bytes)
        .map_err(|e| StartupError::Persistence(e.to_string()))?;

    let mut chain = Chain::open(chain_config.clone(), store)
        .map_err(|e| StartupError::Persistence(e.to_string()))?;

    match chain.tip_info() {
        None => {
            let hash = chain
                .init_genesis(&allocations, genesis_timestamp())
                .map_err(|e| StartupError::Persistence(e.to_string()))?;
            info!(hash = %hex::encode(hash), wallets = allocations.len(), "genesis initialized");
        }
        Some(_) => {
            check_genesis_compatibility(&chain, &allocations)?;
        }
    }

    let mempool = Arc::new(Mempool::new(MempoolConfig::from_chain(&chain_config)));
    let (engine, handle, commands) = ConsensusEngine::new(chain, Arc::clone(&mempool));

    Ok(Core {
        engine,
        handle,
        commands,
        mempool,
        miner,
        mine_interval_secs: node_config.mine_interval_secs,
    })
}

/// The chain the store holds must descend from the genesis this node is
/// configured for; otherwise the operator pointed the daemon at the wrong
/// data directory or the wrong network.
fn check_genesis_compatibility(
    chain: &Chain,
    allocations: &[(Address, Amount)],
) -> Result<(), StartupError> {
    for (address, _) in allocations {
        if chain.account(address).is_none() {
            return Err(StartupError::Genesis(format!(
                "genesis wallet {address} missing from chainstate"
            )));
        }
    }
    Ok(())
}

/// Genesis blocks are stamped with the daemon's first start time.
fn genesis_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
