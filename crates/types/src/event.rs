//! Core events.
//!
//! The append-only event stream the core exposes to subscribers. Events
//! carry structured context, never stack traces.

use crate::block::BlockHash;
use crate::contract::{ContractId, ContractState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoreEvent {
    /// A block was appended to the best chain.
    BlockAppended { hash: BlockHash, height: u64 },
    /// The best chain switched to a competing fork.
    Reorg {
        old_tip: BlockHash,
        new_tip: BlockHash,
        depth: u64,
    },
    /// A contract moved to a new lifecycle state.
    ContractStateChanged {
        contract_id: ContractId,
        state: ContractState,
    },
    /// A competing tip beyond the reorg window was observed and refused.
    SuspiciousFork { tip: BlockHash, depth: u64 },
    /// Persistence failed twice; block application is halted pending
    /// operator action.
    FatalPersistence { detail: String },
}
