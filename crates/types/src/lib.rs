//! Shared data model for the LogiChain core.
//!
//! Everything that crosses a component boundary lives here: monetary
//! amounts, addresses, blocks and transactions with their bit-exact wire
//! codecs, delivery contracts and checkpoints, the chain configuration,
//! the error taxonomy, and the core event types.

pub mod account;
pub mod address;
pub mod amount;
pub mod block;
pub mod checkpoint;
pub mod config;
pub mod contract;
pub mod error;
pub mod event;
pub mod geo;
pub mod gossip;
pub mod transaction;

pub use account::*;
pub use address::*;
pub use amount::*;
pub use block::*;
pub use checkpoint::*;
pub use config::*;
pub use contract::*;
pub use error::*;
pub use event::*;
pub use geo::*;
pub use gossip::*;
pub use transaction::*;
