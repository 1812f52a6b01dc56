//! The consensus actor.
//!
//! One task owns the [`Chain`] and applies blocks serially; every other
//! component talks to it through bounded command channels and observes it
//! through the broadcast event bus. The mempool is shared directly (it
//! carries its own synchronization); BFT votes and timers run on this
//! actor's single logical timeline using a monotonic clock.

use crate::assembler;
use crate::bft::{epoch_of, BftMessage, BftPhase, BftRound, Committee, Validator};
use crate::chain::{BlockOutcome, Chain, ChainStats};
use logichain_mempool::Mempool;
use logichain_types::{
    Account, Address, Block, BlockHash, ChainMode, Contract, ContractAction, ContractId,
    CoreError, CoreEvent, CoreResult, Transaction, TxHash, TxType,
};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Per-transaction signature verification budget; slower submissions are
/// dropped and the submitting peer penalized.
pub const SIGNATURE_VERIFY_TIMEOUT: Duration = Duration::from_millis(50);

/// Bound on the command queue; senders see backpressure as queue-full.
pub const COMMAND_QUEUE_DEPTH: usize = 1024;

/// Bound on the event bus before slow subscribers start losing events.
pub const EVENT_BUS_DEPTH: usize = 256;

/// Per-sender ingress token bucket.
const BUCKET_CAPACITY: f64 = 20.0;
const BUCKET_REFILL_PER_SEC: f64 = 10.0;

/// Commands accepted by the consensus actor.
pub enum EngineCommand {
    SubmitTransaction {
        tx: Transaction,
        reply: oneshot::Sender<CoreResult<TxHash>>,
    },
    SubmitBlock {
        block: Block,
        reply: oneshot::Sender<CoreResult<BlockHash>>,
    },
    MineBlock {
        miner: Address,
        reply: oneshot::Sender<CoreResult<BlockHash>>,
    },
    QueryAccount {
        address: Address,
        reply: oneshot::Sender<Option<Account>>,
    },
    QueryContract {
        id: ContractId,
        reply: oneshot::Sender<Option<Contract>>,
    },
    QueryTip {
        reply: oneshot::Sender<Option<ChainStats>>,
    },
    RegisterValidator {
        validator: Validator,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    BftVote {
        message: BftMessage,
        reply: oneshot::Sender<CoreResult<bool>>,
    },
    Shutdown,
}

/// Counters surfaced by the daemon.
#[derive(Debug, Default, Clone)]
pub struct EngineStats {
    pub transactions_accepted: u64,
    pub blocks_accepted: u64,
    pub blocks_mined: u64,
    pub view_changes_total: u64,
    pub peers_penalized: u64,
}

struct TokenBucket {
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    fn new(now: Instant) -> Self {
        Self {
            tokens: BUCKET_CAPACITY,
            refilled_at: now,
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * BUCKET_REFILL_PER_SEC).min(BUCKET_CAPACITY);
        self.refilled_at = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Client handle to the actor.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    events: broadcast::Sender<CoreEvent>,
}

impl EngineHandle {
    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> CoreResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| CoreError::Cancelled)?;
        reply_rx.await.map_err(|_| CoreError::Cancelled)
    }

    pub async fn submit_transaction(&self, tx: Transaction) -> CoreResult<TxHash> {
        self.send(|reply| EngineCommand::SubmitTransaction { tx, reply })
            .await?
    }

    pub async fn submit_block(&self, block: Block) -> CoreResult<BlockHash> {
        self.send(|reply| EngineCommand::SubmitBlock { block, reply })
            .await?
    }

    pub async fn mine_block(&self, miner: Address) -> CoreResult<BlockHash> {
        self.send(|reply| EngineCommand::MineBlock { miner, reply })
            .await?
    }

    pub async fn query_account(&self, address: Address) -> CoreResult<Option<Account>> {
        self.send(|reply| EngineCommand::QueryAccount { address, reply })
            .await
    }

    pub async fn query_contract(&self, id: ContractId) -> CoreResult<Option<Contract>> {
        self.send(|reply| EngineCommand::QueryContract { id, reply })
            .await
    }

    pub async fn query_tip(&self) -> CoreResult<Option<ChainStats>> {
        self.send(|reply| EngineCommand::QueryTip { reply }).await
    }

    pub async fn register_validator(&self, validator: Validator) -> CoreResult<()> {
        self.send(|reply| EngineCommand::RegisterValidator { validator, reply })
            .await?
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(EngineCommand::Shutdown).await;
    }
}

/// The actor itself; construct with [`ConsensusEngine::new`] and drive
/// with [`ConsensusEngine::run`].
pub struct ConsensusEngine {
    chain: Chain,
    mempool: Arc<Mempool>,
    events: broadcast::Sender<CoreEvent>,
    buckets: HashMap<Address, TokenBucket>,
    round: Option<BftRound>,
    stats: EngineStats,
    started_at: Instant,
    pub cancel_mining: Arc<AtomicBool>,
}

impl ConsensusEngine {
    pub fn new(
        chain: Chain,
        mempool: Arc<Mempool>,
    ) -> (Self, EngineHandle, mpsc::Receiver<EngineCommand>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (events_tx, _) = broadcast::channel(EVENT_BUS_DEPTH);
        let handle = EngineHandle {
            commands: commands_tx,
            events: events_tx.clone(),
        };
        let engine = Self {
            chain,
            mempool,
            events: events_tx,
            buckets: HashMap::new(),
            round: None,
            stats: EngineStats::default(),
            started_at: Instant::now(),
            cancel_mining: Arc::new(AtomicBool::new(false)),
        };
        (engine, handle, commands_rx)
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    fn monotonic_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    fn wall_secs() -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Drive the actor until shutdown. Timers (the BFT proposal timeout)
    /// share this loop so consensus state is touched from one task only.
    pub async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        let mut timer = tokio::time::interval(Duration::from_secs(1));
        info!("consensus engine running");
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(EngineCommand::Shutdown) | None => break,
                        Some(command) => self.handle(command),
                    }
                }
                _ = timer.tick() => self.check_bft_timeout(),
            }
        }
        info!("consensus engine stopped");
    }

    fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::SubmitTransaction { tx, reply } => {
                let _ = reply.send(self.submit_transaction(tx));
            }
            EngineCommand::SubmitBlock { block, reply } => {
                let _ = reply.send(self.submit_block(block));
            }
            EngineCommand::MineBlock { miner, reply } => {
                let _ = reply.send(self.mine_block(miner));
            }
            EngineCommand::QueryAccount { address, reply } => {
                let _ = reply.send(self.chain.account(&address).cloned());
            }
            EngineCommand::QueryContract { id, reply } => {
                let _ = reply.send(self.chain.contract(&id).cloned());
            }
            EngineCommand::QueryTip { reply } => {
                let _ = reply.send(self.chain.stats());
            }
            EngineCommand::RegisterValidator { validator, reply } => {
                let config = self.chain.config().clone();
                let _ = reply.send(self.chain.validators.register(validator, &config));
            }
            EngineCommand::BftVote { message, reply } => {
                let _ = reply.send(self.handle_bft_vote(message));
            }
            EngineCommand::Shutdown => {}
        }
    }

    /// Ingress validation for one transaction: rate limit, signature
    /// budget, coordinate saturation, then mempool admission.
    pub fn submit_transaction(&mut self, tx: Transaction) -> CoreResult<TxHash> {
        let sender = tx.from.ok_or(CoreError::InvalidSignature)?;

        let now = Instant::now();
        let bucket = self
            .buckets
            .entry(sender)
            .or_insert_with(|| TokenBucket::new(now));
        if !bucket.try_take(now) {
            return Err(CoreError::RateLimited);
        }

        let verify_started = Instant::now();
        tx.verify_signature()?;
        if verify_started.elapsed() > SIGNATURE_VERIFY_TIMEOUT {
            self.stats.peers_penalized += 1;
            warn!(sender = %sender, "signature verification exceeded budget; dropping");
            return Err(CoreError::Timeout);
        }

        // Checkpoint submissions count against the cell's ops window.
        if tx.tx_type == TxType::ContractCheckpoint {
            if let Ok(ContractAction::Checkpoint { checkpoint, .. }) =
                ContractAction::decode(&tx.payload)
            {
                self.chain
                    .grid()
                    .record_operation(&checkpoint.point, Self::wall_secs())?;
            }
        }

        let hash = tx.hash();
        let base_nonce = self.chain.next_nonce_base(&sender);
        self.mempool.add_transaction(tx, base_nonce)?;
        self.stats.transactions_accepted += 1;
        Ok(hash)
    }

    /// Apply a block through the chain, then settle the mempool.
    pub fn submit_block(&mut self, block: Block) -> CoreResult<BlockHash> {
        let hash = block.hash();
        let confirmed = block.transactions.clone();
        match self.chain.submit_block(block, Self::wall_secs()) {
            Ok(outcome) => {
                self.settle(&confirmed, outcome);
                self.stats.blocks_accepted += 1;
                Ok(hash)
            }
            Err(CoreError::ReorgBeyondWindow { depth, window }) => {
                // Never applied automatically; surfaced for the operator.
                let _ = self.events.send(CoreEvent::SuspiciousFork { tip: hash, depth });
                Err(CoreError::ReorgBeyondWindow { depth, window })
            }
            Err(error) => Err(error),
        }
    }

    /// Assemble, mine, and apply one block (used by the daemon's miner
    /// loop and the integration tests).
    pub fn mine_block(&mut self, miner: Address) -> CoreResult<BlockHash> {
        let timestamp = Self::wall_secs();
        let mut block = assembler::build_template(&self.chain, &self.mempool, miner, timestamp)?;
        assembler::mine(&mut block, &self.cancel_mining)?;
        let hash = self.submit_block(block)?;
        self.stats.blocks_mined += 1;
        Ok(hash)
    }

    fn settle(&mut self, confirmed: &[Transaction], outcome: BlockOutcome) {
        self.mempool.note_block_applied(confirmed);
        if !outcome.readmit.is_empty() {
            debug!(count = outcome.readmit.len(), "readmitting abandoned transactions");
            let chain = &self.chain;
            self.mempool
                .readmit(outcome.readmit, |address| chain.next_nonce_base(address));
        }
        for event in outcome.events {
            let _ = self.events.send(event);
        }
    }

    /// Process a committee vote on this actor's timeline.
    fn handle_bft_vote(&mut self, message: BftMessage) -> CoreResult<bool> {
        let committee = self.current_committee();
        let Some(member) = committee
            .members()
            .iter()
            .find(|m| m.address == message.validator)
        else {
            return Err(CoreError::QuorumInsufficient {
                got: 0,
                required: committee.quorum_threshold(),
            });
        };
        let key = logichain_crypto::PublicKey::from_bytes(
            logichain_crypto::SignatureScheme::Ed25519,
            &member.public_key,
        )?;
        message.verify(&key)?;

        let now = self.monotonic_secs();
        let height = message.height;
        let round = self.round.get_or_insert_with(|| {
            BftRound::new(height, 10.0, now)
        });
        if round.height != message.height {
            *round = BftRound::new(message.height, 10.0, now);
        }

        let result = match message.phase {
            BftPhase::PrePrepare => round
                .on_proposal(message.block_hash, &message.validator, &committee)
                .map(|_| false),
            BftPhase::Prepare => round.on_prepare(message.validator, message.block_hash, &committee),
            BftPhase::Commit => round.on_commit(message.validator, message.block_hash, &committee),
            BftPhase::ViewChange => {
                round.on_view_change(message.validator, message.view, &committee, now)
            }
        };
        self.stats.view_changes_total = self
            .round
            .as_ref()
            .map(|r| r.view_changes_total)
            .unwrap_or(0);
        result
    }

    fn current_committee(&self) -> Committee {
        let height = self
            .chain
            .tip_info()
            .map(|tip| tip.height)
            .unwrap_or(0);
        let config = self.chain.config();
        self.chain
            .validators
            .committee(epoch_of(height, config), config.committee_size)
    }

    /// Proposal-timeout sweep: vote the view forward and score the silent
    /// proposer down.
    fn check_bft_timeout(&mut self) {
        if self.chain.config().mode == ChainMode::OffGrid {
            return;
        }
        let now = self.monotonic_secs();
        let Some(round) = self.round.as_mut() else {
            return;
        };
        if let Some(new_view) = round.check_timeout(now) {
            let committee = {
                let height = round.height;
                let config = self.chain.config();
                self.chain
                    .validators
                    .committee(epoch_of(height, config), config.committee_size)
            };
            if let Some(silent) = committee.proposer(round.height, round.view) {
                let silent = silent.address;
                let epoch = epoch_of(round.height, self.chain.config());
                self.chain.validators.note_misbehavior(&silent, epoch);
                warn!(proposer = %silent, new_view, "proposal timeout; initiating view change");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logichain_mempool::MempoolConfig;
    use logichain_storage::ChainStore;
    use logichain_types::{Amount, ChainConfig};
    use tempfile::TempDir;

    fn engine() -> (ConsensusEngine, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = ChainConfig::on_grid();
        config.initial_difficulty_bits = 1;
        let store = ChainStore::open(dir.path(), config.segment_max_bytes).unwrap();
        let mut chain = Chain::open(config.clone(), store).unwrap();
        chain
            .init_genesis(&[(Address([1; 20]), Amount::from_units(1000))], 1_000.0)
            .unwrap();
        let mempool = Arc::new(Mempool::new(MempoolConfig::from_chain(&config)));
        let (engine, _, _) = ConsensusEngine::new(chain, mempool);
        (engine, dir)
    }

    #[test]
    fn rate_limiter_throttles_sender() {
        let (mut engine, _dir) = engine();
        let keypair = logichain_crypto::Keypair::generate(
            logichain_crypto::SignatureScheme::EcdsaSecp256k1,
        );
        let from = Address::from_public_key(&keypair.public_key());

        let mut limited = false;
        for nonce in 1..=40u64 {
            let mut tx = Transaction::new(
                TxType::Transfer,
                from,
                Some(Address([9; 20])),
                Amount::from_units(1),
                nonce,
                Amount::parse("0.01").unwrap(),
                1_000.0,
                Vec::new(),
            );
            tx.sign(&keypair).unwrap();
            if engine.submit_transaction(tx) == Err(CoreError::RateLimited) {
                limited = true;
                break;
            }
        }
        assert!(limited, "sender was never rate limited");
    }

    #[test]
    fn mined_block_extends_chain() {
        let (mut engine, _dir) = engine();
        let hash = engine.mine_block(Address([7; 20])).unwrap();
        let stats = engine.chain().stats().unwrap();
        assert_eq!(stats.height, 1);
        assert_eq!(stats.tip_hash, hash);
        // Miner got the scheduled 50-unit reward.
        let miner = engine.chain().account(&Address([7; 20])).unwrap();
        assert_eq!(miner.balance, Amount::from_units(50));
    }
}
