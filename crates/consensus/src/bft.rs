//! BFT validator quorum.
//!
//! Registered validators stake for committee membership; the top N by
//! stake form the committee for an epoch. Blocks finalizing contracts
//! need ⌊2f⌋+1 of 3f+1 header-hash signatures. Liveness comes from view
//! changes: when the expected proposer stalls, the committee votes the
//! view forward and the next member (deterministic round robin) takes
//! over, with timeouts doubling up to a cap.

use logichain_crypto::{ByteWriter, Keypair, PublicKey, SignatureScheme, SIGNATURE_BYTES};
use logichain_types::{
    Address, Amount, Attestation, BlockHash, ChainConfig, CoreError, CoreResult,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// Strikes before a proposer is dropped for the remainder of the epoch.
pub const MISBEHAVIOR_LIMIT: u32 = 3;

/// View-change timeouts stop doubling past this multiple of the base.
pub const TIMEOUT_CAP_MULTIPLIER: u32 = 64;

/// A registered validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    /// Ed25519 key attestations verify under.
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    pub stake: Amount,
    pub reputation: f64,
}

/// The committee active for one epoch.
#[derive(Debug, Clone)]
pub struct Committee {
    pub epoch: u64,
    members: Vec<Validator>,
}

impl Committee {
    pub fn members(&self) -> &[Validator] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.members.iter().any(|m| m.address == *address)
    }

    /// ⌊2f⌋+1 for a committee of 3f+1 (integer f = (n−1)/3).
    pub fn quorum_threshold(&self) -> usize {
        let f = (self.members.len().saturating_sub(1)) / 3;
        2 * f + 1
    }

    /// Deterministic round robin over (height, view).
    pub fn proposer(&self, height: u64, view: u64) -> Option<&Validator> {
        if self.members.is_empty() {
            return None;
        }
        let index = ((height + view) % self.members.len() as u64) as usize;
        Some(&self.members[index])
    }

    /// Verify a quorum of attestations over a block header hash.
    pub fn verify_quorum(
        &self,
        header_hash: &BlockHash,
        attestations: &[Attestation],
    ) -> CoreResult<()> {
        let mut seen: HashSet<Address> = HashSet::new();
        for attestation in attestations {
            let Some(member) = self
                .members
                .iter()
                .find(|m| m.address == attestation.validator)
            else {
                continue;
            };
            if !seen.insert(attestation.validator) {
                continue;
            }
            let key = PublicKey::from_bytes(SignatureScheme::Ed25519, &member.public_key)?;
            key.verify(header_hash, &attestation.signature)
                .map_err(|_| CoreError::InvalidSignature)?;
        }
        let required = self.quorum_threshold();
        if seen.len() < required {
            return Err(CoreError::QuorumInsufficient {
                got: seen.len(),
                required,
            });
        }
        Ok(())
    }
}

/// Sign one attestation over a header hash.
pub fn attest(header_hash: &BlockHash, validator: Address, keypair: &Keypair) -> Attestation {
    Attestation {
        validator,
        signature: keypair.sign(header_hash).to_vec(),
    }
}

/// Stake-backed validator registrations and epoch committees.
#[derive(Debug, Default)]
pub struct ValidatorRegistry {
    validators: HashMap<Address, Validator>,
    strikes: HashMap<Address, u32>,
    banned_through_epoch: HashMap<Address, u64>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register with at least the configured stake.
    pub fn register(&mut self, validator: Validator, config: &ChainConfig) -> CoreResult<()> {
        if validator.stake < config.stake_amount {
            return Err(CoreError::QuorumInsufficient { got: 0, required: 1 });
        }
        if validator.public_key.len() != 32 {
            return Err(CoreError::InvalidSignature);
        }
        info!(validator = %validator.address, stake = %validator.stake, "validator registered");
        self.validators.insert(validator.address, validator);
        Ok(())
    }

    pub fn deregister(&mut self, address: &Address) -> Option<Validator> {
        self.validators.remove(address)
    }

    pub fn get(&self, address: &Address) -> Option<&Validator> {
        self.validators.get(address)
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Record proposer misbehavior. Repeated offenders are excluded for
    /// the remainder of the epoch and their reputation decremented.
    pub fn note_misbehavior(&mut self, address: &Address, epoch: u64) {
        let strikes = self.strikes.entry(*address).or_insert(0);
        *strikes += 1;
        if let Some(validator) = self.validators.get_mut(address) {
            validator.reputation = (validator.reputation - 0.1).max(0.0);
        }
        if *strikes >= MISBEHAVIOR_LIMIT {
            warn!(validator = %address, epoch, "validator excluded for remainder of epoch");
            self.banned_through_epoch.insert(*address, epoch);
            *strikes = 0;
        }
    }

    /// The committee for an epoch: top N by stake among eligible
    /// registrations, ties broken by address for determinism.
    pub fn committee(&self, epoch: u64, size: usize) -> Committee {
        let mut eligible: Vec<Validator> = self
            .validators
            .values()
            .filter(|v| {
                self.banned_through_epoch
                    .get(&v.address)
                    .map_or(true, |&banned| epoch > banned)
            })
            .cloned()
            .collect();
        eligible.sort_by(|a, b| b.stake.cmp(&a.stake).then(a.address.cmp(&b.address)));
        eligible.truncate(size);
        Committee {
            epoch,
            members: eligible,
        }
    }
}

/// Epoch of a height.
pub fn epoch_of(height: u64, config: &ChainConfig) -> u64 {
    height / config.epoch_blocks
}

/// Three-phase BFT message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BftPhase {
    PrePrepare,
    Prepare,
    Commit,
    ViewChange,
}

impl BftPhase {
    fn as_byte(self) -> u8 {
        match self {
            BftPhase::PrePrepare => 0,
            BftPhase::Prepare => 1,
            BftPhase::Commit => 2,
            BftPhase::ViewChange => 3,
        }
    }
}

/// A vote exchanged between committee members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BftMessage {
    pub phase: BftPhase,
    pub view: u64,
    pub height: u64,
    pub block_hash: BlockHash,
    pub validator: Address,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl BftMessage {
    pub fn new(
        phase: BftPhase,
        view: u64,
        height: u64,
        block_hash: BlockHash,
        validator: Address,
        keypair: &Keypair,
    ) -> Self {
        let mut message = Self {
            phase,
            view,
            height,
            block_hash,
            validator,
            signature: vec![0u8; SIGNATURE_BYTES],
        };
        message.signature = keypair.sign(&message.signing_bytes()).to_vec();
        message
    }

    fn signing_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(80);
        writer.put_u8(self.phase.as_byte());
        writer.put_u64(self.view);
        writer.put_u64(self.height);
        writer.put_raw(&self.block_hash);
        writer.put_raw(&self.validator.to_wire());
        writer.into_bytes()
    }

    pub fn verify(&self, public_key: &PublicKey) -> CoreResult<()> {
        public_key
            .verify(&self.signing_bytes(), &self.signature)
            .map_err(|_| CoreError::InvalidSignature)
    }
}

/// One height's consensus round, driven by an injected monotonic clock.
#[derive(Debug)]
pub struct BftRound {
    pub height: u64,
    pub view: u64,
    base_timeout_secs: f64,
    timeout_secs: f64,
    started_at: f64,
    block_hash: Option<BlockHash>,
    prepare_votes: HashSet<Address>,
    commit_votes: HashSet<Address>,
    view_change_votes: HashMap<u64, HashSet<Address>>,
    committed: bool,
    /// Total view changes this round has been through.
    pub view_changes_total: u64,
}

impl BftRound {
    pub fn new(height: u64, base_timeout_secs: f64, now: f64) -> Self {
        Self {
            height,
            view: 0,
            base_timeout_secs,
            timeout_secs: base_timeout_secs,
            started_at: now,
            block_hash: None,
            prepare_votes: HashSet::new(),
            commit_votes: HashSet::new(),
            view_change_votes: HashMap::new(),
            committed: false,
            view_changes_total: 0,
        }
    }

    pub fn block_hash(&self) -> Option<BlockHash> {
        self.block_hash
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Accept a proposal for this (view, height). Only the deterministic
    /// proposer for the current view may propose.
    pub fn on_proposal(
        &mut self,
        block_hash: BlockHash,
        proposer: &Address,
        committee: &Committee,
    ) -> CoreResult<()> {
        let expected = committee
            .proposer(self.height, self.view)
            .ok_or(CoreError::QuorumInsufficient { got: 0, required: 1 })?;
        if expected.address != *proposer {
            return Err(CoreError::ProposerMisbehavior(format!(
                "proposal from {proposer}, expected {}",
                expected.address
            )));
        }
        if let Some(current) = self.block_hash {
            if current != block_hash {
                return Err(CoreError::ProposerMisbehavior(
                    "conflicting proposal within one view".into(),
                ));
            }
        }
        self.block_hash = Some(block_hash);
        Ok(())
    }

    /// Record a PREPARE vote; returns true when the prepare quorum is
    /// reached.
    pub fn on_prepare(
        &mut self,
        validator: Address,
        block_hash: BlockHash,
        committee: &Committee,
    ) -> CoreResult<bool> {
        self.check_vote(validator, block_hash, committee)?;
        self.prepare_votes.insert(validator);
        Ok(self.prepare_votes.len() >= committee.quorum_threshold())
    }

    /// Record a COMMIT vote; returns true when the block is final (both
    /// quorums observed at the same view and height).
    pub fn on_commit(
        &mut self,
        validator: Address,
        block_hash: BlockHash,
        committee: &Committee,
    ) -> CoreResult<bool> {
        self.check_vote(validator, block_hash, committee)?;
        if self.prepare_votes.len() < committee.quorum_threshold() {
            return Ok(false);
        }
        self.commit_votes.insert(validator);
        if self.commit_votes.len() >= committee.quorum_threshold() {
            self.committed = true;
        }
        Ok(self.committed)
    }

    fn check_vote(
        &self,
        validator: Address,
        block_hash: BlockHash,
        committee: &Committee,
    ) -> CoreResult<()> {
        if !committee.contains(&validator) {
            return Err(CoreError::QuorumInsufficient {
                got: 0,
                required: committee.quorum_threshold(),
            });
        }
        if self.block_hash != Some(block_hash) {
            return Err(CoreError::ProposerMisbehavior(
                "vote for an unproposed block".into(),
            ));
        }
        Ok(())
    }

    /// Whether the proposer has timed out; if so, the view to vote for.
    pub fn check_timeout(&self, now: f64) -> Option<u64> {
        if self.committed {
            return None;
        }
        if now - self.started_at >= self.timeout_secs {
            Some(self.view + 1)
        } else {
            None
        }
    }

    /// Record a VIEW_CHANGE vote; on quorum, advance the view, reset the
    /// round, and double the timeout up to the cap. Returns true when the
    /// view advanced.
    pub fn on_view_change(
        &mut self,
        validator: Address,
        new_view: u64,
        committee: &Committee,
        now: f64,
    ) -> CoreResult<bool> {
        if !committee.contains(&validator) {
            return Err(CoreError::QuorumInsufficient {
                got: 0,
                required: committee.quorum_threshold(),
            });
        }
        if new_view <= self.view {
            return Ok(false);
        }
        let votes = self.view_change_votes.entry(new_view).or_default();
        votes.insert(validator);
        if votes.len() < committee.quorum_threshold() {
            return Ok(false);
        }

        self.view = new_view;
        self.block_hash = None;
        self.prepare_votes.clear();
        self.commit_votes.clear();
        self.view_change_votes.retain(|&view, _| view > new_view);
        self.started_at = now;
        let cap = self.base_timeout_secs * TIMEOUT_CAP_MULTIPLIER as f64;
        self.timeout_secs = (self.timeout_secs * 2.0).min(cap);
        self.view_changes_total += 1;
        info!(height = self.height, view = new_view, "view change committed");
        Ok(true)
    }
}
