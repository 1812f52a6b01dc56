//! # LogiChain Mempool
//!
//! Priority queue of pending transactions feeding the block assembler.
//!
//! ## Features
//! - **Fee-density prioritization** with ancestor and age bonuses
//! - **Replace-by-fee** at a minimum 10% bump
//! - **Child-pays-for-parent** bundle selection
//! - **Per-sender contiguous nonce queues** with bounded gap tolerance
//! - **Byte-capacity eviction** of the lowest-priority bundle
//!
//! Lock order is strict: the global index lock is always acquired before
//! the sender-queue lock. No method takes them in the other order.

use logichain_types::{
    Address, Amount, ChainConfig, CoreError, CoreResult, Transaction, TxHash, TxType,
};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Mempool tuning parameters.
#[derive(Debug, Clone)]
pub struct MempoolConfig {
    pub max_bytes: usize,
    pub rbf_min_bump_ratio: f64,
    pub nonce_gap_limit: u64,
    pub min_fee: Amount,
    pub max_fee: Amount,
    /// β: weight of the fee boost descendants give their ancestor.
    pub ancestor_fee_weight: f64,
    /// γ: priority added per second an entry has waited.
    pub age_bonus_per_sec: f64,
    /// A bundle below this aggregate fee density is not block-eligible.
    pub block_min_fee_per_byte: u128,
    pub expiration: Duration,
}

impl MempoolConfig {
    pub fn from_chain(config: &ChainConfig) -> Self {
        Self {
            max_bytes: config.mempool_max_bytes,
            rbf_min_bump_ratio: config.rbf_min_bump_ratio,
            nonce_gap_limit: config.nonce_gap_limit,
            min_fee: config.min_tx_fee,
            max_fee: config.max_tx_fee,
            ancestor_fee_weight: 0.5,
            age_bonus_per_sec: 0.01,
            block_min_fee_per_byte: 1,
            expiration: Duration::from_secs(3600),
        }
    }
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self::from_chain(&ChainConfig::on_grid())
    }
}

#[derive(Debug, Clone)]
struct TransactionMeta {
    tx: Transaction,
    received_at: Instant,
    size: usize,
    fee_per_byte: u128,
}

#[derive(Debug, Default)]
struct SenderQueue {
    /// The sender's committed on-chain nonce; eligibility starts at +1.
    base_nonce: u64,
    entries: BTreeMap<u64, TxHash>,
}

/// A contiguous per-sender run selected as one unit (child pays for
/// parent: descendants lift the aggregate fee density of a cheap head).
#[derive(Debug, Clone)]
struct Bundle {
    sender: Address,
    hashes: Vec<TxHash>,
    aggregate_fee: u128,
    aggregate_size: usize,
    score: f64,
    oldest: Instant,
}

impl Bundle {
    fn fee_per_byte(&self) -> u128 {
        self.aggregate_fee / self.aggregate_size.max(1) as u128
    }
}

impl PartialEq for Bundle {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Bundle {}

impl Ord for Bundle {
    fn cmp(&self, other: &Self) -> Ordering {
        // Priority descending, then waiting time, then sender for a total
        // order.
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.oldest.cmp(&self.oldest))
            .then_with(|| other.sender.cmp(&self.sender))
    }
}

impl PartialOrd for Bundle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Thread-safe, fee-prioritized, nonce-ordered mempool.
pub struct Mempool {
    config: MempoolConfig,
    /// Global index, acquired FIRST.
    index: RwLock<HashMap<TxHash, TransactionMeta>>,
    /// Per-sender queues, acquired SECOND.
    senders: RwLock<HashMap<Address, SenderQueue>>,
    bytes: AtomicUsize,
    last_cleanup: RwLock<Instant>,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            index: RwLock::new(HashMap::new()),
            senders: RwLock::new(HashMap::new()),
            bytes: AtomicUsize::new(0),
            last_cleanup: RwLock::new(Instant::now()),
        }
    }

    /// Admit a transaction.
    ///
    /// `chain_nonce` is the sender's committed nonce in the current chain
    /// state; the entry queue for a sender always starts at
    /// `chain_nonce + 1`. Returns `Ok(true)` when the pool changed.
    pub fn add_transaction(&self, tx: Transaction, chain_nonce: u64) -> CoreResult<bool> {
        self.cleanup_expired(Instant::now());

        if tx.tx_type == TxType::MiningReward {
            return Err(CoreError::InvalidBlockStructure(
                "reward transactions are assembled, not submitted".into(),
            ));
        }
        tx.verify_signature()?;

        if tx.fee < self.config.min_fee || tx.fee > self.config.max_fee {
            return Err(CoreError::InvalidBlockStructure(format!(
                "fee {} outside [{}, {}]",
                tx.fee, self.config.min_fee, self.config.max_fee
            )));
        }

        let sender = tx.from.ok_or(CoreError::InvalidSignature)?;
        if tx.nonce <= chain_nonce {
            return Err(CoreError::ReplayDetected);
        }
        if tx.nonce > chain_nonce + 1 + self.config.nonce_gap_limit {
            return Err(CoreError::InvalidNonce {
                expected: chain_nonce + 1,
                actual: tx.nonce,
            });
        }

        let hash = tx.hash();
        let size = tx.size();
        let fee_per_byte = tx.fee_per_byte();
        let now = Instant::now();

        let mut index = self.index.write();
        let mut senders = self.senders.write();

        if index.contains_key(&hash) {
            return Err(CoreError::DuplicateTransaction);
        }

        let queue = senders.entry(sender).or_default();
        queue.base_nonce = queue.base_nonce.max(chain_nonce);

        // Replace-by-fee: an occupied (sender, nonce) slot only yields to a
        // fee density at least `1 + rbf_min_bump_ratio` times the incumbent.
        if let Some(existing_hash) = queue.entries.get(&tx.nonce).copied() {
            let existing_fpb = index
                .get(&existing_hash)
                .map(|meta| meta.fee_per_byte)
                .unwrap_or(0);
            let bump_bp = (self.config.rbf_min_bump_ratio * 10_000.0).round() as u128;
            if fee_per_byte * 10_000 < existing_fpb * (10_000 + bump_bp) {
                return Err(CoreError::DuplicateTransaction);
            }
            if let Some(old) = index.remove(&existing_hash) {
                self.bytes.fetch_sub(old.size, AtomicOrdering::Relaxed);
            }
            queue.entries.remove(&tx.nonce);
            debug!(sender = %sender, nonce = tx.nonce, "replaced by fee");
        }

        // Capacity: evict lowest-priority queue tails until the entry fits.
        while self.bytes.load(AtomicOrdering::Relaxed) + size > self.config.max_bytes {
            let incoming_score = fee_per_byte as f64;
            if !Self::evict_lowest_tail(
                &self.config,
                &self.bytes,
                &mut index,
                &mut senders,
                incoming_score,
                &sender,
                tx.nonce,
            ) {
                return Err(CoreError::ResourceExhausted("mempool full".into()));
            }
        }

        let queue = senders.entry(sender).or_default();
        queue.entries.insert(tx.nonce, hash);
        index.insert(
            hash,
            TransactionMeta {
                tx,
                received_at: now,
                size,
                fee_per_byte,
            },
        );
        self.bytes.fetch_add(size, AtomicOrdering::Relaxed);
        trace!(hash = %hex::encode(hash), "admitted transaction");
        Ok(true)
    }

    /// Drop the lowest-priority queue tail (removing a tail never breaks
    /// nonce contiguity). Refuses to evict anything scoring above the
    /// incoming transaction, and never evicts the incoming sender's own
    /// earlier nonces.
    #[allow(clippy::too_many_arguments)]
    fn evict_lowest_tail(
        config: &MempoolConfig,
        bytes: &AtomicUsize,
        index: &mut HashMap<TxHash, TransactionMeta>,
        senders: &mut HashMap<Address, SenderQueue>,
        incoming_score: f64,
        incoming_sender: &Address,
        incoming_nonce: u64,
    ) -> bool {
        let now = Instant::now();
        let mut victim: Option<(Address, u64, f64)> = None;
        for (sender, queue) in senders.iter() {
            let Some((&nonce, hash)) = queue.entries.last_key_value() else {
                continue;
            };
            if sender == incoming_sender && nonce < incoming_nonce {
                continue;
            }
            let Some(meta) = index.get(hash) else { continue };
            let age = now.duration_since(meta.received_at).as_secs_f64();
            let score = meta.fee_per_byte as f64 + config.age_bonus_per_sec * age;
            if victim.as_ref().map_or(true, |(_, _, best)| score < *best) {
                victim = Some((*sender, nonce, score));
            }
        }

        let Some((sender, nonce, score)) = victim else {
            return false;
        };
        if score >= incoming_score {
            return false;
        }
        if let Some(queue) = senders.get_mut(&sender) {
            if let Some(hash) = queue.entries.remove(&nonce) {
                if let Some(meta) = index.remove(&hash) {
                    bytes.fetch_sub(meta.size, AtomicOrdering::Relaxed);
                    debug!(sender = %sender, nonce, "evicted for capacity");
                }
            }
            if queue.entries.is_empty() {
                senders.remove(&sender);
            }
        }
        true
    }

    /// The best eligible bundle for one sender: the contiguous run from
    /// `base_nonce + 1` truncated at the prefix with the highest aggregate
    /// fee density.
    fn best_bundle(
        config: &MempoolConfig,
        index: &HashMap<TxHash, TransactionMeta>,
        sender: Address,
        queue: &SenderQueue,
        now: Instant,
        skip: usize,
    ) -> Option<Bundle> {
        let mut expected = queue.base_nonce + 1 + skip as u64;
        let mut run: Vec<(TxHash, &TransactionMeta)> = Vec::new();
        for (&nonce, hash) in queue.entries.range(expected..) {
            if nonce != expected {
                break;
            }
            let meta = index.get(hash)?;
            run.push((*hash, meta));
            expected += 1;
        }
        if run.is_empty() {
            return None;
        }

        // Pick the prefix with the best aggregate fee density.
        let mut best_len = 1;
        let mut best_fpb = 0u128;
        let mut fee = 0u128;
        let mut size = 0usize;
        for (i, (_, meta)) in run.iter().enumerate() {
            fee += meta.tx.fee.atomic().max(0) as u128;
            size += meta.size;
            let fpb = fee / size.max(1) as u128;
            if i == 0 || fpb > best_fpb {
                best_fpb = fpb;
                best_len = i + 1;
            }
        }
        run.truncate(best_len);

        let aggregate_fee: u128 = run
            .iter()
            .map(|(_, meta)| meta.tx.fee.atomic().max(0) as u128)
            .sum();
        let aggregate_size: usize = run.iter().map(|(_, meta)| meta.size).sum();
        let head_fpb = run[0].1.fee_per_byte as f64;
        let oldest = run
            .iter()
            .map(|(_, meta)| meta.received_at)
            .min()
            .unwrap_or(now);

        let aggregate_fpb = (aggregate_fee / aggregate_size.max(1) as u128) as f64;
        let ancestor_bonus = (aggregate_fpb - head_fpb).max(0.0);
        let age = now.duration_since(oldest).as_secs_f64();
        let score = aggregate_fpb
            + config.ancestor_fee_weight * ancestor_bonus
            + config.age_bonus_per_sec * age;

        Some(Bundle {
            sender,
            hashes: run.iter().map(|(hash, _)| *hash).collect(),
            aggregate_fee,
            aggregate_size,
            score,
            oldest,
        })
    }

    /// Select transactions for a block under the given caps.
    ///
    /// Bundles are taken whole, highest priority first; a bundle below the
    /// block-minimum fee density blocks its sender for this round (the
    /// cheap head cannot be skipped without breaking nonce order).
    pub fn select_for_block(&self, max_bytes: usize, max_count: usize) -> Vec<Transaction> {
        let now = Instant::now();
        let index = self.index.read();
        let senders = self.senders.read();

        let mut heap: BinaryHeap<Bundle> = BinaryHeap::new();
        let mut consumed: HashMap<Address, usize> = HashMap::new();
        for (&sender, queue) in senders.iter() {
            if let Some(bundle) = Self::best_bundle(&self.config, &index, sender, queue, now, 0) {
                heap.push(bundle);
            }
        }

        let mut selected = Vec::new();
        let mut used_bytes = 0usize;

        while let Some(bundle) = heap.pop() {
            if selected.len() >= max_count {
                break;
            }
            if bundle.fee_per_byte() < self.config.block_min_fee_per_byte {
                continue;
            }
            if used_bytes + bundle.aggregate_size > max_bytes
                || selected.len() + bundle.hashes.len() > max_count
            {
                // Doesn't fit; other senders may still.
                continue;
            }

            for hash in &bundle.hashes {
                if let Some(meta) = index.get(hash) {
                    selected.push(meta.tx.clone());
                }
            }
            used_bytes += bundle.aggregate_size;

            let offset = consumed.entry(bundle.sender).or_insert(0);
            *offset += bundle.hashes.len();
            if let Some(queue) = senders.get(&bundle.sender) {
                if let Some(next) =
                    Self::best_bundle(&self.config, &index, bundle.sender, queue, now, *offset)
                {
                    heap.push(next);
                }
            }
        }

        selected
    }

    /// Remove transactions confirmed in a block and advance sender bases.
    pub fn note_block_applied(&self, transactions: &[Transaction]) {
        let mut index = self.index.write();
        let mut senders = self.senders.write();

        for tx in transactions {
            if let Some(meta) = index.remove(&tx.hash()) {
                self.bytes.fetch_sub(meta.size, AtomicOrdering::Relaxed);
            }
            let Some(sender) = tx.from else { continue };
            if let Some(queue) = senders.get_mut(&sender) {
                queue.base_nonce = queue.base_nonce.max(tx.nonce);
                // Entries at or below the committed nonce can never be
                // included; drop them.
                let stale: Vec<u64> = queue
                    .entries
                    .range(..=tx.nonce)
                    .map(|(&nonce, _)| nonce)
                    .collect();
                for nonce in stale {
                    if let Some(hash) = queue.entries.remove(&nonce) {
                        if let Some(meta) = index.remove(&hash) {
                            self.bytes.fetch_sub(meta.size, AtomicOrdering::Relaxed);
                        }
                    }
                }
                if queue.entries.is_empty() {
                    senders.remove(&sender);
                }
            }
        }
    }

    /// Re-admit transactions from abandoned blocks after a reorg. Entries
    /// that conflict with the new canonical state are dropped silently.
    pub fn readmit(&self, transactions: Vec<Transaction>, chain_nonce_of: impl Fn(&Address) -> u64) {
        for tx in transactions {
            if tx.tx_type == TxType::MiningReward {
                continue;
            }
            let Some(sender) = tx.from else { continue };
            let chain_nonce = chain_nonce_of(&sender);
            match self.add_transaction(tx, chain_nonce) {
                Ok(_) => {}
                Err(error) => trace!(%error, "dropped transaction during readmission"),
            }
        }
    }

    pub fn get(&self, hash: &TxHash) -> Option<Transaction> {
        self.index.read().get(hash).map(|meta| meta.tx.clone())
    }

    pub fn contains(&self, hash: &TxHash) -> bool {
        self.index.read().contains_key(hash)
    }

    pub fn sender_transactions(&self, sender: &Address) -> Vec<Transaction> {
        let index = self.index.read();
        let senders = self.senders.read();
        senders
            .get(sender)
            .map(|queue| {
                queue
                    .entries
                    .values()
                    .filter_map(|hash| index.get(hash))
                    .map(|meta| meta.tx.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes.load(AtomicOrdering::Relaxed)
    }

    pub fn clear(&self) {
        self.index.write().clear();
        self.senders.write().clear();
        self.bytes.store(0, AtomicOrdering::Relaxed);
    }

    fn cleanup_expired(&self, now: Instant) {
        {
            let last = *self.last_cleanup.read();
            if now.duration_since(last) < Duration::from_secs(30) {
                return;
            }
        }
        let mut index = self.index.write();
        let mut senders = self.senders.write();

        let expired: Vec<TxHash> = index
            .iter()
            .filter(|(_, meta)| now.duration_since(meta.received_at) > self.config.expiration)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in expired {
            if let Some(meta) = index.remove(&hash) {
                self.bytes.fetch_sub(meta.size, AtomicOrdering::Relaxed);
                if let Some(sender) = meta.tx.from {
                    if let Some(queue) = senders.get_mut(&sender) {
                        queue.entries.remove(&meta.tx.nonce);
                        if queue.entries.is_empty() {
                            senders.remove(&sender);
                        }
                    }
                }
            }
        }
        *self.last_cleanup.write() = now;
    }

    /// Diagnostics snapshot.
    pub fn stats(&self) -> MempoolStats {
        let index = self.index.read();
        let now = Instant::now();
        let oldest_age = index
            .values()
            .map(|meta| now.duration_since(meta.received_at))
            .max()
            .unwrap_or_default();
        MempoolStats {
            transactions: index.len(),
            bytes: self.bytes.load(AtomicOrdering::Relaxed),
            senders: self.senders.read().len(),
            oldest_age,
        }
    }
}

/// Mempool diagnostics.
#[derive(Debug, Clone)]
pub struct MempoolStats {
    pub transactions: usize,
    pub bytes: usize,
    pub senders: usize,
    pub oldest_age: Duration,
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use logichain_crypto::{Keypair, SignatureScheme};
    use logichain_types::TxType;

    fn wallet(seed: u8) -> (Keypair, Address) {
        let keypair = Keypair::from_secret_bytes(SignatureScheme::Ed25519, &[seed; 32]).unwrap();
        let address = Address::from_public_key(&keypair.public_key());
        (keypair, address)
    }

    fn transfer(sender_seed: u8, nonce: u64, fee: &str) -> Transaction {
        transfer_with_payload(sender_seed, nonce, fee, Vec::new())
    }

    fn transfer_with_payload(
        sender_seed: u8,
        nonce: u64,
        fee: &str,
        payload: Vec<u8>,
    ) -> Transaction {
        let (keypair, from) = wallet(sender_seed);
        let mut tx = Transaction::new(
            TxType::Transfer,
            from,
            Some(Address([200; 20])),
            Amount::from_units(1),
            nonce,
            Amount::parse(fee).unwrap(),
            1_700_000_000.0,
            payload,
        );
        tx.sign(&keypair).unwrap();
        tx
    }

    fn pool() -> Mempool {
        Mempool::new(MempoolConfig::default())
    }

    #[test]
    fn add_and_remove() {
        let pool = pool();
        let tx = transfer(1, 1, "0.01");
        let hash = tx.hash();
        assert!(pool.add_transaction(tx.clone(), 0).unwrap());
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&hash));

        pool.note_block_applied(std::slice::from_ref(&tx));
        assert!(pool.is_empty());
        assert_eq!(pool.bytes_used(), 0);
    }

    #[test]
    fn duplicate_hash_rejected() {
        let pool = pool();
        let tx = transfer(1, 1, "0.01");
        pool.add_transaction(tx.clone(), 0).unwrap();
        assert_eq!(
            pool.add_transaction(tx, 0),
            Err(CoreError::DuplicateTransaction)
        );
    }

    #[test]
    fn same_nonce_without_bump_rejected() {
        let pool = pool();
        let first = transfer_with_payload(1, 1, "0.01", vec![1]);
        let second = transfer_with_payload(1, 1, "0.01", vec![2]);
        pool.add_transaction(first.clone(), 0).unwrap();
        assert_eq!(
            pool.add_transaction(second, 0),
            Err(CoreError::DuplicateTransaction)
        );
        assert!(pool.contains(&first.hash()));
    }

    #[test]
    fn replace_by_fee_requires_ten_percent() {
        let pool = pool();
        let incumbent = transfer(1, 1, "0.1");
        pool.add_transaction(incumbent.clone(), 0).unwrap();

        // +5% is not enough.
        let small_bump = transfer(1, 1, "0.105");
        assert_eq!(
            pool.add_transaction(small_bump, 0),
            Err(CoreError::DuplicateTransaction)
        );
        assert!(pool.contains(&incumbent.hash()));

        // +20% replaces.
        let big_bump = transfer(1, 1, "0.12");
        let big_hash = big_bump.hash();
        pool.add_transaction(big_bump, 0).unwrap();
        assert!(!pool.contains(&incumbent.hash()));
        assert!(pool.contains(&big_hash));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn replayed_nonce_rejected() {
        let pool = pool();
        let tx = transfer(1, 3, "0.01");
        assert_eq!(pool.add_transaction(tx, 3), Err(CoreError::ReplayDetected));
    }

    #[test]
    fn nonce_gap_tolerated_but_not_selected() {
        let pool = pool();
        // Nonce 3 with chain nonce 0 leaves a gap at 1 and 2.
        pool.add_transaction(transfer(1, 3, "0.5"), 0).unwrap();
        assert_eq!(pool.len(), 1);
        assert!(pool.select_for_block(1 << 20, 100).is_empty());

        // Filling the gap makes the whole run eligible, in nonce order.
        pool.add_transaction(transfer(1, 1, "0.01"), 0).unwrap();
        pool.add_transaction(transfer(1, 2, "0.01"), 0).unwrap();
        let selected = pool.select_for_block(1 << 20, 100);
        let nonces: Vec<u64> = selected.iter().map(|tx| tx.nonce).collect();
        assert_eq!(nonces, vec![1, 2, 3]);
    }

    #[test]
    fn nonce_beyond_gap_limit_rejected() {
        let pool = pool();
        let err = pool
            .add_transaction(transfer(1, 18, "0.01"), 0)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidNonce { expected: 1, .. }));
    }

    #[test]
    fn fee_bounds_enforced() {
        let pool = pool();
        assert!(pool.add_transaction(transfer(1, 1, "0.0001"), 0).is_err());
        assert!(pool.add_transaction(transfer(1, 1, "2"), 0).is_err());
    }

    #[test]
    fn unsigned_transaction_rejected() {
        let pool = pool();
        let (_, from) = wallet(1);
        let tx = Transaction::new(
            TxType::Transfer,
            from,
            Some(Address([9; 20])),
            Amount::from_units(1),
            1,
            Amount::parse("0.01").unwrap(),
            0.0,
            Vec::new(),
        );
        assert!(pool.add_transaction(tx, 0).is_err());
    }

    #[test]
    fn selection_prefers_higher_fee_density() {
        let pool = pool();
        pool.add_transaction(transfer(1, 1, "0.01"), 0).unwrap();
        pool.add_transaction(transfer(2, 1, "0.5"), 0).unwrap();
        pool.add_transaction(transfer(3, 1, "0.1"), 0).unwrap();

        let selected = pool.select_for_block(1 << 20, 2);
        assert_eq!(selected.len(), 2);
        let fees: Vec<String> = selected.iter().map(|tx| tx.fee.to_string()).collect();
        assert_eq!(fees, vec!["0.5", "0.1"]);
    }

    #[test]
    fn child_pays_for_parent_bundles_cheap_head() {
        let pool = pool();
        // Sender 1's head is cheap but its child is generous; sender 2 sits
        // in between. The bundle must outrank sender 2.
        pool.add_transaction(transfer(1, 1, "0.001"), 0).unwrap();
        pool.add_transaction(transfer(1, 2, "0.9"), 0).unwrap();
        pool.add_transaction(transfer(2, 1, "0.1"), 0).unwrap();

        let selected = pool.select_for_block(1 << 20, 2);
        assert_eq!(selected.len(), 2);
        let (_, sender1) = wallet(1);
        assert_eq!(selected[0].from, Some(sender1));
        assert_eq!(selected[0].nonce, 1);
        assert_eq!(selected[1].from, Some(sender1));
        assert_eq!(selected[1].nonce, 2);
    }

    #[test]
    fn selection_respects_count_cap_per_bundle() {
        let pool = pool();
        pool.add_transaction(transfer(1, 1, "0.001"), 0).unwrap();
        pool.add_transaction(transfer(1, 2, "0.9"), 0).unwrap();
        // The two-transaction bundle cannot fit in a one-slot block, and
        // splitting it would strand the cheap head; a lone sender fits.
        pool.add_transaction(transfer(2, 1, "0.005"), 0).unwrap();
        let selected = pool.select_for_block(1 << 20, 1);
        assert_eq!(selected.len(), 1);
        let (_, sender2) = wallet(2);
        assert_eq!(selected[0].from, Some(sender2));
    }

    #[test]
    fn capacity_evicts_lowest_priority() {
        let mut config = MempoolConfig::default();
        let probe = transfer(1, 1, "0.01");
        // Room for two probe-sized entries.
        config.max_bytes = probe.size() * 2;
        let pool = Mempool::new(config);

        pool.add_transaction(transfer(1, 1, "0.01"), 0).unwrap();
        pool.add_transaction(transfer(2, 1, "0.5"), 0).unwrap();
        // A richer entry evicts the cheapest tail.
        pool.add_transaction(transfer(3, 1, "0.9"), 0).unwrap();
        assert_eq!(pool.len(), 2);
        let (_, sender1) = wallet(1);
        assert!(pool.sender_transactions(&sender1).is_empty());
    }

    #[test]
    fn capacity_rejects_when_incoming_is_cheapest() {
        let mut config = MempoolConfig::default();
        let probe = transfer(1, 1, "0.5");
        config.max_bytes = probe.size() * 2;
        let pool = Mempool::new(config);

        pool.add_transaction(transfer(1, 1, "0.5"), 0).unwrap();
        pool.add_transaction(transfer(2, 1, "0.5"), 0).unwrap();
        let err = pool.add_transaction(transfer(3, 1, "0.001"), 0).unwrap_err();
        assert!(matches!(err, CoreError::ResourceExhausted(_)));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn block_applied_drops_stale_nonces() {
        let pool = pool();
        pool.add_transaction(transfer(1, 1, "0.01"), 0).unwrap();
        pool.add_transaction(transfer(1, 2, "0.01"), 0).unwrap();
        pool.add_transaction(transfer(1, 3, "0.01"), 0).unwrap();

        // A conflicting tx with nonce 2 confirms (e.g. mined elsewhere).
        let confirmed = transfer_with_payload(1, 2, "0.02", vec![9]);
        pool.note_block_applied(&[confirmed]);

        let (_, sender) = wallet(1);
        let remaining: Vec<u64> = pool
            .sender_transactions(&sender)
            .iter()
            .map(|tx| tx.nonce)
            .collect();
        assert_eq!(remaining, vec![3]);
    }

    #[test]
    fn readmit_drops_invalidated_entries() {
        let pool = pool();
        let valid = transfer(1, 1, "0.01");
        let replayed = transfer(2, 1, "0.01");
        pool.readmit(vec![valid.clone(), replayed], |address| {
            let (_, sender2) = wallet(2);
            if *address == sender2 {
                1 // nonce 1 already committed on the canonical chain
            } else {
                0
            }
        });
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&valid.hash()));
    }

    #[test]
    fn stats_reflect_pool() {
        let pool = pool();
        pool.add_transaction(transfer(1, 1, "0.01"), 0).unwrap();
        pool.add_transaction(transfer(2, 1, "0.02"), 0).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.transactions, 2);
        assert_eq!(stats.senders, 2);
        assert!(stats.bytes > 0);
    }
}
