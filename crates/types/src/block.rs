//! Blocks and their bit-exact wire codec.
//!
//! The header hash (double SHA-256 over the fixed 120-byte header) is the
//! proof-of-work commitment; validator attestations sign that hash and are
//! appended outside of it, so attesting cannot invalidate the mined nonce.

use crate::address::{Address, ADDRESS_WIRE_BYTES};
use crate::config::ChainMode;
use crate::error::{CoreError, CoreResult};
use crate::transaction::Transaction;
use logichain_crypto::{
    double_sha256, leading_zero_bits, ByteReader, ByteWriter, SIGNATURE_BYTES,
};
use serde::{Deserialize, Serialize};

/// Current block wire version. Unknown versions are rejected.
pub const BLOCK_VERSION: u32 = 1;

/// Fixed header width on the wire.
pub const BLOCK_HEADER_BYTES: usize = 4 + 8 + 32 + 32 + 8 + 4 + 8 + ADDRESS_WIRE_BYTES + 1;

pub type BlockHash = [u8; 32];

/// A validator's signature over the block header hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    pub validator: Address,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Block header, the unit of proof-of-work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub height: u64,
    pub parent_hash: BlockHash,
    pub merkle_root: [u8; 32],
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    /// Required leading zero bits of the header hash.
    pub difficulty: u32,
    pub nonce: u64,
    pub miner: Address,
    pub mode: ChainMode,
}

impl BlockHeader {
    /// The fixed 120-byte canonical encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(BLOCK_HEADER_BYTES);
        writer.put_u32(self.version);
        writer.put_u64(self.height);
        writer.put_raw(&self.parent_hash);
        writer.put_raw(&self.merkle_root);
        writer.put_f64(self.timestamp);
        writer.put_u32(self.difficulty);
        writer.put_u64(self.nonce);
        writer.put_raw(&self.miner.to_wire());
        writer.put_u8(self.mode.as_byte());
        writer.into_bytes()
    }

    pub fn decode_from(reader: &mut ByteReader<'_>) -> CoreResult<Self> {
        let version = reader.get_u32()?;
        if version != BLOCK_VERSION {
            return Err(CoreError::InvalidBlockStructure(format!(
                "unknown block version {version}"
            )));
        }
        let height = reader.get_u64()?;
        let parent_hash = reader.get_array()?;
        let merkle_root = reader.get_array()?;
        let timestamp = reader.get_f64()?;
        let difficulty = reader.get_u32()?;
        let nonce = reader.get_u64()?;
        let miner_wire: [u8; ADDRESS_WIRE_BYTES] = reader.get_array()?;
        let miner = Address::from_wire(&miner_wire)
            .map_err(|e| CoreError::InvalidBlockStructure(format!("bad miner address: {e}")))?;
        let mode = ChainMode::from_byte(reader.get_u8()?)
            .ok_or_else(|| CoreError::InvalidBlockStructure("unknown mode tag".into()))?;
        Ok(Self {
            version,
            height,
            parent_hash,
            merkle_root,
            timestamp,
            difficulty,
            nonce,
            miner,
            mode,
        })
    }

    /// Block hash: double SHA-256 over the canonical header.
    pub fn hash(&self) -> BlockHash {
        double_sha256(&self.encode())
    }

    /// Whether the header hash clears its own difficulty target.
    pub fn meets_difficulty(&self) -> bool {
        leading_zero_bits(&self.hash()) >= self.difficulty
    }

    /// Expected work contributed by this header, `2^difficulty`.
    pub fn work(&self) -> u128 {
        1u128 << self.difficulty.min(127)
    }
}

/// A block: header, quorum attestations, and ordered transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub attestations: Vec<Attestation>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    /// Full wire encoding: header ‖ attestation_count(2) ‖ attestations ‖
    /// varint tx_count ‖ transactions.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(self.size());
        writer.put_raw(&self.header.encode());
        writer.put_u16(self.attestations.len() as u16);
        for attestation in &self.attestations {
            writer.put_raw(&attestation.validator.to_wire());
            writer.put_raw(&attestation.signature);
        }
        writer.put_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            writer.put_raw(&tx.encode());
        }
        writer.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let mut reader = ByteReader::new(bytes);
        let header = BlockHeader::decode_from(&mut reader)?;

        let attestation_count = reader.get_u16()? as usize;
        let mut attestations = Vec::with_capacity(attestation_count);
        for _ in 0..attestation_count {
            let wire: [u8; ADDRESS_WIRE_BYTES] = reader.get_array()?;
            let validator = Address::from_wire(&wire).map_err(|e| {
                CoreError::InvalidBlockStructure(format!("bad validator address: {e}"))
            })?;
            let signature = reader.get_raw(SIGNATURE_BYTES)?.to_vec();
            attestations.push(Attestation {
                validator,
                signature,
            });
        }

        let tx_count = reader.get_varint()? as usize;
        let mut transactions = Vec::with_capacity(tx_count.min(4096));
        for _ in 0..tx_count {
            transactions.push(Transaction::decode_from(&mut reader)?);
        }
        if !reader.is_exhausted() {
            return Err(CoreError::InvalidBlockStructure(
                "trailing bytes after block".into(),
            ));
        }

        Ok(Self {
            header,
            attestations,
            transactions,
        })
    }

    /// Encoded size in bytes, checked against the mode's cap.
    pub fn size(&self) -> usize {
        let tx_bytes: usize = self.transactions.iter().map(Transaction::size).sum();
        let varint_len = {
            let mut n = self.transactions.len() as u64;
            let mut len = 1;
            while n >= 0x80 {
                n >>= 7;
                len += 1;
            }
            len
        };
        BLOCK_HEADER_BYTES
            + 2
            + self.attestations.len() * (ADDRESS_WIRE_BYTES + SIGNATURE_BYTES)
            + varint_len
            + tx_bytes
    }

    /// Hashes of the contained transactions, in block order.
    pub fn tx_hashes(&self) -> Vec<[u8; 32]> {
        self.transactions.iter().map(Transaction::hash).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;

    fn header() -> BlockHeader {
        BlockHeader {
            version: BLOCK_VERSION,
            height: 7,
            parent_hash: [1; 32],
            merkle_root: [2; 32],
            timestamp: 1_700_000_000.25,
            difficulty: 8,
            nonce: 42,
            miner: Address([3; 20]),
            mode: ChainMode::OnGrid,
        }
    }

    fn block() -> Block {
        Block {
            header: header(),
            attestations: vec![Attestation {
                validator: Address([4; 20]),
                signature: vec![7; SIGNATURE_BYTES],
            }],
            transactions: vec![Transaction::mining_reward(
                Address([3; 20]),
                Amount::from_units(50),
                1_700_000_000.25,
            )],
        }
    }

    #[test]
    fn header_encoding_is_fixed_width() {
        assert_eq!(header().encode().len(), BLOCK_HEADER_BYTES);
    }

    #[test]
    fn block_roundtrip_is_bit_exact() {
        let block = block();
        let encoded = block.encode();
        let decoded = Block::decode(&encoded).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.encode(), encoded);
    }

    #[test]
    fn size_matches_encoding() {
        let block = block();
        assert_eq!(block.size(), block.encode().len());
    }

    #[test]
    fn hash_ignores_attestations() {
        let mut block = block();
        let hash = block.hash();
        block.attestations.push(Attestation {
            validator: Address([5; 20]),
            signature: vec![9; SIGNATURE_BYTES],
        });
        assert_eq!(block.hash(), hash);
    }

    #[test]
    fn hash_changes_with_nonce() {
        let mut block = block();
        let hash = block.hash();
        block.header.nonce += 1;
        assert_ne!(block.hash(), hash);
    }

    #[test]
    fn unknown_version_rejected() {
        let mut block = block();
        block.header.version = 9;
        assert!(Block::decode(&block.encode()).is_err());
    }

    #[test]
    fn work_doubles_per_difficulty_bit() {
        let mut h = header();
        h.difficulty = 3;
        assert_eq!(h.work(), 8);
        h.difficulty = 10;
        assert_eq!(h.work(), 1024);
    }

    #[test]
    fn truncated_block_rejected() {
        let encoded = block().encode();
        assert!(Block::decode(&encoded[..encoded.len() - 1]).is_err());
    }
}
