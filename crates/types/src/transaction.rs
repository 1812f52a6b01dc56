//! Transactions and their bit-exact wire codec.

use crate::address::{Address, ADDRESS_WIRE_BYTES};
use crate::amount::Amount;
use crate::error::{CoreError, CoreResult};
use logichain_crypto::{
    double_sha256, ByteReader, ByteWriter, Keypair, PublicKey, SignatureScheme, SIGNATURE_BYTES,
};
use serde::{Deserialize, Serialize};

/// Current transaction wire version. Unknown versions are rejected.
pub const TX_VERSION: u32 = 1;

pub type TxHash = [u8; 32];

/// Transaction kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Transfer,
    ContractCreate,
    ContractCheckpoint,
    ContractFinalize,
    MiningReward,
}

impl TxType {
    pub fn as_byte(self) -> u8 {
        match self {
            TxType::Transfer => 0,
            TxType::ContractCreate => 1,
            TxType::ContractCheckpoint => 2,
            TxType::ContractFinalize => 3,
            TxType::MiningReward => 4,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(TxType::Transfer),
            1 => Some(TxType::ContractCreate),
            2 => Some(TxType::ContractCheckpoint),
            3 => Some(TxType::ContractFinalize),
            4 => Some(TxType::MiningReward),
            _ => None,
        }
    }

    /// Whether this kind drives the contract state machine.
    pub fn is_contract_op(self) -> bool {
        matches!(
            self,
            TxType::ContractCreate | TxType::ContractCheckpoint | TxType::ContractFinalize
        )
    }
}

/// A signed transaction.
///
/// The sender's public key travels with the transaction: addresses are
/// hash digests, so a decoded transaction would otherwise be unverifiable.
/// Mining rewards carry no sender, no key, and an all-zero signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub tx_type: TxType,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub amount: Amount,
    pub nonce: u64,
    pub fee: Amount,
    pub timestamp: f64,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub scheme: SignatureScheme,
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Build an unsigned transaction; call [`Transaction::sign`] before
    /// submitting it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tx_type: TxType,
        from: Address,
        to: Option<Address>,
        amount: Amount,
        nonce: u64,
        fee: Amount,
        timestamp: f64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: TX_VERSION,
            tx_type,
            from: Some(from),
            to,
            amount,
            nonce,
            fee,
            timestamp,
            payload,
            scheme: SignatureScheme::EcdsaSecp256k1,
            public_key: Vec::new(),
            signature: vec![0u8; SIGNATURE_BYTES],
        }
    }

    /// The coinbase transaction minting the block reward plus fees.
    pub fn mining_reward(miner: Address, amount: Amount, timestamp: f64) -> Self {
        Self {
            version: TX_VERSION,
            tx_type: TxType::MiningReward,
            from: None,
            to: Some(miner),
            amount,
            nonce: 0,
            fee: Amount::ZERO,
            timestamp,
            payload: Vec::new(),
            scheme: SignatureScheme::Ed25519,
            public_key: Vec::new(),
            signature: vec![0u8; SIGNATURE_BYTES],
        }
    }

    /// Canonical bytes covered by the signature: every field except the
    /// signature itself.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(128 + self.payload.len());
        self.write_unsigned(&mut writer);
        writer.into_bytes()
    }

    fn write_unsigned(&self, writer: &mut ByteWriter) {
        writer.put_u32(self.version);
        writer.put_u8(self.tx_type.as_byte());
        match &self.from {
            Some(address) => {
                writer.put_u8(1);
                writer.put_raw(&address.to_wire());
            }
            None => writer.put_u8(0),
        }
        match &self.to {
            Some(address) => {
                writer.put_u8(1);
                writer.put_raw(&address.to_wire());
            }
            None => writer.put_u8(0),
        }
        writer.put_i128(self.amount.atomic());
        writer.put_u64(self.nonce);
        writer.put_i128(self.fee.atomic());
        writer.put_f64(self.timestamp);
        writer.put_bytes(&self.payload);
        writer.put_u8(self.scheme.as_byte());
        writer.put_u8(self.public_key.len() as u8);
        writer.put_raw(&self.public_key);
    }

    /// Full wire encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(192 + self.payload.len());
        self.write_unsigned(&mut writer);
        writer.put_raw(&self.signature);
        writer.into_bytes()
    }

    /// Decode one transaction from a reader, leaving trailing bytes.
    pub fn decode_from(reader: &mut ByteReader<'_>) -> CoreResult<Self> {
        let version = reader.get_u32()?;
        if version != TX_VERSION {
            return Err(CoreError::InvalidBlockStructure(format!(
                "unknown transaction version {version}"
            )));
        }
        let tx_type = TxType::from_byte(reader.get_u8()?).ok_or_else(|| {
            CoreError::InvalidBlockStructure("unknown transaction type".into())
        })?;
        let from = Self::read_optional_address(reader)?;
        let to = Self::read_optional_address(reader)?;
        let amount = Amount::from_atomic(reader.get_i128()?);
        let nonce = reader.get_u64()?;
        let fee = Amount::from_atomic(reader.get_i128()?);
        let timestamp = reader.get_f64()?;
        let payload = reader.get_bytes()?.to_vec();
        let scheme = SignatureScheme::from_byte(reader.get_u8()?).ok_or_else(|| {
            CoreError::InvalidBlockStructure("unknown signature scheme".into())
        })?;
        let key_len = reader.get_u8()? as usize;
        let public_key = reader.get_raw(key_len)?.to_vec();
        let signature = reader.get_raw(SIGNATURE_BYTES)?.to_vec();

        let tx = Self {
            version,
            tx_type,
            from,
            to,
            amount,
            nonce,
            fee,
            timestamp,
            payload,
            scheme,
            public_key,
            signature,
        };
        tx.check_shape()?;
        Ok(tx)
    }

    /// Decode a standalone transaction, requiring every byte be consumed.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let mut reader = ByteReader::new(bytes);
        let tx = Self::decode_from(&mut reader)?;
        if !reader.is_exhausted() {
            return Err(CoreError::InvalidBlockStructure(
                "trailing bytes after transaction".into(),
            ));
        }
        Ok(tx)
    }

    fn read_optional_address(reader: &mut ByteReader<'_>) -> CoreResult<Option<Address>> {
        match reader.get_u8()? {
            0 => Ok(None),
            1 => {
                let wire: [u8; ADDRESS_WIRE_BYTES] = reader.get_array()?;
                let address = Address::from_wire(&wire).map_err(|e| {
                    CoreError::InvalidBlockStructure(format!("bad address: {e}"))
                })?;
                Ok(Some(address))
            }
            other => Err(CoreError::InvalidBlockStructure(format!(
                "bad address presence byte {other}"
            ))),
        }
    }

    /// Structural invariants that hold for every well-formed transaction.
    fn check_shape(&self) -> CoreResult<()> {
        match self.tx_type {
            TxType::MiningReward => {
                if self.from.is_some() || !self.public_key.is_empty() {
                    return Err(CoreError::InvalidBlockStructure(
                        "reward transaction must not carry a sender".into(),
                    ));
                }
                if self.to.is_none() {
                    return Err(CoreError::InvalidBlockStructure(
                        "reward transaction must name the miner".into(),
                    ));
                }
            }
            _ => {
                if self.from.is_none() {
                    return Err(CoreError::InvalidBlockStructure(
                        "transaction missing sender".into(),
                    ));
                }
            }
        }
        if self.amount.is_negative() || self.fee.is_negative() {
            return Err(CoreError::InvalidBlockStructure(
                "negative amount or fee".into(),
            ));
        }
        if !self.public_key.is_empty() && self.public_key.len() != self.scheme.public_key_len() {
            return Err(CoreError::InvalidBlockStructure(
                "public key length does not match scheme".into(),
            ));
        }
        if self.signature.len() != SIGNATURE_BYTES {
            return Err(CoreError::InvalidBlockStructure(
                "signature must be 64 bytes".into(),
            ));
        }
        Ok(())
    }

    /// Transaction hash: double SHA-256 over the full wire encoding.
    pub fn hash(&self) -> TxHash {
        double_sha256(&self.encode())
    }

    /// Encoded size in bytes, the unit of fee density and block capacity.
    pub fn size(&self) -> usize {
        // Fixed fields + variable payload and key.
        4 + 1
            + 1
            + self.from.map_or(0, |_| ADDRESS_WIRE_BYTES)
            + 1
            + self.to.map_or(0, |_| ADDRESS_WIRE_BYTES)
            + 16
            + 8
            + 16
            + 8
            + 4
            + self.payload.len()
            + 1
            + 1
            + self.public_key.len()
            + SIGNATURE_BYTES
    }

    /// Fee density in atomic parts per byte.
    pub fn fee_per_byte(&self) -> u128 {
        let size = self.size().max(1) as u128;
        self.fee.atomic().max(0) as u128 / size
    }

    /// Sign in place, attaching the scheme and public key.
    pub fn sign(&mut self, keypair: &Keypair) -> CoreResult<()> {
        let public = keypair.public_key();
        match self.from {
            Some(from) if from == Address::from_public_key(&public) => {}
            _ => return Err(CoreError::InvalidSignature),
        }
        self.scheme = public.scheme;
        self.public_key = public.bytes.clone();
        self.signature = keypair.sign(&self.signing_bytes()).to_vec();
        Ok(())
    }

    /// Verify the signature against the sender address.
    pub fn verify_signature(&self) -> CoreResult<()> {
        if self.tx_type == TxType::MiningReward {
            return Ok(());
        }
        let from = self.from.ok_or(CoreError::InvalidSignature)?;
        let public = PublicKey::from_bytes(self.scheme, &self.public_key)?;
        if Address::from_public_key(&public) != from {
            return Err(CoreError::InvalidSignature);
        }
        public.verify(&self.signing_bytes(), &self.signature)?;
        Ok(())
    }
}
