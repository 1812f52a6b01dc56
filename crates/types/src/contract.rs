//! Delivery contracts.
//!
//! A contract escrows payment for a pickup→delivery run and accumulates
//! the signed checkpoint chain that proves fulfillment. The state machine
//! itself lives in `logichain-contracts`; this module holds the data model
//! and the canonical payload encodings carried by contract transactions.

use crate::address::Address;
use crate::amount::Amount;
use crate::checkpoint::Checkpoint;
use crate::error::{CoreError, CoreResult};
use crate::geo::GeoPoint;
use logichain_crypto::{ByteReader, ByteWriter};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type ContractId = [u8; 32];

/// Contract payload format version; unknown versions are rejected.
pub const CONTRACT_PAYLOAD_VERSION: u8 = 1;

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractState {
    Draft,
    Open,
    Accepted,
    InTransit,
    Delivered,
    Validated,
    Expired,
    Disputed,
}

impl ContractState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ContractState::Validated | ContractState::Expired | ContractState::Disputed
        )
    }
}

impl fmt::Display for ContractState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContractState::Draft => "DRAFT",
            ContractState::Open => "OPEN",
            ContractState::Accepted => "ACCEPTED",
            ContractState::InTransit => "IN_TRANSIT",
            ContractState::Delivered => "DELIVERED",
            ContractState::Validated => "VALIDATED",
            ContractState::Expired => "EXPIRED",
            ContractState::Disputed => "DISPUTED",
        };
        f.write_str(name)
    }
}

/// What is being moved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CargoInfo {
    pub kind: String,
    pub weight_kg: f64,
    pub volume_m3: f64,
    pub priority: u8,
    pub estimated_value: Amount,
}

impl CargoInfo {
    fn encode_into(&self, writer: &mut ByteWriter) {
        writer.put_bytes(self.kind.as_bytes());
        writer.put_f64(self.weight_kg);
        writer.put_f64(self.volume_m3);
        writer.put_u8(self.priority);
        writer.put_i128(self.estimated_value.atomic());
    }

    fn decode_from(reader: &mut ByteReader<'_>) -> CoreResult<Self> {
        let kind = String::from_utf8(reader.get_bytes()?.to_vec())
            .map_err(|_| CoreError::InvalidBlockStructure("cargo kind is not UTF-8".into()))?;
        Ok(Self {
            kind,
            weight_kg: reader.get_f64()?,
            volume_m3: reader.get_f64()?,
            priority: reader.get_u8()?,
            estimated_value: Amount::from_atomic(reader.get_i128()?),
        })
    }
}

/// A delivery contract and its accumulated proof state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: ContractId,
    pub creator: Address,
    /// Assigned on acceptance.
    pub driver: Option<Address>,
    /// The driver's Ed25519 key, against which checkpoints verify.
    #[serde(with = "serde_bytes")]
    pub driver_key: Vec<u8>,
    pub pickup: GeoPoint,
    pub delivery: GeoPoint,
    pub tolerance_radius_m: f64,
    pub max_error_m: f64,
    pub cargo: CargoInfo,
    pub escrow: Amount,
    pub created_at: f64,
    pub expires_at: f64,
    pub state: ContractState,
    pub checkpoints: Vec<Checkpoint>,
}

impl Contract {
    /// Materialize a contract from its creation payload. The contract id
    /// is the hash of the creating transaction, which is unique per sender
    /// and nonce.
    pub fn from_create(
        id: ContractId,
        creator: Address,
        escrow: Amount,
        created_at: f64,
        payload: &ContractCreatePayload,
    ) -> Self {
        Self {
            id,
            creator,
            driver: None,
            driver_key: Vec::new(),
            pickup: payload.pickup,
            delivery: payload.delivery,
            tolerance_radius_m: payload.tolerance_radius_m,
            max_error_m: payload.max_error_m,
            cargo: payload.cargo.clone(),
            escrow,
            created_at,
            expires_at: payload.expires_at,
            state: ContractState::Open,
            checkpoints: Vec::new(),
        }
    }

    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// Distance, duration, and speed over the recorded route.
    pub fn route_stats(&self) -> RouteStats {
        let mut total_distance_km = 0.0;
        let mut total_time_secs = 0.0;
        for pair in self.checkpoints.windows(2) {
            total_distance_km += pair[0].point.haversine_km(&pair[1].point);
            total_time_secs += pair[1].timestamp - pair[0].timestamp;
        }
        let avg_speed_kmh = if total_time_secs > 0.0 {
            total_distance_km / (total_time_secs / 3600.0)
        } else {
            0.0
        };
        RouteStats {
            total_distance_km,
            total_time_secs,
            avg_speed_kmh,
        }
    }
}

/// Aggregate route metrics exposed by contract queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteStats {
    pub total_distance_km: f64,
    pub total_time_secs: f64,
    pub avg_speed_kmh: f64,
}

/// Payload of a CONTRACT_CREATE transaction. The escrow is the
/// transaction amount and the creator its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractCreatePayload {
    pub pickup: GeoPoint,
    pub delivery: GeoPoint,
    pub tolerance_radius_m: f64,
    pub max_error_m: f64,
    pub cargo: CargoInfo,
    pub expires_at: f64,
}

impl ContractCreatePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(96);
        writer.put_u8(CONTRACT_PAYLOAD_VERSION);
        writer.put_f64(self.pickup.lat);
        writer.put_f64(self.pickup.lng);
        writer.put_f64(self.delivery.lat);
        writer.put_f64(self.delivery.lng);
        writer.put_f64(self.tolerance_radius_m);
        writer.put_f64(self.max_error_m);
        self.cargo.encode_into(&mut writer);
        writer.put_f64(self.expires_at);
        writer.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let mut reader = ByteReader::new(bytes);
        check_payload_version(&mut reader)?;
        let payload = Self {
            pickup: GeoPoint::new(reader.get_f64()?, reader.get_f64()?),
            delivery: GeoPoint::new(reader.get_f64()?, reader.get_f64()?),
            tolerance_radius_m: reader.get_f64()?,
            max_error_m: reader.get_f64()?,
            cargo: CargoInfo::decode_from(&mut reader)?,
            expires_at: reader.get_f64()?,
        };
        expect_exhausted(&reader)?;
        Ok(payload)
    }
}

/// Payload of a CONTRACT_CHECKPOINT transaction: the driver-side events
/// that advance a contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContractAction {
    /// Driver takes the contract, binding the key future checkpoints
    /// must verify under.
    Accept {
        contract_id: ContractId,
        #[serde(with = "serde_bytes")]
        driver_key: Vec<u8>,
    },
    /// A position report along the route.
    Checkpoint {
        contract_id: ContractId,
        checkpoint: Checkpoint,
    },
    /// Freeze the contract pending off-chain resolution.
    Dispute {
        contract_id: ContractId,
        reason: String,
    },
}

impl ContractAction {
    pub fn contract_id(&self) -> &ContractId {
        match self {
            ContractAction::Accept { contract_id, .. }
            | ContractAction::Checkpoint { contract_id, .. }
            | ContractAction::Dispute { contract_id, .. } => contract_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(128);
        writer.put_u8(CONTRACT_PAYLOAD_VERSION);
        match self {
            ContractAction::Accept {
                contract_id,
                driver_key,
            } => {
                writer.put_u8(0);
                writer.put_raw(contract_id);
                writer.put_bytes(driver_key);
            }
            ContractAction::Checkpoint {
                contract_id,
                checkpoint,
            } => {
                writer.put_u8(1);
                writer.put_raw(contract_id);
                checkpoint.encode_into(&mut writer);
            }
            ContractAction::Dispute {
                contract_id,
                reason,
            } => {
                writer.put_u8(2);
                writer.put_raw(contract_id);
                writer.put_bytes(reason.as_bytes());
            }
        }
        writer.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let mut reader = ByteReader::new(bytes);
        check_payload_version(&mut reader)?;
        let tag = reader.get_u8()?;
        let action = match tag {
            0 => ContractAction::Accept {
                contract_id: reader.get_array()?,
                driver_key: reader.get_bytes()?.to_vec(),
            },
            1 => ContractAction::Checkpoint {
                contract_id: reader.get_array()?,
                checkpoint: Checkpoint::decode_from(&mut reader)?,
            },
            2 => {
                let contract_id = reader.get_array()?;
                let reason = String::from_utf8(reader.get_bytes()?.to_vec()).map_err(|_| {
                    CoreError::InvalidBlockStructure("dispute reason is not UTF-8".into())
                })?;
                ContractAction::Dispute {
                    contract_id,
                    reason,
                }
            }
            other => {
                return Err(CoreError::InvalidBlockStructure(format!(
                    "unknown contract action tag {other}"
                )))
            }
        };
        expect_exhausted(&reader)?;
        Ok(action)
    }
}

/// Payload of a CONTRACT_FINALIZE transaction, recording the quorum-backed
/// VALIDATED transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractFinalizePayload {
    pub contract_id: ContractId,
}

impl ContractFinalizePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(33);
        writer.put_u8(CONTRACT_PAYLOAD_VERSION);
        writer.put_raw(&self.contract_id);
        writer.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let mut reader = ByteReader::new(bytes);
        check_payload_version(&mut reader)?;
        let payload = Self {
            contract_id: reader.get_array()?,
        };
        expect_exhausted(&reader)?;
        Ok(payload)
    }
}

fn check_payload_version(reader: &mut ByteReader<'_>) -> CoreResult<()> {
    let version = reader.get_u8()?;
    if version != CONTRACT_PAYLOAD_VERSION {
        return Err(CoreError::InvalidBlockStructure(format!(
            "unknown contract payload version {version}"
        )));
    }
    Ok(())
}

fn expect_exhausted(reader: &ByteReader<'_>) -> CoreResult<()> {
    if !reader.is_exhausted() {
        return Err(CoreError::InvalidBlockStructure(
            "trailing bytes in contract payload".into(),
        ));
    }
    Ok(())
}
