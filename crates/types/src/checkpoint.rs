//! Geolocated delivery checkpoints.
//!
//! Each checkpoint commits to its predecessor, forming a tamper-evident
//! chain inside the contract. Drivers sign the tuple
//! `contract_id ‖ seq ‖ timestamp ‖ coord ‖ prev_checkpoint_hash` with
//! their Ed25519 key.

use crate::contract::ContractId;
use crate::error::{CoreError, CoreResult};
use crate::geo::GeoPoint;
use logichain_crypto::{sha256, ByteReader, ByteWriter, Keypair, PublicKey, SIGNATURE_BYTES};
use serde::{Deserialize, Serialize};

/// Optional cargo telemetry attached to a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SensorReadings {
    pub temperature_c: Option<f32>,
    pub humidity_pct: Option<f32>,
    pub shock: bool,
}

/// One signed position report along a delivery route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Position in the contract's checkpoint chain, starting at 1.
    pub seq: u32,
    pub timestamp: f64,
    pub point: GeoPoint,
    pub accuracy_m: f64,
    pub sensors: Option<SensorReadings>,
    /// Hash of the previous checkpoint, all zeroes for the first.
    pub prev_hash: [u8; 32],
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl Checkpoint {
    pub fn new(
        seq: u32,
        timestamp: f64,
        point: GeoPoint,
        accuracy_m: f64,
        prev_hash: [u8; 32],
    ) -> Self {
        Self {
            seq,
            timestamp,
            point,
            accuracy_m,
            sensors: None,
            prev_hash,
            signature: vec![0u8; SIGNATURE_BYTES],
        }
    }

    /// Canonical signed tuple.
    pub fn signing_bytes(&self, contract_id: &ContractId) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(96);
        writer.put_raw(contract_id);
        writer.put_u32(self.seq);
        writer.put_f64(self.timestamp);
        writer.put_f64(self.point.lat);
        writer.put_f64(self.point.lng);
        writer.put_raw(&self.prev_hash);
        writer.into_bytes()
    }

    /// Checkpoint hash: single SHA-256 over the signed tuple plus the
    /// signature, committing each checkpoint to its whole content.
    pub fn hash(&self, contract_id: &ContractId) -> [u8; 32] {
        let mut bytes = self.signing_bytes(contract_id);
        bytes.extend_from_slice(&self.signature);
        sha256(&bytes)
    }

    pub fn sign(&mut self, contract_id: &ContractId, driver: &Keypair) {
        self.signature = driver.sign(&self.signing_bytes(contract_id)).to_vec();
    }

    pub fn verify_signature(
        &self,
        contract_id: &ContractId,
        driver_key: &PublicKey,
    ) -> CoreResult<()> {
        driver_key
            .verify(&self.signing_bytes(contract_id), &self.signature)
            .map_err(|_| CoreError::InvalidSignature)
    }

    /// Canonical encoding for transaction payloads.
    pub fn encode_into(&self, writer: &mut ByteWriter) {
        writer.put_u32(self.seq);
        writer.put_f64(self.timestamp);
        writer.put_f64(self.point.lat);
        writer.put_f64(self.point.lng);
        writer.put_f64(self.accuracy_m);
        match &self.sensors {
            Some(sensors) => {
                writer.put_u8(1);
                match sensors.temperature_c {
                    Some(t) => {
                        writer.put_u8(1);
                        writer.put_u32(t.to_bits());
                    }
                    None => writer.put_u8(0),
                }
                match sensors.humidity_pct {
                    Some(h) => {
                        writer.put_u8(1);
                        writer.put_u32(h.to_bits());
                    }
                    None => writer.put_u8(0),
                }
                writer.put_u8(sensors.shock as u8);
            }
            None => writer.put_u8(0),
        }
        writer.put_raw(&self.prev_hash);
        writer.put_raw(&self.signature);
    }

    pub fn decode_from(reader: &mut ByteReader<'_>) -> CoreResult<Self> {
        let seq = reader.get_u32()?;
        let timestamp = reader.get_f64()?;
        let lat = reader.get_f64()?;
        let lng = reader.get_f64()?;
        let accuracy_m = reader.get_f64()?;
        let sensors = match reader.get_u8()? {
            0 => None,
            1 => {
                let temperature_c = match reader.get_u8()? {
                    0 => None,
                    _ => Some(f32::from_bits(reader.get_u32()?)),
                };
                let humidity_pct = match reader.get_u8()? {
                    0 => None,
                    _ => Some(f32::from_bits(reader.get_u32()?)),
                };
                let shock = reader.get_u8()? != 0;
                Some(SensorReadings {
                    temperature_c,
                    humidity_pct,
                    shock,
                })
            }
            other => {
                return Err(CoreError::InvalidBlockStructure(format!(
                    "bad sensor presence byte {other}"
                )))
            }
        };
        let prev_hash = reader.get_array()?;
        let signature = reader.get_raw(SIGNATURE_BYTES)?.to_vec();
        Ok(Self {
            seq,
            timestamp,
            point: GeoPoint::new(lat, lng),
            accuracy_m,
            sensors,
            prev_hash,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logichain_crypto::SignatureScheme;

    fn checkpoint() -> Checkpoint {
        let mut cp = Checkpoint::new(1, 1_700_000_000.0, GeoPoint::new(-23.55, -46.63), 5.0, [0; 32]);
        cp.sensors = Some(SensorReadings {
            temperature_c: Some(4.5),
            humidity_pct: None,
            shock: false,
        });
        cp
    }

    #[test]
    fn encode_decode_roundtrip() {
        let cp = checkpoint();
        let mut writer = ByteWriter::new();
        cp.encode_into(&mut writer);
        let bytes = writer.into_bytes();
        let mut reader = ByteReader::new(&bytes);
        let decoded = Checkpoint::decode_from(&mut reader).unwrap();
        assert!(reader.is_exhausted());
        assert_eq!(decoded, cp);
    }

    #[test]
    fn signature_binds_contract_and_position() {
        let driver = Keypair::generate(SignatureScheme::Ed25519);
        let contract_id = [7u8; 32];
        let mut cp = checkpoint();
        cp.sign(&contract_id, &driver);
        cp.verify_signature(&contract_id, &driver.public_key())
            .unwrap();

        // Same signature under a different contract fails.
        assert!(cp
            .verify_signature(&[8u8; 32], &driver.public_key())
            .is_err());

        // Moving the point invalidates the signature.
        cp.point.lat += 0.01;
        assert!(cp
            .verify_signature(&contract_id, &driver.public_key())
            .is_err());
    }

    #[test]
    fn hash_commits_to_signature() {
        let driver = Keypair::generate(SignatureScheme::Ed25519);
        let contract_id = [7u8; 32];
        let mut cp = checkpoint();
        let unsigned = cp.hash(&contract_id);
        cp.sign(&contract_id, &driver);
        assert_ne!(cp.hash(&contract_id), unsigned);
    }
}
