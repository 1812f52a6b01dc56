//! LogiChain addresses.
//!
//! An address is the last 20 bytes of SHA-256 over a public key, rendered
//! with the human prefix `LGC` followed by 40 hex characters. On the wire
//! it occupies 23 bytes: the three ASCII prefix bytes plus the payload.

use logichain_crypto::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Human-readable prefix.
pub const ADDRESS_PREFIX: &str = "LGC";
/// Raw payload bytes per address.
pub const ADDRESS_PAYLOAD_BYTES: usize = 20;
/// Wire width: prefix + payload.
pub const ADDRESS_WIRE_BYTES: usize = 23;
/// Encoded string length: prefix + 40 hex characters.
pub const ADDRESS_STRING_LENGTH: usize = ADDRESS_PREFIX.len() + ADDRESS_PAYLOAD_BYTES * 2;

/// Errors from parsing an address string or wire field.
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("address must start with '{ADDRESS_PREFIX}'")]
    InvalidPrefix,
    #[error("address must be {expected} characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("address payload is not valid hexadecimal")]
    InvalidHex(#[from] hex::FromHexError),
}

/// A 20-byte account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(pub [u8; ADDRESS_PAYLOAD_BYTES]);

impl Address {
    /// Derive the address of a public key.
    pub fn from_public_key(key: &PublicKey) -> Self {
        Address(key.address_tail())
    }

    /// Encode to the human form, e.g. `LGC1f2a...`.
    pub fn encode(&self) -> String {
        let mut encoded = String::with_capacity(ADDRESS_STRING_LENGTH);
        encoded.push_str(ADDRESS_PREFIX);
        encoded.push_str(&hex::encode(self.0));
        encoded
    }

    /// Decode the human form.
    pub fn decode(text: &str) -> Result<Self, AddressError> {
        if !text.starts_with(ADDRESS_PREFIX) {
            return Err(AddressError::InvalidPrefix);
        }
        if text.len() != ADDRESS_STRING_LENGTH {
            return Err(AddressError::InvalidLength {
                expected: ADDRESS_STRING_LENGTH,
                actual: text.len(),
            });
        }
        let decoded = hex::decode(&text[ADDRESS_PREFIX.len()..])?;
        let mut payload = [0u8; ADDRESS_PAYLOAD_BYTES];
        payload.copy_from_slice(&decoded);
        Ok(Address(payload))
    }

    /// The 23-byte wire form: ASCII prefix then payload.
    pub fn to_wire(&self) -> [u8; ADDRESS_WIRE_BYTES] {
        let mut wire = [0u8; ADDRESS_WIRE_BYTES];
        wire[..3].copy_from_slice(ADDRESS_PREFIX.as_bytes());
        wire[3..].copy_from_slice(&self.0);
        wire
    }

    /// Parse the 23-byte wire form.
    pub fn from_wire(wire: &[u8; ADDRESS_WIRE_BYTES]) -> Result<Self, AddressError> {
        if &wire[..3] != ADDRESS_PREFIX.as_bytes() {
            return Err(AddressError::InvalidPrefix);
        }
        let mut payload = [0u8; ADDRESS_PAYLOAD_BYTES];
        payload.copy_from_slice(&wire[3..]);
        Ok(Address(payload))
    }
}

/// Check whether a string is a well-formed address.
pub fn is_valid_address(text: &str) -> bool {
    Address::decode(text).is_ok()
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.encode()
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::decode(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logichain_crypto::{Keypair, SignatureScheme};

    #[test]
    fn encode_decode_roundtrip() {
        let address = Address([0xAB; ADDRESS_PAYLOAD_BYTES]);
        let encoded = address.encode();
        assert!(encoded.starts_with("LGC"));
        assert_eq!(encoded.len(), ADDRESS_STRING_LENGTH);
        assert_eq!(Address::decode(&encoded).unwrap(), address);
    }

    #[test]
    fn wire_roundtrip() {
        let address = Address([0x5A; ADDRESS_PAYLOAD_BYTES]);
        let wire = address.to_wire();
        assert_eq!(&wire[..3], b"LGC");
        assert_eq!(Address::from_wire(&wire).unwrap(), address);
    }

    #[test]
    fn invalid_prefix_rejected() {
        let bad = format!("XYZ{}", "00".repeat(ADDRESS_PAYLOAD_BYTES));
        assert!(matches!(
            Address::decode(&bad),
            Err(AddressError::InvalidPrefix)
        ));
    }

    #[test]
    fn invalid_length_rejected() {
        let bad = format!("LGC{}", "00".repeat(ADDRESS_PAYLOAD_BYTES - 1));
        assert!(matches!(
            Address::decode(&bad),
            Err(AddressError::InvalidLength { .. })
        ));
    }

    #[test]
    fn invalid_hex_rejected() {
        let bad = format!("LGC{}", "zz".repeat(ADDRESS_PAYLOAD_BYTES));
        assert!(matches!(
            Address::decode(&bad),
            Err(AddressError::InvalidHex(_))
        ));
    }

    #[test]
    fn derived_from_public_key() {
        let keypair = Keypair::generate(SignatureScheme::EcdsaSecp256k1);
        let public = keypair.public_key();
        let address = Address::from_public_key(&public);
        assert_eq!(address.0, public.address_tail());
    }
}
