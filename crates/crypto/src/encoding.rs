//! Canonical field encoding.
//!
//! Every signed tuple in the system (transactions, block headers,
//! checkpoints, gossip envelopes) is serialized by concatenating its fields
//! in a fixed declared order, big-endian, with a length prefix on every
//! variable-length field. The writer and reader here are the only code
//! allowed to produce or consume those byte strings.

use crate::CryptoError;

/// Append-only canonical encoder.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i128(&mut self, value: i128) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// IEEE-754 double, encoded as its big-endian bit pattern.
    pub fn put_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_bits().to_be_bytes());
    }

    /// Fixed-width field; the length is part of the declared format.
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Variable-width field with a u32 length prefix.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    /// Unsigned LEB128, used for the block-body transaction count.
    pub fn put_varint(&mut self, mut value: u64) {
        loop {
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.buf.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

/// Cursor-based canonical decoder; every read checks remaining length.
#[derive(Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CryptoError> {
        if self.remaining() < len {
            return Err(CryptoError::TruncatedEncoding);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, CryptoError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, CryptoError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32, CryptoError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64, CryptoError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_i128(&mut self) -> Result<i128, CryptoError> {
        Ok(i128::from_be_bytes(self.take(16)?.try_into().unwrap()))
    }

    pub fn get_f64(&mut self) -> Result<f64, CryptoError> {
        Ok(f64::from_bits(u64::from_be_bytes(
            self.take(8)?.try_into().unwrap(),
        )))
    }

    pub fn get_raw(&mut self, len: usize) -> Result<&'a [u8], CryptoError> {
        self.take(len)
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N], CryptoError> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8], CryptoError> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    pub fn get_varint(&mut self) -> Result<u64, CryptoError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.get_u8()?;
            if shift >= 64 {
                return Err(CryptoError::TruncatedEncoding);
            }
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn scalar_roundtrip() {
        let mut writer = ByteWriter::new();
        writer.put_u8(7);
        writer.put_u16(0xBEEF);
        writer.put_u32(0xDEAD_BEEF);
        writer.put_u64(u64::MAX - 1);
        writer.put_i128(-1_000_000_000_000_000_000_000i128);
        writer.put_f64(-23.5503);
        writer.put_bytes(b"payload");
        let encoded = writer.into_bytes();

        let mut reader = ByteReader::new(&encoded);
        assert_eq!(reader.get_u8().unwrap(), 7);
        assert_eq!(reader.get_u16().unwrap(), 0xBEEF);
        assert_eq!(reader.get_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.get_u64().unwrap(), u64::MAX - 1);
        assert_eq!(
            reader.get_i128().unwrap(),
            -1_000_000_000_000_000_000_000i128
        );
        assert_eq!(reader.get_f64().unwrap(), -23.5503);
        assert_eq!(reader.get_bytes().unwrap(), b"payload");
        assert!(reader.is_exhausted());
    }

    #[test]
    fn truncated_read_fails() {
        let mut writer = ByteWriter::new();
        writer.put_u32(42);
        let encoded = writer.into_bytes();

        let mut reader = ByteReader::new(&encoded[..3]);
        assert!(matches!(
            reader.get_u32(),
            Err(CryptoError::TruncatedEncoding)
        ));
    }

    proptest! {
        #[test]
        fn varint_roundtrip(value in any::<u64>()) {
            let mut writer = ByteWriter::new();
            writer.put_varint(value);
            let encoded = writer.into_bytes();
            let mut reader = ByteReader::new(&encoded);
            prop_assert_eq!(reader.get_varint().unwrap(), value);
            prop_assert!(reader.is_exhausted());
        }

        #[test]
        fn bytes_roundtrip(payload in prop::collection::vec(any::<u8>(), 0..512)) {
            let mut writer = ByteWriter::new();
            writer.put_bytes(&payload);
            let encoded = writer.into_bytes();
            let mut reader = ByteReader::new(&encoded);
            prop_assert_eq!(reader.get_bytes().unwrap(), payload.as_slice());
        }
    }
}
