//! SHA-256 digests.
//!
//! Block and transaction identifiers use double-SHA-256; everything else
//! (checkpoint hashes, coordinate cell keys, message ids) uses a single
//! round.

use sha2::{Digest, Sha256};

/// Single SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Double SHA-256 digest, used for block and transaction hashes.
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Count the leading zero bits of a digest, the proof-of-work metric.
pub fn leading_zero_bits(hash: &[u8; 32]) -> u32 {
    let mut bits = 0u32;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        // SHA-256("abc") from FIPS 180-2.
        let digest = sha256(b"abc");
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn double_sha256_is_two_rounds() {
        let once = sha256(b"logichain");
        assert_eq!(double_sha256(b"logichain"), sha256(&once));
    }

    #[test]
    fn leading_zero_bits_counts_across_bytes() {
        let mut hash = [0xFFu8; 32];
        assert_eq!(leading_zero_bits(&hash), 0);

        hash[0] = 0x00;
        hash[1] = 0x0F;
        assert_eq!(leading_zero_bits(&hash), 12);

        let zero = [0u8; 32];
        assert_eq!(leading_zero_bits(&zero), 256);
    }
}
