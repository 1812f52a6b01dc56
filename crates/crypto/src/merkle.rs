//! Merkle roots over transaction hashes.
//!
//! Pairwise double-SHA-256; an odd node at any level is paired with itself.
//! The empty root is all zeroes (only the genesis block has no
//! transactions).

use crate::hashing::double_sha256;
use serde::{Deserialize, Serialize};

/// Compute the merkle root of a slice of 32-byte leaf hashes.
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return [0u8; 32];
    }

    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            next.push(hash_pair(&left, &right));
        }
        level = next;
    }
    level[0]
}

/// Inclusion proof for one leaf: sibling hashes from leaf to root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub path: Vec<[u8; 32]>,
}

/// Build an inclusion proof for the leaf at `index`.
///
/// Returns `None` when the index is out of range.
pub fn merkle_proof(leaves: &[[u8; 32]], index: usize) -> Option<MerkleProof> {
    if index >= leaves.len() {
        return None;
    }

    let mut path = Vec::new();
    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    let mut cursor = index;

    while level.len() > 1 {
        let sibling = if cursor % 2 == 0 {
            // Odd level widths duplicate the last node.
            *level.get(cursor + 1).unwrap_or(&level[cursor])
        } else {
            level[cursor - 1]
        };
        path.push(sibling);

        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            next.push(hash_pair(&left, &right));
        }
        level = next;
        cursor /= 2;
    }

    Some(MerkleProof {
        leaf_index: index,
        path,
    })
}

/// Check an inclusion proof against a known root.
pub fn verify_merkle_proof(leaf: &[u8; 32], proof: &MerkleProof, root: &[u8; 32]) -> bool {
    let mut hash = *leaf;
    let mut cursor = proof.leaf_index;
    for sibling in &proof.path {
        hash = if cursor % 2 == 0 {
            hash_pair(&hash, sibling)
        } else {
            hash_pair(sibling, &hash)
        };
        cursor /= 2;
    }
    hash == *root
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut combined = [0u8; 64];
    combined[..32].copy_from_slice(left);
    combined[32..].copy_from_slice(right);
    double_sha256(&combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u8) -> Vec<[u8; 32]> {
        (0..n).map(|i| [i; 32]).collect()
    }

    #[test]
    fn empty_root_is_zero() {
        assert_eq!(merkle_root(&[]), [0u8; 32]);
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let leaf = [7u8; 32];
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn odd_count_duplicates_last_leaf() {
        let three = leaves(3);
        let four = vec![three[0], three[1], three[2], three[2]];
        assert_eq!(merkle_root(&three), merkle_root(&four));
    }

    #[test]
    fn root_changes_with_any_leaf() {
        let original = leaves(4);
        let root = merkle_root(&original);
        for i in 0..4 {
            let mut mutated = original.clone();
            mutated[i][0] ^= 0xFF;
            assert_ne!(merkle_root(&mutated), root, "leaf {i} did not affect root");
        }
    }

    #[test]
    fn proofs_verify_for_every_leaf() {
        for count in 1u8..=9 {
            let set = leaves(count);
            let root = merkle_root(&set);
            for (i, leaf) in set.iter().enumerate() {
                let proof = merkle_proof(&set, i).unwrap();
                assert!(
                    verify_merkle_proof(leaf, &proof, &root),
                    "proof failed for leaf {i} of {count}"
                );
            }
        }
    }

    #[test]
    fn proof_rejects_wrong_leaf() {
        let set = leaves(5);
        let root = merkle_root(&set);
        let proof = merkle_proof(&set, 2).unwrap();
        assert!(!verify_merkle_proof(&[0xAA; 32], &proof, &root));
    }
}
