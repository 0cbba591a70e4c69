use kktp_crypto::hash::{blake2b_256, sha256};

use kktp_core::error::KktpError;
use kktp_core::types::MoveId;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

fn leaf_hash(leaf: &[u8]) -> [u8; 32] {
    let mut input = Vec::with_capacity(1 + leaf.len());
    input.push(LEAF_PREFIX);
    input.extend_from_slice(leaf);
    sha256(&input)
}

fn node_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut input = Vec::with_capacity(65);
    input.push(NODE_PREFIX);
    input.extend_from_slice(left);
    input.extend_from_slice(right);
    sha256(&input)
}

fn move_id(index: u64, leaf: &[u8; 32]) -> MoveId {
    let mut input = Vec::with_capacity(18 + 32);
    input.extend_from_slice(b"KKTP:MOVE:");
    input.extend_from_slice(&index.to_be_bytes());
    input.extend_from_slice(leaf);
    MoveId::from_bytes(blake2b_256(&input))
}

/// Result of one append.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleAppend {
    pub index: u64,
    pub hash: [u8; 32],
    pub move_id: MoveId,
}

/// One step of an inclusion proof: the sibling hash and whether it sits on
/// the left of the path node.
pub type ProofStep = ([u8; 32], bool);

/// Append-only leaf accumulator with lazy root recomputation.
///
/// Odd layers duplicate their last node. Leaves are hashed with a domain
/// prefix distinct from interior nodes.
#[derive(Default)]
pub struct MerkleAccumulator {
    leaf_hashes: Vec<[u8; 32]>,
    leaves: Vec<Vec<u8>>,
    cached_root: Option<[u8; 32]>,
}

impl MerkleAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash and append one canonical leaf encoding.
    pub fn add_move(&mut self, leaf: &[u8]) -> MerkleAppend {
        let hash = leaf_hash(leaf);
        let index = self.leaf_hashes.len() as u64;
        self.leaf_hashes.push(hash);
        self.leaves.push(leaf.to_vec());
        self.cached_root = None;
        MerkleAppend { index, hash, move_id: move_id(index, &hash) }
    }

    pub fn size(&self) -> usize {
        self.leaf_hashes.len()
    }

    pub fn get_leaves(&self) -> &[Vec<u8>] {
        &self.leaves
    }

    /// Current root; `None` while empty. Recomputed lazily after appends.
    pub fn get_root(&mut self) -> Option<[u8; 32]> {
        if self.leaf_hashes.is_empty() {
            return None;
        }
        if let Some(root) = self.cached_root {
            return Some(root);
        }
        let mut layer = self.leaf_hashes.clone();
        while layer.len() > 1 {
            if layer.len() % 2 == 1 {
                layer.push(*layer.last().unwrap());
            }
            layer = layer
                .chunks(2)
                .map(|pair| node_hash(&pair[0], &pair[1]))
                .collect();
        }
        self.cached_root = Some(layer[0]);
        self.cached_root
    }

    /// Inclusion proof for the leaf at `index`, leaf-to-root sibling order.
    pub fn get_proof(&self, index: u64) -> Result<Vec<ProofStep>, KktpError> {
        let n = self.leaf_hashes.len() as u64;
        if index >= n {
            return Err(KktpError::Other(format!("no leaf at index {index} (size {n})")));
        }
        let mut proof = Vec::new();
        let mut layer = self.leaf_hashes.clone();
        let mut pos = index as usize;
        while layer.len() > 1 {
            if layer.len() % 2 == 1 {
                layer.push(*layer.last().unwrap());
            }
            let sibling = pos ^ 1;
            proof.push((layer[sibling], sibling < pos));
            layer = layer
                .chunks(2)
                .map(|pair| node_hash(&pair[0], &pair[1]))
                .collect();
            pos /= 2;
        }
        Ok(proof)
    }

    pub fn reset(&mut self) {
        self.leaf_hashes.clear();
        self.leaves.clear();
        self.cached_root = None;
    }

    pub fn clear(&mut self) {
        self.reset();
    }
}

/// Auditor-side verification: recompute the path from a raw leaf encoding.
pub fn verify_proof(leaf: &[u8], proof: &[ProofStep], root: &[u8; 32]) -> bool {
    let mut acc = leaf_hash(leaf);
    for (sibling, sibling_is_left) in proof {
        acc = if *sibling_is_left {
            node_hash(sibling, &acc)
        } else {
            node_hash(&acc, sibling)
        };
    }
    acc == *root
}

/// Recompute a root from raw leaf encodings without an accumulator (auditor).
pub fn root_of_leaves(leaves: &[Vec<u8>]) -> Option<[u8; 32]> {
    if leaves.is_empty() {
        return None;
    }
    let mut layer: Vec<[u8; 32]> = leaves.iter().map(|l| leaf_hash(l)).collect();
    while layer.len() > 1 {
        if layer.len() % 2 == 1 {
            layer.push(*layer.last().unwrap());
        }
        layer = layer
            .chunks(2)
            .map(|pair| node_hash(&pair[0], &pair[1]))
            .collect();
    }
    Some(layer[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_leaf_root_is_leaf_hash() {
        let mut acc = MerkleAccumulator::new();
        let append = acc.add_move(b"leaf-1");
        assert_eq!(acc.get_root().unwrap(), append.hash);
    }

    #[test]
    fn two_leaf_root_pairs_hashes() {
        let mut acc = MerkleAccumulator::new();
        let a = acc.add_move(b"leaf-1");
        let b = acc.add_move(b"leaf-2");
        assert_eq!(acc.get_root().unwrap(), node_hash(&a.hash, &b.hash));
    }

    #[test]
    fn proof_for_index_zero_of_two() {
        let mut acc = MerkleAccumulator::new();
        acc.add_move(b"leaf-1");
        let b = acc.add_move(b"leaf-2");
        let root = acc.get_root().unwrap();
        let proof = acc.get_proof(0).unwrap();
        assert_eq!(proof, vec![(b.hash, false)]);
        assert!(verify_proof(b"leaf-1", &proof, &root));
        assert!(!verify_proof(b"leaf-x", &proof, &root));
    }

    #[test]
    fn odd_layer_duplicates_last() {
        let mut acc = MerkleAccumulator::new();
        for leaf in [b"a".as_ref(), b"b".as_ref(), b"c".as_ref()] {
            acc.add_move(leaf);
        }
        let root = acc.get_root().unwrap();
        // Manual: ((a,b),(c,c))
        let ha = leaf_hash(b"a");
        let hb = leaf_hash(b"b");
        let hc = leaf_hash(b"c");
        let expected = node_hash(&node_hash(&ha, &hb), &node_hash(&hc, &hc));
        assert_eq!(root, expected);
    }

    #[test]
    fn proofs_verify_for_all_indices() {
        let mut acc = MerkleAccumulator::new();
        let leaves: Vec<Vec<u8>> = (0..7u8).map(|i| vec![i, i + 1]).collect();
        for leaf in &leaves {
            acc.add_move(leaf);
        }
        let root = acc.get_root().unwrap();
        for (i, leaf) in leaves.iter().enumerate() {
            let proof = acc.get_proof(i as u64).unwrap();
            assert!(verify_proof(leaf, &proof, &root), "index {i}");
        }
    }

    #[test]
    fn move_ids_are_unique_and_deterministic() {
        let mut a = MerkleAccumulator::new();
        let mut b = MerkleAccumulator::new();
        let r1 = a.add_move(b"same");
        let r2 = b.add_move(b"same");
        assert_eq!(r1.move_id, r2.move_id);
        let r3 = a.add_move(b"same");
        // Same bytes at a different index get a different id.
        assert_ne!(r1.move_id, r3.move_id);
    }

    #[test]
    fn root_of_leaves_matches_accumulator() {
        let leaves: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i]).collect();
        let mut acc = MerkleAccumulator::new();
        for leaf in &leaves {
            acc.add_move(leaf);
        }
        assert_eq!(acc.get_root(), root_of_leaves(&leaves));
    }

    #[test]
    fn reset_clears_everything() {
        let mut acc = MerkleAccumulator::new();
        acc.add_move(b"x");
        acc.reset();
        assert_eq!(acc.size(), 0);
        assert!(acc.get_root().is_none());
    }
}
