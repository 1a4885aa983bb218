//! Binary SHA-1 hash trees over piece hashes.
//!
//! Nodes are stored in a flat array: node `i` has children `2i+1` and `2i+2`,
//! the root is node 0 and the leaves start at `2^h - 1`. Unused leaves hold
//! the zero hash.

use sha1::{Digest, Sha1};

use super::TorrentError;

pub type Hash = [u8; 20];

const ZERO_HASH: Hash = [0u8; 20];

/// Complete tree built from a list of piece hashes.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    nodes: Vec<Hash>,
    height: u32,
    leaf_count: usize,
}

impl MerkleTree {
    /// Builds the tree for `piece_hashes`. An empty list yields a single
    /// zero leaf.
    pub fn build(piece_hashes: &[Hash]) -> Self {
        let leaf_count = piece_hashes.len();
        let height = leaf_count.max(1).next_power_of_two().trailing_zeros();
        let first_leaf = (1usize << height) - 1;
        let mut nodes = vec![ZERO_HASH; (1usize << (height + 1)) - 1];

        nodes[first_leaf..first_leaf + leaf_count].copy_from_slice(piece_hashes);

        for parent in (0..first_leaf).rev() {
            nodes[parent] = hash_pair(&nodes[2 * parent + 1], &nodes[2 * parent + 2]);
        }

        Self {
            nodes,
            height,
            leaf_count,
        }
    }

    pub fn root(&self) -> Hash {
        self.nodes[0]
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Tree offset of piece `index`.
    pub fn leaf_offset(&self, index: usize) -> usize {
        (1usize << self.height) - 1 + index
    }

    /// Hashes needed to prove piece `index` against the root: the leaf
    /// itself, its sibling, then one uncle per level up to the root.
    ///
    /// # Errors
    /// - `TorrentError::InvalidSiblingPath` - `index` is not a piece of this tree
    pub fn sibling_path(&self, index: usize) -> Result<Vec<(usize, Hash)>, TorrentError> {
        if index >= self.leaf_count.max(1) {
            return Err(TorrentError::InvalidSiblingPath {
                reason: format!("piece {index} out of range ({} pieces)", self.leaf_count),
            });
        }

        let mut offset = self.leaf_offset(index);
        let mut path = Vec::with_capacity(self.height as usize + 1);
        path.push((offset, self.nodes[offset]));
        while offset > 0 {
            let sibling = sibling_of(offset).unwrap_or(offset);
            path.push((sibling, self.nodes[sibling]));
            offset = (offset - 1) / 2;
        }
        Ok(path)
    }
}

/// Root of the tree over `piece_hashes`.
pub fn merkle_root(piece_hashes: &[Hash]) -> Hash {
    MerkleTree::build(piece_hashes).root()
}

/// Checks a sibling path produced by [`MerkleTree::sibling_path`].
///
/// Each step pairs the running hash with the next entry, which must sit at
/// the sibling offset; the lower offset is the left child. Accepts iff the
/// walk ends at offset 0 with a hash equal to `root`.
pub fn verify_sibling_path(root: &Hash, path: &[(usize, Hash)]) -> bool {
    let Some(&(mut offset, mut current)) = path.first() else {
        return false;
    };

    for &(sibling_offset, sibling_hash) in &path[1..] {
        if sibling_of(offset) != Some(sibling_offset) {
            return false;
        }
        current = if sibling_offset < offset {
            hash_pair(&sibling_hash, &current)
        } else {
            hash_pair(&current, &sibling_hash)
        };
        offset = (offset - 1) / 2;
    }

    offset == 0 && current == *root
}

fn sibling_of(offset: usize) -> Option<usize> {
    match offset {
        0 => None,
        o if o % 2 == 1 => o.checked_add(1),
        o => Some(o - 1),
    }
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha1::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn leaves(n: usize) -> Vec<Hash> {
        (0..n)
            .map(|i| Sha1::digest((i as u64).to_be_bytes()).into())
            .collect()
    }

    #[test]
    fn test_single_piece_root_is_leaf() {
        let hashes = leaves(1);
        let tree = MerkleTree::build(&hashes);
        assert_eq!(tree.height(), 0);
        assert_eq!(tree.root(), hashes[0]);
        let path = tree.sibling_path(0).unwrap();
        assert_eq!(path, vec![(0, hashes[0])]);
        assert!(verify_sibling_path(&tree.root(), &path));
    }

    #[test]
    fn test_three_pieces_pad_with_zero_leaf() {
        let hashes = leaves(3);
        let tree = MerkleTree::build(&hashes);
        assert_eq!(tree.height(), 2);

        let left = hash_pair(&hashes[0], &hashes[1]);
        let right = hash_pair(&hashes[2], &ZERO_HASH);
        assert_eq!(tree.root(), hash_pair(&left, &right));
    }

    #[test]
    fn test_sibling_path_shape() {
        let tree = MerkleTree::build(&leaves(4));
        let path = tree.sibling_path(2).unwrap();
        let offsets: Vec<usize> = path.iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![5, 6, 1]);
    }

    #[test]
    fn test_out_of_range_piece_rejected() {
        let tree = MerkleTree::build(&leaves(5));
        assert!(matches!(
            tree.sibling_path(5),
            Err(TorrentError::InvalidSiblingPath { .. })
        ));
    }

    #[test]
    fn test_tampered_paths_fail() {
        let tree = MerkleTree::build(&leaves(8));
        let root = tree.root();
        let path = tree.sibling_path(3).unwrap();

        let mut bad_hash = path.clone();
        bad_hash[1].1[0] ^= 0xff;
        assert!(!verify_sibling_path(&root, &bad_hash));

        let mut bad_offset = path.clone();
        bad_offset[1].0 += 2;
        assert!(!verify_sibling_path(&root, &bad_offset));

        let truncated = &path[..path.len() - 1];
        assert!(!verify_sibling_path(&root, truncated));

        assert!(!verify_sibling_path(&root, &[]));
    }

    proptest! {
        #[test]
        fn prop_every_piece_verifies(n in 1usize..300) {
            let tree = MerkleTree::build(&leaves(n));
            let root = tree.root();
            for i in 0..n {
                let path = tree.sibling_path(i).unwrap();
                prop_assert!(verify_sibling_path(&root, &path));
            }
        }
    }
}
