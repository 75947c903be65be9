//! Merkle roots over layer records
//!
//! Each layer is committed to by a Merkle root over its add and whiteout
//! records. The cache key of a whole layer stack chains those roots in
//! stack order, so two stacks share a key only if every layer recorded the
//! same paths with the same fingerprints, in the same generation.

use crate::error::{LayerError, Result};
use sha2::{Digest, Sha256};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use super::layered_map::Layer;
use super::types::Fingerprint;

/// Domain tag for add leaves
const ADD_TAG: u8 = 0x00;
/// Domain tag for whiteout leaves
const WHITEOUT_TAG: u8 = 0x01;

/// A Merkle tree computed over one layer's records.
///
/// Add leaves are `SHA-256(0x00 || len(path) || path || fingerprint)`;
/// whiteout leaves are `SHA-256(0x01 || len(path) || path)`. Internal nodes
/// are `SHA-256(left || right)`.
///
/// Leaves are sorted by path (adds before whiteouts for the same path), so
/// the root does not depend on the order the filesystem was enumerated in.
pub struct MerkleTree {
    root: Fingerprint,
    leaf_count: usize,
}

impl MerkleTree {
    /// Build a Merkle tree from a layer's records.
    pub fn from_layer(layer: &Layer) -> Result<Self> {
        let mut leaves: Vec<(&Path, u8, [u8; 32])> = layer
            .adds()
            .iter()
            .map(|(path, fp)| (path.as_path(), ADD_TAG, compute_add_leaf(path, fp)))
            .chain(
                layer
                    .whiteouts()
                    .iter()
                    .map(|path| (path.as_path(), WHITEOUT_TAG, compute_whiteout_leaf(path))),
            )
            .collect();

        if leaves.is_empty() {
            // Well-defined empty root: SHA-256 of empty input
            let empty_root: [u8; 32] = Sha256::digest(b"").into();
            return Ok(Self {
                root: Fingerprint::from_bytes(empty_root),
                leaf_count: 0,
            });
        }

        leaves.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let mut level: Vec<[u8; 32]> = leaves.into_iter().map(|(_, _, hash)| hash).collect();
        let leaf_count = level.len();

        // Build tree bottom-up
        while level.len() > 1 {
            let mut next_level = Vec::with_capacity(level.len().saturating_add(1) / 2);
            for pair in level.chunks(2) {
                match pair {
                    [left, right] => next_level.push(compute_internal_hash(left, right)),
                    // Odd node: promote unpaired child
                    [single] => next_level.push(*single),
                    _ => {}
                }
            }
            level = next_level;
        }

        let root_bytes = level.into_iter().next().ok_or_else(|| {
            LayerError::Key("Merkle tree construction produced no root".to_string())
        })?;

        Ok(Self {
            root: Fingerprint::from_bytes(root_bytes),
            leaf_count,
        })
    }

    /// Get the Merkle root hash.
    #[must_use]
    pub fn root(&self) -> &Fingerprint {
        &self.root
    }

    /// Get the number of leaves (records) in the tree.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }
}

/// Chain per-layer roots, oldest first, into a single stack key.
pub fn chain_roots<'a, I>(roots: I) -> Fingerprint
where
    I: IntoIterator<Item = &'a Fingerprint>,
{
    let mut acc: [u8; 32] = Sha256::digest(b"").into();
    for root in roots {
        acc = compute_internal_hash(&acc, root.as_bytes());
    }
    Fingerprint::from_bytes(acc)
}

fn compute_add_leaf(path: &Path, fp: &Fingerprint) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([ADD_TAG]);
    update_path(&mut hasher, path);
    hasher.update(fp.as_bytes());
    hasher.finalize().into()
}

fn compute_whiteout_leaf(path: &Path) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([WHITEOUT_TAG]);
    update_path(&mut hasher, path);
    hasher.finalize().into()
}

/// Length-prefix the path so adjacent fields cannot alias
fn update_path(hasher: &mut Sha256, path: &Path) {
    let bytes = path.as_os_str().as_bytes();
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Compute an internal node hash: SHA-256(left || right)
fn compute_internal_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::from_bytes([byte; 32])
    }

    fn layer(adds: &[(&str, u8)], whiteouts: &[&str]) -> Layer {
        let mut layer = Layer::default();
        for (path, byte) in adds {
            layer.insert_add(PathBuf::from(path), fp(*byte));
        }
        for path in whiteouts {
            layer.insert_whiteout(PathBuf::from(path));
        }
        layer
    }

    #[test]
    fn empty_layer_has_deterministic_root() {
        let tree1 = MerkleTree::from_layer(&Layer::default()).expect("tree1");
        let tree2 = MerkleTree::from_layer(&Layer::default()).expect("tree2");
        assert_eq!(tree1.root(), tree2.root());
        assert_eq!(tree1.leaf_count(), 0);
    }

    #[test]
    fn single_add_root_is_leaf() {
        let tree = MerkleTree::from_layer(&layer(&[("/a/file.txt", 0x01)], &[])).expect("tree");
        assert_eq!(tree.leaf_count(), 1);
        let expected = compute_add_leaf(Path::new("/a/file.txt"), &fp(0x01));
        assert_eq!(*tree.root().as_bytes(), expected);
    }

    #[test]
    fn root_changes_when_fingerprint_changes() {
        let tree1 = MerkleTree::from_layer(&layer(&[("/a", 1), ("/b", 2)], &[])).expect("tree1");
        let tree2 = MerkleTree::from_layer(&layer(&[("/a", 1), ("/b", 0xff)], &[])).expect("tree2");
        assert_ne!(tree1.root(), tree2.root());
    }

    #[test]
    fn root_changes_when_path_changes() {
        let tree1 = MerkleTree::from_layer(&layer(&[("/a.txt", 1)], &[])).expect("tree1");
        let tree2 = MerkleTree::from_layer(&layer(&[("/b.txt", 1)], &[])).expect("tree2");
        assert_ne!(tree1.root(), tree2.root());
    }

    #[test]
    fn whiteout_and_add_of_same_path_differ() {
        let added = MerkleTree::from_layer(&layer(&[("/a", 1)], &[])).expect("added");
        let removed = MerkleTree::from_layer(&layer(&[], &["/a"])).expect("removed");
        assert_ne!(added.root(), removed.root());
    }

    #[test]
    fn deterministic_regardless_of_insertion_order() {
        let tree1 = MerkleTree::from_layer(&layer(&[("/z", 1), ("/a", 2), ("/m", 3)], &["/q"]))
            .expect("tree1");
        let tree2 = MerkleTree::from_layer(&layer(&[("/m", 3), ("/z", 1), ("/a", 2)], &["/q"]))
            .expect("tree2");
        assert_eq!(tree1.root(), tree2.root());
    }

    #[test]
    fn odd_number_of_leaves() {
        let tree =
            MerkleTree::from_layer(&layer(&[("/a", 1), ("/b", 2)], &["/c"])).expect("tree");
        assert_eq!(tree.leaf_count(), 3);
    }

    #[test]
    fn chain_depends_on_order_and_length() {
        let a = fp(1);
        let b = fp(2);
        assert_eq!(chain_roots([&a, &b]), chain_roots([&a, &b]));
        assert_ne!(chain_roots([&a, &b]), chain_roots([&b, &a]));
        assert_ne!(chain_roots([&a]), chain_roots([&a, &a]));
    }
}
