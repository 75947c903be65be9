//! Multi-generation record of emitted paths
//!
//! The layered map remembers, one [`Layer`] per snapshot, which paths were
//! written to each layer archive and with what fingerprint, and which paths
//! were deleted via whiteouts. It is the only state that survives between
//! snapshots, and it lives for the duration of one build.

use crate::error::Result;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use super::fingerprint::Fingerprinter;
use super::merkle::{chain_roots, MerkleTree};
use super::types::Fingerprint;

/// One generation's records: paths added (with fingerprints) and paths
/// whited out.
#[derive(Debug, Clone, Default)]
pub struct Layer {
    adds: HashMap<PathBuf, Fingerprint>,
    whiteouts: HashSet<PathBuf>,
}

impl Layer {
    /// Paths added in this layer, with their fingerprints
    #[must_use]
    pub fn adds(&self) -> &HashMap<PathBuf, Fingerprint> {
        &self.adds
    }

    /// Paths deleted in this layer
    #[must_use]
    pub fn whiteouts(&self) -> &HashSet<PathBuf> {
        &self.whiteouts
    }

    /// True if the layer records neither adds nor whiteouts
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.whiteouts.is_empty()
    }

    /// Record an add, superseding a whiteout of the same path in this layer.
    pub(crate) fn insert_add(&mut self, path: PathBuf, fp: Fingerprint) {
        self.whiteouts.remove(&path);
        self.adds.insert(path, fp);
    }

    /// Record a whiteout, superseding an add of the same path in this layer.
    pub(crate) fn insert_whiteout(&mut self, path: PathBuf) -> bool {
        self.adds.remove(&path);
        self.whiteouts.insert(path)
    }

    /// What this layer says about `path`, if anything. A whiteout of an
    /// ancestor hides the path as well.
    fn lookup(&self, path: &Path) -> Option<Record> {
        if let Some(fp) = self.adds.get(path) {
            Some(Record::Added(*fp))
        } else if self.hides(path) {
            Some(Record::WhitedOut)
        } else {
            None
        }
    }

    /// True if `path` or one of its ancestors is whited out in this layer
    fn hides(&self, path: &Path) -> bool {
        !self.whiteouts.is_empty() && path.ancestors().any(|p| self.whiteouts.contains(p))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Record {
    Added(Fingerprint),
    WhitedOut,
}

/// Ordered stack of layers, oldest first.
///
/// The authoritative record for a path is the first one found scanning from
/// the newest layer to the oldest: an add shadows older adds, and a whiteout
/// hides them, and everything beneath a whited-out directory, without
/// erasing history.
#[derive(Debug, Default)]
pub struct LayeredMap {
    layers: Vec<Layer>,
    fingerprinter: Fingerprinter,
}

impl LayeredMap {
    /// Create an empty map that fingerprints entries with `fingerprinter`.
    #[must_use]
    pub fn new(fingerprinter: Fingerprinter) -> Self {
        Self {
            layers: Vec::new(),
            fingerprinter,
        }
    }

    /// Push a new empty layer. It receives every record until the next call.
    pub fn begin_layer(&mut self) {
        self.layers.push(Layer::default());
    }

    /// Derive a cache key from the entire layer stack.
    ///
    /// Paths within a layer are sorted before hashing, so the key depends only
    /// on each layer's contents and the order of layers.
    pub fn key(&self) -> Result<String> {
        let roots = self
            .layers
            .iter()
            .map(|layer| MerkleTree::from_layer(layer).map(|tree| *tree.root()))
            .collect::<Result<Vec<_>>>()?;
        Ok(chain_roots(&roots).to_string())
    }

    /// Record `path` in the current layer if it is new or its fingerprint
    /// differs from the authoritative record. Returns whether it was recorded.
    pub fn record_if_changed(&mut self, path: &Path) -> Result<bool> {
        let fp = self.fingerprinter.fingerprint(path)?;
        if self.lookup(path) == Some(Record::Added(fp)) {
            return Ok(false);
        }
        self.current_mut().insert_add(path.to_path_buf(), fp);
        Ok(true)
    }

    /// Record a whiteout for `path` in the current layer if it is live in an
    /// earlier layer and not already whited out here. Returns whether a
    /// whiteout was recorded.
    pub fn record_whiteout_if_needed(&mut self, path: &Path) -> bool {
        if !self.is_live_in_prior(path) {
            return false;
        }
        self.current_mut().insert_whiteout(path.to_path_buf())
    }

    /// Paths live across every layer before the current one.
    #[must_use]
    pub fn flattened_prior_paths(&self) -> HashSet<PathBuf> {
        let mut paths: HashSet<PathBuf> = HashSet::new();
        for layer in self.prior_layers() {
            if !layer.whiteouts.is_empty() {
                paths.retain(|path| !layer.hides(path));
            }
            paths.extend(layer.adds.keys().cloned());
        }
        paths
    }

    /// Number of layers begun so far, including the current one
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// All layers, oldest first
    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// The layer currently being built, if any has been begun
    #[must_use]
    pub fn current_layer(&self) -> Option<&Layer> {
        self.layers.last()
    }

    /// Fingerprinter used by `record_if_changed`
    #[must_use]
    pub fn fingerprinter(&self) -> &Fingerprinter {
        &self.fingerprinter
    }

    fn current_mut(&mut self) -> &mut Layer {
        if self.layers.is_empty() {
            self.begin_layer();
        }
        let last = self.layers.len() - 1;
        &mut self.layers[last]
    }

    fn prior_layers(&self) -> &[Layer] {
        match self.layers.split_last() {
            Some((_, prior)) => prior,
            None => &[],
        }
    }

    /// Authoritative record for `path`, newest layer first
    fn lookup(&self, path: &Path) -> Option<Record> {
        self.layers.iter().rev().find_map(|layer| layer.lookup(path))
    }

    fn is_live_in_prior(&self, path: &Path) -> bool {
        matches!(
            self.prior_layers()
                .iter()
                .rev()
                .find_map(|layer| layer.lookup(path)),
            Some(Record::Added(_))
        )
    }
}
