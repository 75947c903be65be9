//! Layer snapshots: fingerprinted, multi-generation filesystem diffing
//!
//! Records what every previous layer already contains and emits, for each
//! new snapshot, a tar archive holding only what changed since, with OCI
//! whiteouts for deletions.

pub mod archive;
pub mod exclusion;
pub mod fingerprint;
pub mod layered_map;
pub mod merkle;
pub mod snapshotter;
pub mod types;

pub use archive::{LayerWriter, WHITEOUT_PREFIX};
pub use exclusion::{ExclusionConfig, ExclusionFilter, ExclusionPolicy};
pub use fingerprint::{Fingerprinter, SnapshotMode};
pub use layered_map::{Layer, LayeredMap};
pub use merkle::MerkleTree;
pub use snapshotter::Snapshotter;
pub use types::*;
