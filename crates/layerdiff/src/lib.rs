//! layerdiff - Daemonless container-image layer diffing
//!
//! This library builds OCI filesystem layers incrementally, without a
//! privileged daemon or union filesystem. After each build step it works out
//! which paths were added, modified, or deleted since the previous checkpoint
//! and writes that delta as a tar archive.
//!
//! # Overview
//!
//! A [`LayeredMap`] records, one generation per snapshot, the fingerprint of
//! every path it has emitted and a whiteout for every path it has deleted.
//! A [`Snapshotter`] walks the filesystem (or a caller-supplied list of
//! touched paths), consults the map, and writes the changed entries.
//!
//! # Example
//!
//! ```no_run
//! use layerdiff::{ExclusionConfig, ExclusionFilter, SnapshotOptions, Snapshotter};
//! use std::path::PathBuf;
//!
//! fn main() -> layerdiff::Result<()> {
//!     let options = SnapshotOptions::default();
//!     let root = PathBuf::from("/");
//!     let exclusion = ExclusionFilter::new(ExclusionConfig::from_options(&options, &root))?;
//!     let mut snapshotter = Snapshotter::new(root, &options, Box::new(exclusion))?;
//!
//!     // Record the base image.
//!     snapshotter.init()?;
//!
//!     // ... run a build step ...
//!
//!     let layer = snapshotter.snapshot_full_tree()?;
//!     println!("layer at {}", layer.archive.display());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod snapshot;

// Re-exports for convenience
pub use config::SnapshotOptions;
pub use error::{LayerError, Result};
pub use snapshot::{
    ExclusionConfig, ExclusionFilter, ExclusionPolicy, Fingerprint, Fingerprinter, LayerSnapshot,
    LayeredMap, SnapshotMode, Snapshotter,
};
