//! Entry fingerprinting
//!
//! A fingerprint identifies the state of a filesystem entry that matters for
//! an image layer: its type, mode, ownership, and content. Two fingerprints
//! are equal iff the entry would be archived identically (timestamps aside).
//!
//! In [`SnapshotMode::Full`] the modification time is never consulted.
//! Timestamps on some filesystems have coarse granularity or lag behind
//! buffered writes, so a file rewritten within the same tick can keep its
//! mtime while its bytes change. Hashing the bytes sidesteps that.
//! [`SnapshotMode::Time`] trades that guarantee for speed.

use crate::error::{LayerError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use super::types::{EntryKind, Fingerprint};

/// Size of the read buffer for streaming file hashing
const HASH_BUFFER_SIZE: usize = 8192;

/// How entry fingerprints are derived
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    /// Hash metadata and file content. Immune to timestamp lag.
    #[default]
    Full,
    /// Hash metadata including mtime, skipping file content. A rewrite that
    /// keeps size and mtime unchanged goes undetected.
    Time,
}

/// Computes [`Fingerprint`]s for filesystem entries
#[derive(Debug, Clone, Copy, Default)]
pub struct Fingerprinter {
    mode: SnapshotMode,
}

impl Fingerprinter {
    #[must_use]
    pub fn new(mode: SnapshotMode) -> Self {
        Self { mode }
    }

    #[must_use]
    pub fn mode(&self) -> SnapshotMode {
        self.mode
    }

    /// Fingerprint the entry at `path` without following symlinks.
    pub fn fingerprint(&self, path: &Path) -> Result<Fingerprint> {
        let metadata = fs::symlink_metadata(path).map_err(|e| LayerError::Stat {
            path: path.to_path_buf(),
            source: e,
        })?;
        let kind = EntryKind::from_file_type(metadata.file_type());

        let mut hasher = Sha256::new();
        hasher.update([kind.tag()]);
        hasher.update(metadata.mode().to_le_bytes());
        hasher.update(metadata.uid().to_le_bytes());
        hasher.update(metadata.gid().to_le_bytes());

        match self.mode {
            SnapshotMode::Full => match kind {
                EntryKind::File => {
                    hasher.update(metadata.len().to_le_bytes());
                    hash_content(path, &mut hasher)?;
                }
                EntryKind::Symlink => {
                    let target = fs::read_link(path).map_err(|e| LayerError::Fingerprint {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                    hasher.update(target.as_os_str().as_bytes());
                }
                EntryKind::CharDevice | EntryKind::BlockDevice => {
                    hasher.update(metadata.rdev().to_le_bytes());
                }
                EntryKind::Directory | EntryKind::Fifo | EntryKind::Socket => {}
            },
            SnapshotMode::Time => {
                hasher.update(metadata.len().to_le_bytes());
                hasher.update(metadata.mtime().to_le_bytes());
                hasher.update(metadata.mtime_nsec().to_le_bytes());
            }
        }

        Ok(Fingerprint::from_bytes(hasher.finalize().into()))
    }
}

/// Stream a file's bytes into the hasher
fn hash_content(path: &Path, hasher: &mut Sha256) -> Result<()> {
    let mut file = fs::File::open(path).map_err(|e| LayerError::Fingerprint {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut buffer = [0u8; HASH_BUFFER_SIZE];
    loop {
        let bytes_read = file.read(&mut buffer).map_err(|e| LayerError::Fingerprint {
            path: path.to_path_buf(),
            source: e,
        })?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(())
}
