//! Snapshot configuration
//!
//! Options consumed by the snapshot core. They are owned by the caller (a
//! build driver or the CLI) and injected into the `Snapshotter` at
//! construction. They can be loaded from a TOML file with a `[snapshot]`
//! table:
//!
//! ```toml
//! [snapshot]
//! scratch_dir = "/var/tmp/layerdiff"
//! mode = "full"
//! reproducible = true
//! extra_exclude_paths = ["/workspace/.cache"]
//! ```

use crate::error::{LayerError, Result};
use crate::snapshot::SnapshotMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the scratch subdirectory under the system temp dir
const DEFAULT_SCRATCH_NAME: &str = "layerdiff";

/// Root structure of a config file
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    snapshot: SnapshotOptions,
}

/// Options that control how snapshots are taken and archived
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotOptions {
    /// Directory for temporary layer archives
    pub scratch_dir: PathBuf,
    /// How file fingerprints are computed
    pub mode: SnapshotMode,
    /// Snapshot once after the final build step instead of after every step
    pub single_snapshot: bool,
    /// Sort archive entries and zero their timestamps
    pub reproducible: bool,
    /// Additional subtrees that are never walked or emitted
    pub extra_exclude_paths: Vec<PathBuf>,
    /// Filename globs that are never emitted
    pub exclude_globs: Vec<String>,
    /// Exclude every mount point listed in `/proc/self/mountinfo`
    pub detect_mounts: bool,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join(DEFAULT_SCRATCH_NAME),
            mode: SnapshotMode::default(),
            single_snapshot: false,
            reproducible: false,
            extra_exclude_paths: Vec::new(),
            exclude_globs: Vec::new(),
            detect_mounts: true,
        }
    }
}

impl SnapshotOptions {
    /// Load options from the `[snapshot]` table of a TOML file.
    ///
    /// Fields missing from the file keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| LayerError::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse options from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| LayerError::ConfigParse(format!("Failed to parse config: {}", e)))?;
        Ok(file.snapshot)
    }
}
