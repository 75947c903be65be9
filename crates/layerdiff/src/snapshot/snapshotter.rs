//! Snapshot orchestration
//!
//! Drives the layered map, exclusion policy, and archive writer to turn the
//! difference between the last recorded state and the current filesystem
//! into a layer archive. Two modes are offered: a full-tree walk, and an
//! incremental mode for callers that already know which paths were touched.

use crate::config::SnapshotOptions;
use crate::error::{LayerError, Result};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use super::archive::LayerWriter;
use super::exclusion::ExclusionPolicy;
use super::fingerprint::Fingerprinter;
use super::layered_map::LayeredMap;
use super::types::{EntryKind, LayerSnapshot};

/// Takes layer snapshots of a root directory.
///
/// Owns the layered map for the lifetime of a build. Every operation takes
/// `&mut self`, so at most one snapshot is in flight at a time.
pub struct Snapshotter {
    root: PathBuf,
    layers: LayeredMap,
    exclusion: Box<dyn ExclusionPolicy>,
    options: SnapshotOptions,
}

impl Snapshotter {
    /// Create a snapshotter rooted at `root`.
    ///
    /// Creates the scratch directory from `options` (mode 0700) so that
    /// failures surface here rather than mid-snapshot.
    pub fn new(
        root: PathBuf,
        options: &SnapshotOptions,
        exclusion: Box<dyn ExclusionPolicy>,
    ) -> Result<Self> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&options.scratch_dir)
            .map_err(|e| LayerError::ScratchDir {
                path: options.scratch_dir.clone(),
                source: e,
            })?;

        Ok(Self {
            root: clean_path(&root),
            layers: LayeredMap::new(Fingerprinter::new(options.mode)),
            exclusion,
            options: options.clone(),
        })
    }

    /// Record the existing filesystem as the base layer.
    ///
    /// Everything present is an addition and no whiteouts are possible; the
    /// archive itself is discarded.
    pub fn init(&mut self) -> Result<()> {
        let base = self.snapshot_full_tree()?;
        tracing::info!(
            "Recorded base layer with {} entries from {}",
            base.added.len(),
            self.root.display()
        );
        remove_scratch(&base.archive);
        Ok(())
    }

    /// Cache key for the current state of the layer stack
    pub fn compute_key(&self) -> Result<String> {
        self.layers.key()
    }

    /// Snapshot only the given paths, which the caller knows were touched.
    ///
    /// Parent directories that have not yet been recorded are emitted before
    /// their children. Paths that no longer exist become whiteouts if they
    /// were recorded before. Returns `None` when `files` is empty.
    pub fn snapshot_candidates(&mut self, files: &[PathBuf]) -> Result<Option<LayerSnapshot>> {
        self.layers.begin_layer();
        if files.is_empty() {
            tracing::info!("No files changed in this command, skipping snapshotting.");
            return Ok(None);
        }
        tracing::info!("Taking snapshot of files...");
        tracing::debug!("Taking snapshot of files {:?}", files);

        let mut candidates = files
            .iter()
            .map(|file| self.resolve(file))
            .collect::<Result<Vec<_>>>()?;
        if self.options.reproducible {
            candidates.sort();
        }

        let (temp, mut writer) = self.open_archive()?;
        let mut added = Vec::new();
        let mut whiteouts = Vec::new();
        let mut snapshotted: HashSet<PathBuf> = HashSet::new();
        // Ancestors that no longer exist; everything beneath them is gone too
        let mut vanished: Vec<PathBuf> = Vec::new();

        // Parents first: path ordering sorts every ancestor before its
        // descendants.
        let parents: BTreeSet<PathBuf> = candidates
            .iter()
            .flat_map(|file| parent_directories(&self.root, file))
            .collect();
        for dir in parents {
            snapshotted.insert(dir.clone());
            if self.exclusion.is_excluded(&dir) || is_under_any(&dir, &vanished) {
                continue;
            }
            if !exists(&dir)? {
                if self.layers.record_whiteout_if_needed(&dir) {
                    tracing::info!("Adding whiteout for {}", dir.display());
                    writer.append_whiteout(&dir)?;
                    whiteouts.push(dir.clone());
                }
                vanished.push(dir);
                continue;
            }
            // The parent may already be in a previous layer.
            if self.layers.record_if_changed(&dir)? {
                writer.append_path(&dir)?;
                added.push(dir);
            }
        }

        for file in candidates {
            // Already handled as a parent of another file, or listed twice
            if !snapshotted.insert(file.clone()) {
                continue;
            }
            if is_under_any(&file, &vanished) {
                tracing::debug!("Not adding {}, its parent was deleted", file.display());
                continue;
            }
            if self.exclusion.is_excluded(&file) {
                tracing::debug!("Not adding {} to layer, as it's excluded", file.display());
                continue;
            }
            if !exists(&file)? {
                if self.layers.record_whiteout_if_needed(&file) {
                    tracing::info!("Adding whiteout for {}", file.display());
                    writer.append_whiteout(&file)?;
                    whiteouts.push(file);
                }
                continue;
            }
            if self.layers.record_if_changed(&file)? {
                writer.append_path(&file)?;
                added.push(file);
            } else {
                tracing::debug!("Not adding {} to layer, as it's unchanged", file.display());
            }
        }

        let archive = persist(temp, writer)?;
        Ok(Some(LayerSnapshot {
            archive,
            added,
            whiteouts,
        }))
    }

    /// Snapshot the whole root directory.
    ///
    /// The archive holds a whiteout for every previously recorded path that
    /// has disappeared (unless its parent disappeared too) and an entry for
    /// every path that is new or changed. The archive is returned even when
    /// it is empty.
    pub fn snapshot_full_tree(&mut self) -> Result<LayerSnapshot> {
        tracing::info!("Taking snapshot of full filesystem...");

        // Fingerprints read metadata that can lag behind completed writes
        // until buffers are flushed.
        nix::unistd::sync();

        self.layers.begin_layer();
        let existing = self.layers.flattened_prior_paths();

        let walk_start = Instant::now();
        let fs_state = self.walk()?;
        tracing::debug!(
            "Walked {} entries in {:?}",
            fs_state.len(),
            walk_start.elapsed()
        );

        let (temp, mut writer) = self.open_archive()?;
        let mut added = Vec::new();
        let mut whiteouts = Vec::new();

        // First handle whiteouts
        let mut deleted: Vec<PathBuf> = existing
            .into_iter()
            .filter(|path| !fs_state.contains_key(path))
            .collect();
        if self.options.reproducible {
            deleted.sort();
        }
        for path in deleted {
            if self.exclusion.is_excluded(&path) {
                continue;
            }
            // Only add the whiteout if the directory for the file still
            // exists; otherwise the parent's removal already covers it.
            let parent_exists = path
                .parent()
                .is_some_and(|dir| dir == self.root || fs_state.contains_key(dir));
            if parent_exists && self.layers.record_whiteout_if_needed(&path) {
                tracing::info!("Adding whiteout for {}", path.display());
                writer.append_whiteout(&path)?;
                whiteouts.push(path);
            }
        }

        let tar_start = Instant::now();
        let mut paths: Vec<&PathBuf> = fs_state.keys().filter(|p| **p != self.root).collect();
        if self.options.reproducible {
            paths.sort();
        }
        for path in paths {
            // Only add to the tar if we add it to the layered map.
            if self.layers.record_if_changed(path)? {
                tracing::debug!("Adding {} to layer, because it was changed.", path.display());
                writer.append_path(path)?;
                added.push(path.clone());
            }
        }
        tracing::debug!("Wrote layer archive in {:?}", tar_start.elapsed());

        let archive = persist(temp, writer)?;
        Ok(LayerSnapshot {
            archive,
            added,
            whiteouts,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn layered_map(&self) -> &LayeredMap {
        &self.layers
    }

    #[must_use]
    pub fn options(&self) -> &SnapshotOptions {
        &self.options
    }

    /// Walk the root, skipping excluded entries and never descending into
    /// excluded subtree roots. The root itself is included so parent lookups
    /// succeed for its children.
    fn walk(&self) -> Result<HashMap<PathBuf, EntryKind>> {
        let mut fs_state = HashMap::new();
        let exclusion = &self.exclusion;

        let mut walker = WalkDir::new(&self.root).follow_links(false);
        if self.options.reproducible {
            walker = walker.sort_by_file_name();
        }
        let entries = walker.into_iter().filter_entry(|entry| {
            let path = entry.path();
            if exclusion.is_subtree_root(path) {
                tracing::info!(
                    "Skipping paths under {}, as it is an excluded directory",
                    path.display()
                );
                return false;
            }
            true
        });

        for entry in entries {
            let entry = entry.map_err(|e| LayerError::Walk {
                path: e
                    .path()
                    .map_or_else(|| self.root.clone(), Path::to_path_buf),
                source: e,
            })?;
            let path = entry.path();
            if path != self.root && exclusion.is_excluded(path) {
                continue;
            }
            fs_state.insert(
                path.to_path_buf(),
                EntryKind::from_file_type(entry.file_type()),
            );
        }

        Ok(fs_state)
    }

    /// Create a scratch file and start an archive on it.
    fn open_archive(&self) -> Result<(NamedTempFile, LayerWriter)> {
        let scratch_err = |e: io::Error| LayerError::ScratchDir {
            path: self.options.scratch_dir.clone(),
            source: e,
        };
        let temp = tempfile::Builder::new()
            .prefix("layer-")
            .suffix(".tar")
            .tempfile_in(&self.options.scratch_dir)
            .map_err(scratch_err)?;
        let file = temp.reopen().map_err(scratch_err)?;
        let writer = LayerWriter::new(file, &self.root, self.options.reproducible);
        Ok((temp, writer))
    }

    /// Make a candidate absolute under the root and lexically clean it.
    fn resolve(&self, file: &Path) -> Result<PathBuf> {
        let path = if file.is_absolute() {
            clean_path(file)
        } else {
            clean_path(&self.root.join(file))
        };
        if path == self.root || !path.starts_with(&self.root) {
            return Err(LayerError::OutsideRoot(path));
        }
        Ok(path)
    }
}

/// Finish the archive and keep the scratch file. On error the temp file is
/// dropped, which removes the partial archive.
fn persist(temp: NamedTempFile, writer: LayerWriter) -> Result<PathBuf> {
    let file = writer.finish()?;
    file.sync_all().map_err(|e| LayerError::Archive {
        path: temp.path().to_path_buf(),
        source: e,
    })?;
    let (_, path) = temp.keep().map_err(|e| LayerError::Archive {
        path: e.file.path().to_path_buf(),
        source: e.error,
    })?;
    Ok(path)
}

/// Best-effort removal of a scratch archive
fn remove_scratch(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!("Failed to remove {}: {}", path.display(), e);
    }
}

fn exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(LayerError::Stat {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Lexically normalize a path: drop `.`, resolve `..` against the preceding
/// component, never climbing above `/`.
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() && !path.is_absolute() {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    if cleaned.as_os_str().is_empty() {
        cleaned.push(".");
    }
    cleaned
}

fn is_under_any(path: &Path, dirs: &[PathBuf]) -> bool {
    dirs.iter().any(|dir| path.starts_with(dir))
}

/// Ancestors of `path` strictly between `root` and `path`
fn parent_directories(root: &Path, path: &Path) -> Vec<PathBuf> {
    path.ancestors()
        .skip(1)
        .take_while(|dir| *dir != root && dir.starts_with(root))
        .map(Path::to_path_buf)
        .collect()
}
