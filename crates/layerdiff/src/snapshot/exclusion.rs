//! Exclusion filtering for snapshot walks
//!
//! Some paths never belong in an image layer: kernel pseudo-filesystems,
//! bind mounts owned by the build host, the snapshotter's own scratch space.
//! The [`ExclusionPolicy`] trait is the contract the snapshotter consumes;
//! [`ExclusionFilter`] implements it with path prefixes, filename globs, and
//! mount-point detection.

use crate::config::SnapshotOptions;
use crate::error::{LayerError, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::{Path, PathBuf};

/// Where the kernel lists the mounts visible to this process
const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Subtrees that never belong to an image's filesystem
const DEFAULT_EXCLUDED_PATHS: &[&str] = &["/proc", "/sys", "/dev"];

/// Decides which paths are never diffed or emitted.
pub trait ExclusionPolicy {
    /// True if `path` must not be recorded, emitted, or whited out.
    fn is_excluded(&self, path: &Path) -> bool;

    /// True if `path` roots a foreign subtree (a mount, an excluded
    /// directory) that the walk must not descend into.
    fn is_subtree_root(&self, path: &Path) -> bool;
}

/// Configuration for the exclusion filter.
#[derive(Debug, Clone, Default)]
pub struct ExclusionConfig {
    /// Absolute paths excluded together with everything beneath them. Each
    /// is also a subtree root.
    pub paths: Vec<PathBuf>,
    /// Glob patterns matched against the filename (last path component).
    /// Matching entries are excluded, but directories are still descended.
    pub exclude_globs: Vec<String>,
    /// Add every mount point other than `/` as an excluded subtree root
    pub detect_mounts: bool,
    /// Snapshot root. Subtrees at or above it are dropped, so a root that
    /// sits on a mount is still walked.
    pub root: Option<PathBuf>,
}

impl ExclusionConfig {
    /// Default excluded subtrees plus the given scratch directory
    #[must_use]
    pub fn default_paths(scratch_dir: &Path) -> Vec<PathBuf> {
        DEFAULT_EXCLUDED_PATHS
            .iter()
            .map(PathBuf::from)
            .chain(std::iter::once(scratch_dir.to_path_buf()))
            .collect()
    }

    /// Build the configuration described by snapshot options for a walk
    /// rooted at `root`.
    #[must_use]
    pub fn from_options(options: &SnapshotOptions, root: &Path) -> Self {
        let mut paths = Self::default_paths(&options.scratch_dir);
        paths.extend(options.extra_exclude_paths.iter().cloned());
        Self {
            paths,
            exclude_globs: options.exclude_globs.clone(),
            detect_mounts: options.detect_mounts,
            root: Some(root.to_path_buf()),
        }
    }
}

/// Prefix-, glob-, and mount-based [`ExclusionPolicy`].
///
/// Evaluation order:
/// 1. Excluded subtrees (configured paths and detected mounts), matched
///    component-wise so `/procfs` is not under `/proc`
/// 2. Filename globs
pub struct ExclusionFilter {
    subtrees: Vec<PathBuf>,
    exclude_globs: Option<GlobSet>,
}

impl ExclusionFilter {
    /// Create a new exclusion filter.
    ///
    /// Glob patterns in `exclude_globs` are compiled into a `GlobSet`. If
    /// `detect_mounts` is set, mount points are read from
    /// `/proc/self/mountinfo`; an unreadable mountinfo is logged and ignored.
    pub fn new(config: ExclusionConfig) -> Result<Self> {
        let mut subtrees = config.paths;

        if config.detect_mounts {
            match fs::read_to_string(MOUNTINFO_PATH) {
                Ok(content) => subtrees.extend(parse_mount_points(&content)),
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", MOUNTINFO_PATH, e);
                }
            }
        }

        if let Some(root) = &config.root {
            subtrees.retain(|subtree| {
                let contains_root = root.starts_with(subtree);
                if contains_root {
                    tracing::debug!(
                        "Not excluding {}, it contains the snapshot root",
                        subtree.display()
                    );
                }
                !contains_root
            });
        }

        subtrees.sort();
        subtrees.dedup();

        let exclude_globs = if config.exclude_globs.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in &config.exclude_globs {
                let glob = Glob::new(pattern).map_err(|e| {
                    LayerError::ConfigParse(format!("Invalid glob pattern '{}': {}", pattern, e))
                })?;
                builder.add(glob);
            }
            Some(builder.build().map_err(|e| {
                LayerError::ConfigParse(format!("Failed to build glob set: {}", e))
            })?)
        };

        Ok(Self {
            subtrees,
            exclude_globs,
        })
    }

    /// Excluded subtree roots, sorted
    #[must_use]
    pub fn subtrees(&self) -> &[PathBuf] {
        &self.subtrees
    }

    /// Check if the filename matches any glob pattern.
    fn matches_exclude_globs(&self, path: &Path) -> bool {
        if let Some(ref globs) = self.exclude_globs {
            if let Some(filename) = path.file_name() {
                return globs.is_match(filename);
            }
        }
        false
    }
}

impl ExclusionPolicy for ExclusionFilter {
    fn is_excluded(&self, path: &Path) -> bool {
        if self.subtrees.iter().any(|root| path.starts_with(root)) {
            return true;
        }
        self.matches_exclude_globs(path)
    }

    fn is_subtree_root(&self, path: &Path) -> bool {
        self.subtrees.iter().any(|root| root == path)
    }
}

/// Extract mount points other than `/` from mountinfo text.
///
/// Each line is `id parent major:minor root mount-point options ...`; the
/// mount point has spaces and other specials octal-escaped (`\040`).
fn parse_mount_points(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .filter(|mount| *mount != "/")
        .map(|mount| PathBuf::from(unescape_octal(mount)))
        .collect()
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_filter(paths: Vec<&str>, globs: Vec<&str>) -> ExclusionFilter {
        let config = ExclusionConfig {
            paths: paths.into_iter().map(PathBuf::from).collect(),
            exclude_globs: globs.into_iter().map(String::from).collect(),
            detect_mounts: false,
            root: None,
        };
        ExclusionFilter::new(config).expect("filter")
    }

    #[test]
    fn prefix_excludes_subtree() {
        let filter = make_filter(vec!["/proc", "/workspace/cache"], vec![]);
        assert!(filter.is_excluded(Path::new("/proc")));
        assert!(filter.is_excluded(Path::new("/proc/1/status")));
        assert!(filter.is_excluded(Path::new("/workspace/cache/objects/ab")));
        assert!(!filter.is_excluded(Path::new("/workspace/src/main.rs")));
    }

    #[test]
    fn prefix_matches_whole_components() {
        let filter = make_filter(vec!["/proc"], vec![]);
        assert!(!filter.is_excluded(Path::new("/procfs")));
        assert!(!filter.is_excluded(Path::new("/usr/proc")));
    }

    #[test]
    fn only_configured_paths_are_subtree_roots() {
        let filter = make_filter(vec!["/sys"], vec![]);
        assert!(filter.is_subtree_root(Path::new("/sys")));
        assert!(!filter.is_subtree_root(Path::new("/sys/kernel")));
        assert!(!filter.is_subtree_root(Path::new("/etc")));
    }

    #[test]
    fn glob_excludes_without_subtree_root() {
        let filter = make_filter(vec![], vec!["*.pyc", ".wh.*"]);
        assert!(filter.is_excluded(Path::new("/app/mod.pyc")));
        assert!(filter.is_excluded(Path::new("/app/.wh.old")));
        assert!(!filter.is_subtree_root(Path::new("/app/mod.pyc")));
        assert!(!filter.is_excluded(Path::new("/app/mod.py")));
    }

    #[test]
    fn invalid_glob_is_config_error() {
        let config = ExclusionConfig {
            exclude_globs: vec!["[unclosed".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            ExclusionFilter::new(config),
            Err(LayerError::ConfigParse(_))
        ));
    }

    #[test]
    fn empty_config_excludes_nothing() {
        let filter = make_filter(vec![], vec![]);
        assert!(!filter.is_excluded(Path::new("/proc/1")));
        assert!(!filter.is_subtree_root(Path::new("/proc")));
    }

    #[test]
    fn from_options_includes_defaults_and_scratch() {
        let options = SnapshotOptions {
            scratch_dir: PathBuf::from("/layerdiff-scratch"),
            extra_exclude_paths: vec![PathBuf::from("/workspace")],
            detect_mounts: false,
            ..Default::default()
        };
        let config = ExclusionConfig::from_options(&options, Path::new("/"));
        let filter = ExclusionFilter::new(config).expect("filter");
        for root in ["/proc", "/sys", "/dev", "/layerdiff-scratch", "/workspace"] {
            assert!(filter.is_subtree_root(Path::new(root)), "{root}");
        }
    }

    #[test]
    fn subtrees_containing_the_root_are_dropped() {
        let config = ExclusionConfig {
            paths: vec![
                PathBuf::from("/mnt"),
                PathBuf::from("/mnt/build/rootfs"),
                PathBuf::from("/mnt/build/rootfs/cache"),
            ],
            root: Some(PathBuf::from("/mnt/build/rootfs")),
            ..Default::default()
        };
        let filter = ExclusionFilter::new(config).expect("filter");
        assert_eq!(filter.subtrees(), &[PathBuf::from("/mnt/build/rootfs/cache")]);
        assert!(!filter.is_excluded(Path::new("/mnt/build/rootfs/etc/hosts")));
        assert!(filter.is_excluded(Path::new("/mnt/build/rootfs/cache/x")));
    }

    #[test]
    fn mountinfo_parsing_skips_root_and_unescapes() {
        let content = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
23 22 0:21 / /proc rw,nosuid shared:12 - proc proc rw
41 22 0:35 / /mnt/my\\040data rw,relatime shared:20 - ext4 /dev/sdb1 rw
";
        let mounts = parse_mount_points(content);
        assert_eq!(
            mounts,
            vec![PathBuf::from("/proc"), PathBuf::from("/mnt/my data")]
        );
    }

    #[test]
    fn unescape_leaves_plain_backslashes() {
        assert_eq!(unescape_octal("a\\b"), "a\\b");
        assert_eq!(unescape_octal("tail\\04"), "tail\\04");
        assert_eq!(unescape_octal("tab\\011x"), "tab\tx");
    }
}
