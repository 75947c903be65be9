//! Layer archive writer
//!
//! Appends filesystem entries and OCI whiteout markers to a tar stream.
//! Entry names are relative to the snapshot root, so the archive can be
//! applied on top of an image's root filesystem.

use crate::error::{LayerError, Result};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header, HeaderMode};

use super::types::EntryKind;

/// Prefix marking a deleted entry in an OCI layer
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Writes one layer's entries into a tar archive.
pub struct LayerWriter {
    builder: Builder<File>,
    root: PathBuf,
    reproducible: bool,
    /// (dev, ino) of multiply-linked files already written, by archive name
    hardlinks: HashMap<(u64, u64), PathBuf>,
}

impl LayerWriter {
    /// Start an archive on `file` for paths under `root`.
    ///
    /// In reproducible mode every entry's mtime is zeroed.
    #[must_use]
    pub fn new(file: File, root: &Path, reproducible: bool) -> Self {
        Self {
            builder: Builder::new(file),
            root: root.to_path_buf(),
            reproducible,
            hardlinks: HashMap::new(),
        }
    }

    /// Append the entry at `path` without following symlinks.
    pub fn append_path(&mut self, path: &Path) -> Result<()> {
        let name = self.archive_name(path)?;
        let metadata = fs::symlink_metadata(path).map_err(|e| LayerError::Stat {
            path: path.to_path_buf(),
            source: e,
        })?;
        let kind = EntryKind::from_file_type(metadata.file_type());

        let mut header = Header::new_gnu();
        header.set_metadata_in_mode(&metadata, HeaderMode::Complete);
        if self.reproducible {
            header.set_mtime(0);
        }

        let archive_err = |e: io::Error| LayerError::Archive {
            path: path.to_path_buf(),
            source: e,
        };

        match kind {
            EntryKind::File => {
                if metadata.nlink() > 1 {
                    let inode = (metadata.dev(), metadata.ino());
                    if let Some(target) = self.hardlinks.get(&inode) {
                        header.set_entry_type(EntryType::Link);
                        header.set_size(0);
                        return self
                            .builder
                            .append_link(&mut header, &name, target)
                            .map_err(archive_err);
                    }
                    self.hardlinks.insert(inode, name.clone());
                }
                header.set_entry_type(EntryType::Regular);
                header.set_size(metadata.len());
                let file = File::open(path).map_err(archive_err)?;
                self.builder
                    .append_data(&mut header, &name, file)
                    .map_err(archive_err)
            }
            EntryKind::Directory => {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                self.builder
                    .append_data(&mut header, &name, io::empty())
                    .map_err(archive_err)
            }
            EntryKind::Symlink => {
                let target = fs::read_link(path).map_err(archive_err)?;
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                self.builder
                    .append_link(&mut header, &name, &target)
                    .map_err(archive_err)
            }
            EntryKind::CharDevice | EntryKind::BlockDevice | EntryKind::Fifo => {
                let entry_type = match kind {
                    EntryKind::CharDevice => EntryType::Char,
                    EntryKind::BlockDevice => EntryType::Block,
                    _ => EntryType::Fifo,
                };
                header.set_entry_type(entry_type);
                header.set_size(0);
                self.builder
                    .append_data(&mut header, &name, io::empty())
                    .map_err(archive_err)
            }
            EntryKind::Socket => {
                tracing::debug!("Not archiving socket {}", path.display());
                Ok(())
            }
        }
    }

    /// Append a whiteout marker recording the deletion of `path`.
    pub fn append_whiteout(&mut self, path: &Path) -> Result<()> {
        let name = whiteout_name(&self.archive_name(path)?).ok_or_else(|| {
            LayerError::OutsideRoot(path.to_path_buf())
        })?;

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(0);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);

        self.builder
            .append_data(&mut header, &name, io::empty())
            .map_err(|e| LayerError::Archive {
                path: path.to_path_buf(),
                source: e,
            })
    }

    /// Write the end-of-archive marker and return the underlying file.
    pub fn finish(self) -> Result<File> {
        let root = self.root;
        self.builder.into_inner().map_err(|e| LayerError::Archive {
            path: root,
            source: e,
        })
    }

    /// Name of `path` inside the archive, relative to the root
    fn archive_name(&self, path: &Path) -> Result<PathBuf> {
        match path.strip_prefix(&self.root) {
            Ok(rel) if !rel.as_os_str().is_empty() => Ok(rel.to_path_buf()),
            _ => Err(LayerError::OutsideRoot(path.to_path_buf())),
        }
    }
}

/// `dir/name` becomes `dir/.wh.name`
fn whiteout_name(name: &Path) -> Option<PathBuf> {
    let base = name.file_name()?;
    let mut marker = std::ffi::OsString::from(WHITEOUT_PREFIX);
    marker.push(base);
    Some(match name.parent() {
        Some(parent) => parent.join(marker),
        None => PathBuf::from(marker),
    })
}
