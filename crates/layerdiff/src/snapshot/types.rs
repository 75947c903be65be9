//! Core types for the snapshot system
//!
//! Defines entry fingerprints, entry kinds, and the result of a snapshot
//! operation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::FileType;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::str::FromStr;

/// A SHA-256 fingerprint of an entry's type, mode, ownership, and content
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Create a Fingerprint from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(FingerprintParseError::InvalidLength(s.len()));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str =
                std::str::from_utf8(chunk).map_err(|_| FingerprintParseError::InvalidHex)?;
            bytes[i] =
                u8::from_str_radix(hex_str, 16).map_err(|_| FingerprintParseError::InvalidHex)?;
        }
        Ok(Self(bytes))
    }
}

/// Error parsing a Fingerprint from a hex string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerprintParseError {
    /// Hex string was not 64 characters
    InvalidLength(usize),
    /// Hex string contained invalid characters
    InvalidHex,
}

impl fmt::Display for FingerprintParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLength(len) => {
                write!(f, "expected 64 hex characters, got {len}")
            }
            Self::InvalidHex => write!(f, "invalid hex character"),
        }
    }
}

impl std::error::Error for FingerprintParseError {}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Kind of filesystem entry, as seen without following symlinks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl EntryKind {
    /// Classify a file type from `symlink_metadata`
    #[must_use]
    pub fn from_file_type(file_type: FileType) -> Self {
        if file_type.is_dir() {
            Self::Directory
        } else if file_type.is_symlink() {
            Self::Symlink
        } else if file_type.is_char_device() {
            Self::CharDevice
        } else if file_type.is_block_device() {
            Self::BlockDevice
        } else if file_type.is_fifo() {
            Self::Fifo
        } else if file_type.is_socket() {
            Self::Socket
        } else {
            Self::File
        }
    }

    /// Single-byte tag mixed into fingerprints
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Directory => b'd',
            Self::File => b'f',
            Self::Symlink => b'l',
            Self::CharDevice => b'c',
            Self::BlockDevice => b'b',
            Self::Fifo => b'p',
            Self::Socket => b's',
        }
    }
}

/// A finished layer archive and the paths it carries.
///
/// `archive` is owned by the caller, who is responsible for consuming
/// (e.g. appending to an image) and removing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSnapshot {
    /// Location of the tar archive in the scratch directory
    pub archive: PathBuf,
    /// Paths written as regular entries, in emission order
    pub added: Vec<PathBuf>,
    /// Paths written as whiteout markers, in emission order
    pub whiteouts: Vec<PathBuf>,
}

impl LayerSnapshot {
    /// True when the layer neither adds nor deletes anything
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.whiteouts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn fingerprint_hex_roundtrip() {
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(37);
        }
        let fp = Fingerprint::from_bytes(bytes);
        let hex = fp.to_string();
        assert_eq!(hex.len(), 64);
        let parsed: Fingerprint = hex.parse().expect("should parse");
        assert_eq!(fp, parsed);
    }

    #[test]
    fn fingerprint_invalid_length() {
        assert_eq!(
            "abc".parse::<Fingerprint>(),
            Err(FingerprintParseError::InvalidLength(3))
        );
    }

    #[test]
    fn fingerprint_invalid_hex() {
        let result = "zz".repeat(32).parse::<Fingerprint>();
        assert_eq!(result, Err(FingerprintParseError::InvalidHex));
    }

    #[test]
    fn fingerprint_serializes_as_hex_string() {
        let fp = Fingerprint::from_bytes([0xab; 32]);
        let json = serde_json::to_string(&fp).expect("should serialize");
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        let parsed: Fingerprint = serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(parsed, fp);
    }

    #[test]
    fn entry_kind_classifies_filesystem_entries() {
        let dir = TempDir::new().expect("tempdir");
        let file = dir.path().join("file");
        let link = dir.path().join("link");
        fs::write(&file, b"x").expect("write file");
        std::os::unix::fs::symlink(&file, &link).expect("symlink");

        let kind = |p: &std::path::Path| {
            EntryKind::from_file_type(fs::symlink_metadata(p).expect("stat").file_type())
        };
        assert_eq!(kind(dir.path()), EntryKind::Directory);
        assert_eq!(kind(&file), EntryKind::File);
        assert_eq!(kind(&link), EntryKind::Symlink);
    }

    #[test]
    fn layer_snapshot_emptiness() {
        let mut layer = LayerSnapshot {
            archive: PathBuf::from("/tmp/layer.tar"),
            added: Vec::new(),
            whiteouts: Vec::new(),
        };
        assert!(layer.is_empty());
        layer.whiteouts.push(PathBuf::from("/gone"));
        assert!(!layer.is_empty());
    }
}
