//! Error types for the layerdiff library

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while diffing and archiving filesystem layers
#[derive(Error, Debug)]
pub enum LayerError {
    // Filesystem errors
    #[error("Failed to stat {path}: {source}")]
    Stat {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to fingerprint {path}: {source}")]
    Fingerprint {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },

    #[error("Path is outside the snapshot root: {0}")]
    OutsideRoot(PathBuf),

    // Archive errors
    #[error("Failed to write {path} to layer archive: {source}")]
    Archive {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to prepare scratch directory {path}: {source}")]
    ScratchDir {
        path: PathBuf,
        source: std::io::Error,
    },

    // Cache key errors
    #[error("Cache key derivation failed: {0}")]
    Key(String),

    // Configuration errors
    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Configuration parse error: {0}")]
    ConfigParse(String),

    // Build step errors
    #[error("Command execution failed: {0}")]
    CommandExecution(#[source] std::io::Error),

    #[error("Build step '{step}' exited with status {code}")]
    StepFailed { step: String, code: i32 },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(std::io::Error),
}

/// Result type alias for layerdiff operations
pub type Result<T> = std::result::Result<T, LayerError>;
