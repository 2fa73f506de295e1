//! Error types for the injection pipeline.
//!
//! This module covers every failure the injector can report, from Mach-O
//! parsing and load-command editing up to the pipeline stages that snapshot,
//! patch and roll back the target executable.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for injection operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Mach-O Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("unsupported Mach-O slice: {reason}")]
    UnsupportedMacho { reason: String },

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    #[error("insufficient space for new load commands (need {needed} bytes, have {available})")]
    InsufficientLoadCommandSpace { needed: usize, available: usize },

    #[error("dependency '{name}' not found in '{path}'")]
    DependencyNotFound { path: PathBuf, name: String },

    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    // ==================== Asset Errors ====================
    #[error("no assets to inject")]
    NoAssets,

    #[error("asset not found: {path}")]
    AssetNotFound { path: PathBuf },

    #[error("unsupported asset type: {path}")]
    UnsupportedAsset { path: PathBuf },

    #[error("malformed asset '{path}': {reason}")]
    AssetMalformed { path: PathBuf, reason: String },

    #[error("duplicate asset name '{name}'")]
    DuplicateAsset { name: String },

    // ==================== Pipeline Errors ====================
    #[error("target executable not found or unreadable: {path}")]
    TargetNotFound { path: PathBuf },

    #[error("failed to snapshot '{path}': {source}")]
    SnapshotFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to copy '{from}' to '{to}': {source}")]
    CopyFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to patch load commands for '{asset}': {source}")]
    PatchFailed {
        asset: String,
        #[source]
        source: Box<Error>,
    },

    #[error("trust bypass failed for '{path}': {reason}")]
    BypassFailed { path: PathBuf, reason: String },

    #[error("signature bypass tool failed on '{path}': {message}")]
    SignatureBypass { path: PathBuf, message: String },

    #[error("failed to install bundle #{index} '{path}': {source}")]
    BundleInstallFailed {
        index: usize,
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("target '{path}' may be corrupted: rollback failed ({restore}) after: {original}")]
    CorruptedTargetState {
        path: PathBuf,
        original: Box<Error>,
        restore: Box<Error>,
    },

    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("invalid receipt '{path}': {reason}")]
    Receipt { path: PathBuf, reason: String },
}

/// A specialized Result type for injection operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error kind is only raised after the snapshot point
    /// and therefore comes with a rollback attempt.
    #[inline]
    pub fn requires_rollback(&self) -> bool {
        matches!(
            self,
            Error::CopyFailed { .. }
                | Error::PatchFailed { .. }
                | Error::BypassFailed { .. }
                | Error::SignatureBypass { .. }
        )
    }

    /// Returns true if the target executable could not be restored.
    ///
    /// A package in this state will most likely refuse to launch until the
    /// alternate is restored by hand (see `Snapshot::recover`).
    #[inline]
    pub fn is_fatal_corruption(&self) -> bool {
        matches!(self, Error::CorruptedTargetState { .. })
    }

    /// Returns the error that caused a rollback, looking through wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::PatchFailed { source, .. } | Error::BundleInstallFailed { source, .. } => {
                source.root()
            }
            Error::CorruptedTargetState { original, .. } => original.root(),
            other => other,
        }
    }

    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a malformed asset error.
    #[inline]
    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::AssetMalformed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Wraps an error raised while patching a specific asset.
    #[inline]
    pub fn patch(asset: impl Into<String>, source: Error) -> Self {
        Error::PatchFailed {
            asset: asset.into(),
            source: Box::new(source),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_rollback() {
        let err = Error::patch(
            "libFoo.dylib",
            Error::InsufficientLoadCommandSpace {
                needed: 64,
                available: 8,
            },
        );
        assert!(err.requires_rollback());
        assert!(!Error::TargetNotFound {
            path: PathBuf::from("/x")
        }
        .requires_rollback());
    }

    #[test]
    fn test_root_unwraps_nested() {
        let err = Error::CorruptedTargetState {
            path: PathBuf::from("/t"),
            original: Box::new(Error::patch("libBar.dylib", Error::NoAssets)),
            restore: Box::new(Error::NoAssets),
        };
        assert!(err.is_fatal_corruption());
        assert!(matches!(err.root(), Error::NoAssets));
    }
}
