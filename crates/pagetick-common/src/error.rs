//! Error types for pagetick
//!
//! This module defines the common error types used throughout the system.

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for pagetick operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for pagetick
#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("invalid SWMR configuration: {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    // Open-time errors
    #[error("prerequisite not met: {0}")]
    PrerequisiteNotMet(String),

    #[error("no writer present: metadata file {} does not exist", .md_file_path.display())]
    NoWriterPresent { md_file_path: PathBuf },

    #[error("writer already present: metadata file {} exists", .md_file_path.display())]
    WriterAlreadyPresent { md_file_path: PathBuf },

    #[error("file is already open: {}", .0.display())]
    FileAlreadyOpen(PathBuf),

    // Tick errors
    #[error("file is not opened with SWMR configured")]
    NotSwmrConfigured,

    // Metadata file errors
    #[error("corrupt metadata file: {0}")]
    CorruptMetadataFile(String),

    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("file is opened read-only")]
    ReadOnly,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Create an invalid configuration error
    pub fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }

    /// Create a corrupt metadata file error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptMetadataFile(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Check if this is a retryable error
    ///
    /// A reader polling a live writer may observe a metadata file in the
    /// middle of a publish; trying again on the next tick is the remedy.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CorruptMetadataFile(_))
    }

    /// Name of the offending config field, if this is a validation error
    #[must_use]
    pub fn config_field(&self) -> Option<&'static str> {
        match self {
            Self::InvalidConfig { field, .. } => Some(field),
            _ => None,
        }
    }
}
