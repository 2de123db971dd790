//! Error Module
//!
//! Defines error types and result types used throughout shardfs.

use thiserror::Error;

/// Main error type for shardfs
#[derive(Error, Debug, Clone)]
pub enum FsError {
    #[error("not cached: {0}")]
    NotCached(String),

    #[error("fetch failed: {0}")]
    FetchFailed(String),

    #[error("object store error: {0}")]
    Store(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("mount error: {0}")]
    Mount(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,
}

impl FsError {
    /// Errno reported across the kernel bridge for this error.
    pub fn errno(&self) -> i32 {
        libc::EIO
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for FsError {
    fn from(err: serde_json::Error) -> Self {
        FsError::HttpError(err.to_string())
    }
}

/// Result type alias for shardfs
pub type Result<T> = std::result::Result<T, FsError>;
