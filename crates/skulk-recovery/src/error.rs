//! Error and Result types for Skulk data file recovery.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for recovery operations.
pub type Result<T> = std::result::Result<T, TsFileError>;

/// The error type for data file, log and recovery operations.
#[derive(Debug, Error)]
pub enum TsFileError {
    /// Invalid magic bytes in a header, footer or index file.
    #[error("Invalid magic bytes: got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported on-disk format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Stored checksum does not match the recomputed one.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// Structurally malformed bytes (bad length, bad UTF-8, unknown marker).
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// A value cannot be encoded, such as a name longer than its length field allows.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// The data file is sealed and cannot accept more records.
    #[error("Data file is sealed: {}", .0.display())]
    FileSealed(PathBuf),

    /// The write-ahead log node could not be opened or created.
    #[error("Log node {node} unavailable: {source}")]
    LogUnavailable {
        /// Logical name of the log node.
        node: String,
        /// Underlying cause.
        #[source]
        source: Box<TsFileError>,
    },

    /// Reading the write-ahead log failed during replay.
    #[error("Failed to read log node {node}: {source}")]
    LogRead {
        /// Logical name of the log node.
        node: String,
        /// Underlying cause.
        #[source]
        source: Box<TsFileError>,
    },

    /// A replayed log entry could not be applied to the data file.
    #[error("Failed to apply log entry at version {version}: {source}")]
    ReplayApply {
        /// Version of the entry being applied.
        version: u64,
        /// Underlying cause.
        #[source]
        source: Box<TsFileError>,
    },

    /// The rebuilt resource index could not be written.
    #[error("Failed to persist resource index {}: {source}", path.display())]
    IndexPersist {
        /// Path of the resource index file.
        path: PathBuf,
        /// Underlying cause.
        #[source]
        source: Box<TsFileError>,
    },

    /// The version controller could not persist its counter.
    #[error("Version persistence error: {0}")]
    VersionPersist(String),
}
