//! Skulk - crash recovery of time series data files
//!
//! This crate restores a data file, its write-ahead log node and its resource
//! index to a consistent state after an unclean shutdown.
//!
//! # Components
//!
//! - [`DataFileWriter`]: restorable data file writer (scan, truncate, append, seal)
//! - [`LogNodeManager`] / [`LogNode`]: per-file write-ahead logs
//! - [`ResourceIndex`]: per-device time ranges used for pruning
//! - [`RecoveryPerformer`]: truncation, log replay and index rebuild
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_skulk_recovery::{
//!     BufferSet, LogNodeConfig, LogNodeManager, RecoveryPerformer, ResourceIndex,
//!     SimpleVersionController,
//! };
//!
//! let manager = LogNodeManager::new("/data/wal", LogNodeConfig::default())?;
//! let versions = SimpleVersionController::default();
//! let mut index = ResourceIndex::new();
//!
//! let writer = RecoveryPerformer::new("root.sg-", "/data/seq/1-1-0.tsfile", &mut index, &manager, &versions)
//!     .recover(true, || BufferSet::with_capacity(2, 16 * 1024), |_buffers| Ok(()))?;
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod recover;
pub mod resource;
pub mod tsfile;
pub mod version;
pub mod wal;

pub use error::{Result, TsFileError};
pub use recover::{BufferLease, RecoveryOptions, RecoveryPerformer, RecoveryState, ReplayBuffer};
pub use resource::ResourceIndex;
pub use tsfile::{
    Chunk, ChunkGroup, DataFileReader, DataFileWriter, DeviceId, ScanReport, TimeRange, Timestamp,
};
pub use version::{FileVersionController, SimpleVersionController, VersionController};
pub use wal::{
    BufferSet, LogEntries, LogEntry, LogNode, LogNodeConfig, LogNodeManager, LogNodeRegistry,
    LogReplaySource, SyncMode,
};
