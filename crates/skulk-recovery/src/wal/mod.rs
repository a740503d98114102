//! Write-ahead log nodes and the replay interface used by recovery.
//!
//! Every data file has its own log node, named after the file. The engine
//! appends an entry for each insert and deletion and a flush marker whenever
//! its memtable is written to the data file. After a crash, recovery replays
//! the entries newer than the data file's flush watermark.
//!
//! ```text
//! engine write → LogNode::append → sync → memtable → (flush) → data file
//! crash        → RecoveryPerformer → LogReplaySource::entries_since → data file
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_skulk_recovery::wal::{BufferSet, LogEntry, LogNodeConfig, LogNodeManager};
//!
//! let manager = LogNodeManager::new("/path/to/wal", LogNodeConfig::default())?;
//! let node = manager.get_or_create("root.sg-1.tsfile", &mut BufferSet::default)?;
//! node.append(&LogEntry::insert(1, "root.sg.d1", 100, vec![("s1".into(), 1.0)]))?;
//! node.sync()?;
//! ```

pub mod buffer;
pub mod entry;
pub mod manager;
pub mod node;

pub use buffer::{BufferSet, DEFAULT_LOG_BUFFER_COUNT, DEFAULT_LOG_BUFFER_SIZE};
pub use entry::LogEntry;
pub use manager::LogNodeManager;
pub use node::{LogNode, LogNodeConfig, SyncMode, DEFAULT_SEGMENT_SIZE, MAX_FRAME_SIZE};

use crate::error::Result;
use std::sync::Arc;

/// Lazy, finite, one-shot sequence of log entries in log order.
pub type LogEntries<'a> = Box<dyn Iterator<Item = Result<LogEntry>> + 'a>;

/// A log that recovery can replay and discard.
pub trait LogReplaySource: Send + Sync {
    /// Logical name of the log.
    fn name(&self) -> &str;

    /// Returns the entries whose version is greater than `version`.
    ///
    /// `scratch` is used to decode frames. Iteration ends at the end of the
    /// log or at a torn final frame; any other damage is yielded as an error.
    fn entries_since<'a>(
        &'a self,
        version: u64,
        scratch: &'a mut BufferSet,
    ) -> Result<LogEntries<'a>>;

    /// Removes the log's storage and returns its staging buffers.
    fn delete(&self) -> Result<BufferSet>;
}

/// Lookup of log nodes by logical name.
pub trait LogNodeRegistry: Send + Sync {
    /// Returns the node called `name`, creating it if absent.
    ///
    /// `supplier` is invoked only when a node is created and provides its
    /// staging buffers.
    fn get_or_create_node(
        &self,
        name: &str,
        supplier: &mut dyn FnMut() -> BufferSet,
    ) -> Result<Arc<dyn LogReplaySource>>;
}
