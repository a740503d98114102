//! Crash recovery of a single data file.
//!
//! [`RecoveryPerformer`] brings a data file, its write-ahead log node and its
//! resource index back into agreement after an unclean shutdown:
//!
//! ```text
//! Init → Checking ──sealed, no redo──→ SealedDone ──┐
//!            └──────otherwise───────→ Replaying ───┴→ IndexRebuilt → Done
//! (any state) → Failed
//! ```
//!
//! 1. The data file is scanned; a torn tail is truncated away.
//! 2. The resource index is rebuilt from the retained chunk groups.
//! 3. Log entries newer than the file's flush watermark are replayed into a
//!    [`ReplayBuffer`] and flushed into the file at every flush marker and at
//!    the end of the log. Every written point widens the index.
//! 4. The index is atomically persisted before the file is sealed (or left
//!    open). The log node of a sealed file is deleted last.

pub mod lease;
pub mod replay;

pub use lease::BufferLease;
pub use replay::ReplayBuffer;

use crate::error::{Result, TsFileError};
use crate::resource::ResourceIndex;
use crate::tsfile::{DataFileReader, DataFileWriter};
use crate::version::VersionController;
use crate::wal::{
    BufferSet, LogEntry, LogNodeRegistry, LogReplaySource, DEFAULT_LOG_BUFFER_COUNT,
    DEFAULT_LOG_BUFFER_SIZE,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options controlling a recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOptions {
    /// Seal the file when recovery completes. Historical files are sealed;
    /// the file that was being written when the engine stopped stays open.
    pub seal_on_completion: bool,
    /// Size of each staging buffer of a newly created log node.
    pub log_buffer_size: usize,
    /// Number of staging buffers of a newly created log node.
    pub log_buffer_count: usize,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            seal_on_completion: true,
            log_buffer_size: DEFAULT_LOG_BUFFER_SIZE,
            log_buffer_count: DEFAULT_LOG_BUFFER_COUNT,
        }
    }
}

impl RecoveryOptions {
    /// Options for the file that was still being written (left unsealed).
    pub fn active_file() -> Self {
        Self {
            seal_on_completion: false,
            ..Self::default()
        }
    }
}

/// Stage of a recovery session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Nothing done yet.
    Init,
    /// Scanning the data file.
    Checking,
    /// The file was sealed and no replay was requested.
    SealedDone,
    /// Replaying the log into the data file.
    Replaying,
    /// The index has been persisted.
    IndexRebuilt,
    /// Recovery finished successfully.
    Done,
    /// Recovery failed.
    Failed,
}

/// Outcome of replaying a log node.
#[derive(Debug, Default)]
struct ReplayStats {
    entries: usize,
    max_version: u64,
}

/// Recovers one data file. Consumed by [`RecoveryPerformer::recover`].
pub struct RecoveryPerformer<'a> {
    log_prefix: String,
    data_file: PathBuf,
    index: &'a mut ResourceIndex,
    registry: &'a dyn LogNodeRegistry,
    versions: &'a dyn VersionController,
    options: RecoveryOptions,
    state: RecoveryState,
}

impl<'a> RecoveryPerformer<'a> {
    /// Creates a performer for `data_file`.
    ///
    /// The log node is looked up in `registry` under `log_prefix` followed
    /// by the file name. `index` receives the rebuilt resource index.
    pub fn new(
        log_prefix: impl Into<String>,
        data_file: impl AsRef<Path>,
        index: &'a mut ResourceIndex,
        registry: &'a dyn LogNodeRegistry,
        versions: &'a dyn VersionController,
    ) -> Self {
        Self {
            log_prefix: log_prefix.into(),
            data_file: data_file.as_ref().to_path_buf(),
            index,
            registry,
            versions,
            options: RecoveryOptions::default(),
            state: RecoveryState::Init,
        }
    }

    /// Replaces the default options.
    pub fn with_options(mut self, options: RecoveryOptions) -> Self {
        self.options = options;
        self
    }

    /// Logical name of the log node belonging to the data file.
    pub fn log_node_name(&self) -> String {
        let file_name = self
            .data_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}{}", self.log_prefix, file_name)
    }

    fn transition(&mut self, next: RecoveryState) {
        debug!(
            "Recovery of {}: {:?} -> {:?}",
            self.data_file.display(),
            self.state,
            next
        );
        self.state = next;
    }

    /// Runs the recovery.
    ///
    /// With `redo_log` set, the log node is consulted and pending entries
    /// are replayed. `acquire` is called once before the log node is looked
    /// up and `release` receives the same buffers exactly once afterwards,
    /// on success and on failure. Neither is called without `redo_log`.
    ///
    /// Returns the writer positioned for continued use, or `None` when the
    /// file holds no data.
    ///
    /// # Errors
    ///
    /// Returns `LogUnavailable`, `LogRead`, `ReplayApply`, `IndexPersist` or
    /// an I/O error. The data file is then left truncated and unsealed and
    /// the index file is not written.
    pub fn recover<A, R>(
        mut self,
        redo_log: bool,
        acquire: A,
        release: R,
    ) -> Result<Option<DataFileWriter>>
    where
        A: FnOnce() -> BufferSet,
        R: FnOnce(BufferSet) -> Result<()>,
    {
        let result = self.run(redo_log, acquire, release);
        if let Err(e) = &result {
            self.transition(RecoveryState::Failed);
            warn!("Recovery of {} failed: {}", self.data_file.display(), e);
        }
        result
    }

    fn run<A, R>(
        &mut self,
        redo_log: bool,
        acquire: A,
        release: R,
    ) -> Result<Option<DataFileWriter>>
    where
        A: FnOnce() -> BufferSet,
        R: FnOnce(BufferSet) -> Result<()>,
    {
        self.transition(RecoveryState::Checking);
        let mut writer = DataFileWriter::open_restorable(&self.data_file)?;
        let scan = writer.scan().clone();

        if let Some(corruption) = &scan.corruption {
            warn!(
                "Data file {} is damaged at offset {}: {}",
                self.data_file.display(),
                corruption.offset,
                corruption.reason
            );
        }

        let resource_path = ResourceIndex::resource_path(&self.data_file);
        if let Some(stale) = ResourceIndex::load(&resource_path) {
            debug!(
                "Discarding stored index of {} ({} devices)",
                self.data_file.display(),
                stale.len()
            );
        }
        self.index.clear();

        if scan.sealed && !redo_log {
            self.transition(RecoveryState::SealedDone);
            self.index_stored_points(&writer)?;
            return self.finish(writer, &resource_path, None, 0);
        }

        if !scan.sealed {
            if scan.discarded_bytes() > 0 {
                info!(
                    "Truncating {} from {} to {} bytes",
                    self.data_file.display(),
                    scan.file_len,
                    scan.last_valid_offset
                );
            }
            writer.truncate_to(scan.last_valid_offset)?;
        }
        self.index_stored_points(&writer)?;

        if !redo_log {
            return self.finish(writer, &resource_path, None, 0);
        }

        let mut lease = BufferLease::acquire(acquire, release);
        let node_name = self.log_node_name();
        let options = &self.options;
        let mut supplier =
            || BufferSet::with_capacity(options.log_buffer_count, options.log_buffer_size);
        let node = self
            .registry
            .get_or_create_node(&node_name, &mut supplier)
            .map_err(|e| TsFileError::LogUnavailable {
                node: node_name.clone(),
                source: Box::new(e),
            })?;

        self.transition(RecoveryState::Replaying);
        let stats = self.replay(node.as_ref(), &mut writer, scan.data_end, &mut lease)?;

        let result = self.finish(writer, &resource_path, Some(node), stats.max_version);
        if let Err(e) = lease.release() {
            warn!(
                "Failed to release scratch buffers of {}: {:?}",
                self.data_file.display(),
                e
            );
        }

        if result.is_ok() {
            info!(
                "Recovered {}: replayed {} log entries up to version {}",
                self.data_file.display(),
                stats.entries,
                stats.max_version
            );
        }
        result
    }

    /// Feeds every point stored in the data file to the index.
    fn index_stored_points(&mut self, writer: &DataFileWriter) -> Result<()> {
        let reader = DataFileReader::open(writer.path())?;
        for group in reader.chunk_groups(writer.position())? {
            let group = group?;
            for ts in group.timestamps() {
                self.index.record_point(&group.device, ts);
            }
        }
        Ok(())
    }

    /// Replays the entries newer than the file's flush watermark.
    fn replay(
        &mut self,
        node: &dyn LogReplaySource,
        writer: &mut DataFileWriter,
        data_end: u64,
        lease: &mut BufferLease<'_>,
    ) -> Result<ReplayStats> {
        let flushed = writer.flushed_version();
        let node_name = node.name().to_string();
        let log_error = |e: TsFileError| TsFileError::LogRead {
            node: node_name.clone(),
            source: Box::new(e),
        };

        let mut buffer = ReplayBuffer::new();
        let mut stats = ReplayStats::default();

        for entry in node
            .entries_since(flushed, lease.buffers_mut())
            .map_err(log_error)?
        {
            let entry = entry.map_err(log_error)?;
            let version = entry.version();
            if version <= flushed {
                continue;
            }

            if writer.is_sealed() {
                debug!(
                    "Unsealing {} to replay entries after version {}",
                    self.data_file.display(),
                    flushed
                );
                writer
                    .truncate_to(data_end)
                    .map_err(|e| apply_error(version, e))?;
            }

            match entry {
                LogEntry::Insert {
                    device,
                    timestamp,
                    values,
                    ..
                } => buffer.insert(&device, timestamp, &values),
                LogEntry::Delete {
                    device,
                    measurement,
                    start,
                    end,
                    ..
                } => {
                    buffer.delete(&device, &measurement, start, end);
                }
                LogEntry::FlushMarker { .. } => self.flush_buffer(&mut buffer, writer, version)?,
            }

            stats.entries += 1;
            stats.max_version = stats.max_version.max(version);
        }

        if stats.max_version > writer.flushed_version() && !writer.is_sealed() {
            self.flush_buffer(&mut buffer, writer, stats.max_version)?;
        }
        Ok(stats)
    }

    /// Writes the buffered points followed by a flush watermark at `version`.
    fn flush_buffer(
        &mut self,
        buffer: &mut ReplayBuffer,
        writer: &mut DataFileWriter,
        version: u64,
    ) -> Result<()> {
        let groups = buffer.drain();
        for group in &groups {
            writer
                .append_chunk_group(group)
                .map_err(|e| apply_error(version, e))?;
            for ts in group.timestamps() {
                self.index.record_point(&group.device, ts);
            }
        }
        writer
            .mark_flushed(version)
            .map_err(|e| apply_error(version, e))?;
        debug!(
            "Flushed {} replayed chunk groups into {} at version {}",
            groups.len(),
            self.data_file.display(),
            version
        );
        Ok(())
    }

    /// Persists the index, seals the file if requested and releases what
    /// recovery no longer needs.
    ///
    /// The index is written before the footer so that a failed index write
    /// leaves the file unsealed. A file without chunk groups is never sealed.
    fn finish(
        &mut self,
        mut writer: DataFileWriter,
        resource_path: &Path,
        node: Option<Arc<dyn LogReplaySource>>,
        max_version: u64,
    ) -> Result<Option<DataFileWriter>> {
        self.index.set_flushed_version(writer.flushed_version());
        self.index
            .persist(resource_path)
            .map_err(|e| TsFileError::IndexPersist {
                path: resource_path.to_path_buf(),
                source: Box::new(e),
            })?;
        self.transition(RecoveryState::IndexRebuilt);

        if self.options.seal_on_completion && !writer.is_empty() {
            writer.seal()?;
        }

        if max_version > 0 {
            self.versions.advance_to(max_version)?;
        }

        if writer.is_sealed() {
            if let Some(node) = node {
                match node.delete() {
                    Ok(staging) => debug!(
                        "Deleted log node {} ({} staging buffers)",
                        node.name(),
                        staging.len()
                    ),
                    Err(e) => warn!("Failed to delete log node {}: {:?}", node.name(), e),
                }
            }
        }

        self.transition(RecoveryState::Done);
        if writer.is_empty() {
            debug!("{} holds no data after recovery", self.data_file.display());
            writer.close()?;
            return Ok(None);
        }
        Ok(Some(writer))
    }
}

fn apply_error(version: u64, source: TsFileError) -> TsFileError {
    TsFileError::ReplayApply {
        version,
        source: Box::new(source),
    }
}

impl std::fmt::Debug for RecoveryPerformer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryPerformer")
            .field("log_prefix", &self.log_prefix)
            .field("data_file", &self.data_file)
            .field("options", &self.options)
            .field("state", &self.state)
            .finish()
    }
}
