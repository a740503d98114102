//! A single write-ahead log node: the log of one data file.
//!
//! A node owns a directory of segment files. Entries are appended as frames
//! protected by a CRC32 checksum, and segments are rotated based on a size
//! threshold. Replay reads the segments lazily in id order.
//!
//! ## Frame Layout
//!
//! ```text
//! length u32 | crc32 of length | crc32 of payload | payload
//! ```
//!
//! The length carries its own checksum, so a damaged length is told apart
//! from a frame whose payload was cut short by a crash.

use crate::error::{Result, TsFileError};
use crate::wal::buffer::BufferSet;
use crate::wal::entry::LogEntry;
use crate::wal::{LogEntries, LogReplaySource};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Default maximum segment size (64 MB).
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024 * 1024;

/// Segment file extension.
const SEGMENT_EXTENSION: &str = "wal";

/// Segment file prefix.
const SEGMENT_PREFIX: &str = "segment";

/// Segment magic bytes.
const WAL_MAGIC: [u8; 4] = [b'S', b'W', b'A', b'L']; // "SWAL" for Skulk WAL

/// Segment format version.
const WAL_VERSION: u16 = 4;

/// Frame header size: length (4) + length crc (4) + payload crc (4).
const FRAME_HEADER_SIZE: usize = 12;

/// Largest payload a single frame may carry (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Sync mode for log durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync on every sync call (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

/// Configuration for log node behavior.
#[derive(Debug, Clone)]
pub struct LogNodeConfig {
    /// Maximum size of a single segment file.
    pub segment_size: usize,
    /// Sync mode for durability guarantees.
    pub sync_mode: SyncMode,
}

impl Default for LogNodeConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync_mode: SyncMode::default(),
        }
    }
}

impl LogNodeConfig {
    /// Creates a configuration with custom settings.
    pub fn new(segment_size: usize, sync_mode: SyncMode) -> Self {
        Self {
            segment_size,
            sync_mode,
        }
    }
}

/// Segment header.
#[derive(Debug, Clone)]
struct SegmentHeader {
    magic: [u8; 4],
    version: u16,
    segment_id: u64,
    created_at: i64,
}

impl SegmentHeader {
    const SIZE: usize = 22; // 4 + 2 + 8 + 8

    fn new(segment_id: u64) -> Self {
        Self {
            magic: WAL_MAGIC,
            version: WAL_VERSION,
            segment_id,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0),
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.segment_id.to_le_bytes())?;
        writer.write_all(&self.created_at.to_le_bytes())?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; Self::SIZE];
        reader.read_exact(&mut buf)?;

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != WAL_MAGIC {
            return Err(TsFileError::InvalidMagic(magic));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != WAL_VERSION {
            return Err(TsFileError::UnsupportedVersion(version));
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[6..14]);
        let mut created = [0u8; 8];
        created.copy_from_slice(&buf[14..22]);

        Ok(Self {
            magic,
            version,
            segment_id: u64::from_le_bytes(id),
            created_at: i64::from_le_bytes(created),
        })
    }
}

/// Segment currently open for appends.
struct SegmentWriter {
    file: BufWriter<File>,
    id: u64,
    size: usize,
}

struct NodeState {
    writer: Option<SegmentWriter>,
    next_segment_id: u64,
    /// Staging memory used to encode frames before writing them.
    staging: BufferSet,
    deleted: bool,
}

/// Write-ahead log of one data file.
pub struct LogNode {
    name: String,
    dir: PathBuf,
    config: LogNodeConfig,
    state: Mutex<NodeState>,
}

impl LogNode {
    /// Opens the node stored in `dir`, creating the directory if needed.
    ///
    /// Existing segments are kept; the first append starts a new segment
    /// after the highest existing one. A torn final frame in the newest
    /// segment is cut off first. `staging` becomes the node's encoding
    /// memory and is handed back by [`LogReplaySource::delete`].
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed, or if
    /// the newest segment is damaged anywhere but in its final frame. A
    /// damaged segment is left untouched.
    pub fn open(
        dir: impl AsRef<Path>,
        name: impl Into<String>,
        config: LogNodeConfig,
        staging: BufferSet,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let segments = Self::list_segments(&dir)?;
        if let Some((_, newest)) = segments.last() {
            Self::repair_tail(newest)?;
        }
        let next_segment_id = segments.last().map_or(0, |(id, _)| id + 1);

        Ok(Self {
            name: name.into(),
            dir,
            config,
            state: Mutex::new(NodeState {
                writer: None,
                next_segment_id,
                staging,
                deleted: false,
            }),
        })
    }

    /// Truncates the segment at `path` after its last complete frame.
    ///
    /// Appends after a restart go to a new segment, so a torn tail left in
    /// place would later read as damage in the middle of the log.
    fn repair_tail(path: &Path) -> Result<()> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < SegmentHeader::SIZE as u64 {
            warn!(
                "Removing log segment {} torn while being created",
                path.display()
            );
            fs::remove_file(path)?;
            return Ok(());
        }

        let mut reader = BufReader::new(file);
        SegmentHeader::read_from(&mut reader)?;
        let mut cursor = SegmentCursor {
            path: path.to_path_buf(),
            reader,
            pos: SegmentHeader::SIZE as u64,
            len,
            is_last: true,
        };
        let mut buf = Vec::new();
        loop {
            let frame_start = cursor.pos;
            match ReplayIter::read_frame(&mut cursor, &mut buf)? {
                Frame::Entry(_) => {}
                Frame::EndOfSegment => return Ok(()),
                Frame::Torn(reason) => {
                    warn!(
                        "Truncating log segment {} to {} bytes: {}",
                        path.display(),
                        frame_start,
                        reason
                    );
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(frame_start)?;
                    file.sync_all()?;
                    return Ok(());
                }
            }
        }
    }

    /// Returns the directory holding the segments.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns true once the node's storage has been deleted.
    pub fn is_deleted(&self) -> bool {
        self.lock().deleted
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn deleted_error(&self) -> TsFileError {
        TsFileError::IoError(io::Error::other(format!(
            "log node {} has been deleted",
            self.name
        )))
    }

    /// Generates the path for a segment file.
    fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
        dir.join(format!(
            "{}_{:016x}.{}",
            SEGMENT_PREFIX, segment_id, SEGMENT_EXTENSION
        ))
    }

    /// Parses the segment ID from a segment file path.
    fn parse_segment_id(path: &Path) -> Option<u64> {
        if path.extension()? != SEGMENT_EXTENSION {
            return None;
        }
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix(&format!("{}_", SEGMENT_PREFIX)))
            .and_then(|s| u64::from_str_radix(s, 16).ok())
    }

    /// Lists segment files sorted by id.
    fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(id) = Self::parse_segment_id(&path) {
                segments.push((id, path));
            }
        }
        segments.sort_by_key(|(id, _)| *id);
        Ok(segments)
    }

    /// Returns the number of segment files on disk.
    pub fn segment_count(&self) -> Result<usize> {
        Ok(Self::list_segments(&self.dir)?.len())
    }

    fn open_segment(&self, state: &mut NodeState) -> Result<()> {
        if let Some(mut old) = state.writer.take() {
            old.file.flush()?;
            old.file.get_ref().sync_all()?;
        }

        let segment_id = state.next_segment_id;
        let segment_path = Self::segment_path(&self.dir, segment_id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&segment_path)?;

        let mut writer = BufWriter::new(file);
        SegmentHeader::new(segment_id).write_to(&mut writer)?;

        state.writer = Some(SegmentWriter {
            file: writer,
            id: segment_id,
            size: SegmentHeader::SIZE,
        });
        state.next_segment_id = segment_id + 1;

        debug!("Opened log segment: {}", segment_path.display());
        Ok(())
    }

    /// Appends one entry.
    ///
    /// The entry is buffered; call [`LogNode::sync`] to make it durable.
    ///
    /// # Errors
    ///
    /// Returns `TsFileError::InvalidInput` for an entry that cannot be
    /// encoded or exceeds [`MAX_FRAME_SIZE`], in which case nothing is
    /// written. Otherwise returns an error if the write fails or the node
    /// has been deleted.
    pub fn append(&self, entry: &LogEntry) -> Result<()> {
        let mut state = self.lock();
        if state.deleted {
            return Err(self.deleted_error());
        }

        entry.encode_into(state.staging.primary())?;
        let payload_len = state.staging.primary().len();
        if payload_len > MAX_FRAME_SIZE {
            return Err(TsFileError::InvalidInput(format!(
                "log entry at version {} encodes to {} bytes, limit is {}",
                entry.version(),
                payload_len,
                MAX_FRAME_SIZE
            )));
        }
        let frame_size = FRAME_HEADER_SIZE + payload_len;

        let needs_segment = match &state.writer {
            None => true,
            Some(w) => {
                w.size > SegmentHeader::SIZE && w.size + frame_size > self.config.segment_size
            }
        };
        if needs_segment {
            self.open_segment(&mut state)?;
        }

        let NodeState {
            writer, staging, ..
        } = &mut *state;
        let payload = staging.primary();
        // bounded by MAX_FRAME_SIZE above
        let len = (payload.len() as u32).to_le_bytes();
        if let Some(writer) = writer.as_mut() {
            writer.file.write_all(&len)?;
            writer.file.write_all(&crc32fast::hash(&len).to_le_bytes())?;
            writer.file.write_all(&crc32fast::hash(payload).to_le_bytes())?;
            writer.file.write_all(payload)?;
            writer.size += frame_size;
        }
        Ok(())
    }

    /// Appends entries and syncs them together.
    pub fn append_batch(&self, entries: &[LogEntry]) -> Result<()> {
        for entry in entries {
            self.append(entry)?;
        }
        self.sync()
    }

    /// Flushes buffered frames and syncs them according to the sync mode.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.lock();
        let Some(writer) = state.writer.as_mut() else {
            return Ok(());
        };

        writer.file.flush()?;
        match self.config.sync_mode {
            SyncMode::Fsync => writer.file.get_ref().sync_all()?,
            SyncMode::Fdatasync => writer.file.get_ref().sync_data()?,
            SyncMode::None => {}
        }
        debug!("Synced log node {} segment {}", self.name, writer.id);
        Ok(())
    }
}

impl LogReplaySource for LogNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn entries_since<'a>(
        &'a self,
        version: u64,
        scratch: &'a mut BufferSet,
    ) -> Result<LogEntries<'a>> {
        let segments = {
            let mut state = self.lock();
            if state.deleted {
                return Err(self.deleted_error());
            }
            if let Some(writer) = state.writer.as_mut() {
                writer.file.flush()?;
            }
            Self::list_segments(&self.dir)?
        };

        debug!(
            "Replaying log node {} after version {} from {} segments",
            self.name,
            version,
            segments.len()
        );

        Ok(Box::new(ReplayIter {
            node: &self.name,
            segments: segments.into_iter().map(|(_, path)| path).collect(),
            current: None,
            buf: scratch.primary(),
            after: version,
            finished: false,
        }))
    }

    fn delete(&self) -> Result<BufferSet> {
        let mut state = self.lock();
        if state.deleted {
            return Ok(BufferSet::default());
        }

        state.writer = None;
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        state.deleted = true;

        debug!("Deleted log node {} at {}", self.name, self.dir.display());
        Ok(std::mem::take(&mut state.staging))
    }
}

impl Drop for LogNode {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|err| err.into_inner());
        if let Some(writer) = state.writer.as_mut() {
            // Best effort to flush remaining frames
            if let Err(e) = writer.file.flush() {
                warn!("Failed to flush log node {} on drop: {:?}", self.name, e);
            }
        }
    }
}

impl std::fmt::Debug for LogNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogNode")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish()
    }
}

/// Segment being read during replay.
struct SegmentCursor {
    path: PathBuf,
    reader: BufReader<File>,
    pos: u64,
    len: u64,
    is_last: bool,
}

enum Frame {
    Entry(LogEntry),
    EndOfSegment,
    /// Incomplete or damaged frame at the end of a segment.
    Torn(String),
}

/// One-shot lazy iterator over the entries of a node.
struct ReplayIter<'a> {
    node: &'a str,
    segments: VecDeque<PathBuf>,
    current: Option<SegmentCursor>,
    buf: &'a mut Vec<u8>,
    after: u64,
    finished: bool,
}

impl ReplayIter<'_> {
    /// Opens the next segment. `Ok(None)` means the log is exhausted.
    fn open_next(&mut self) -> Result<Option<SegmentCursor>> {
        let Some(path) = self.segments.pop_front() else {
            return Ok(None);
        };
        let is_last = self.segments.is_empty();

        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        if len < SegmentHeader::SIZE as u64 && is_last {
            debug!(
                "Log segment {} was torn while being created",
                path.display()
            );
            return Ok(None);
        }
        SegmentHeader::read_from(&mut reader)?;

        Ok(Some(SegmentCursor {
            path,
            reader,
            pos: SegmentHeader::SIZE as u64,
            len,
            is_last,
        }))
    }

    fn read_frame(cursor: &mut SegmentCursor, buf: &mut Vec<u8>) -> Result<Frame> {
        let remaining = cursor.len - cursor.pos;
        if remaining == 0 {
            return Ok(Frame::EndOfSegment);
        }
        if remaining < FRAME_HEADER_SIZE as u64 {
            return Ok(Frame::Torn(format!(
                "partial frame header at offset {}",
                cursor.pos
            )));
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        cursor.reader.read_exact(&mut header)?;
        let len_bytes = [header[0], header[1], header[2], header[3]];
        let frame_len = u32::from_le_bytes(len_bytes) as u64;
        let len_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let expected = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);

        if crc32fast::hash(&len_bytes) != len_crc {
            return Err(TsFileError::Corrupted(format!(
                "damaged frame length at offset {} in {}",
                cursor.pos,
                cursor.path.display()
            )));
        }
        if frame_len == 0 || frame_len > MAX_FRAME_SIZE as u64 {
            return Err(TsFileError::Corrupted(format!(
                "frame at offset {} in {} declares {} bytes",
                cursor.pos,
                cursor.path.display(),
                frame_len
            )));
        }
        if frame_len > remaining - FRAME_HEADER_SIZE as u64 {
            return Ok(Frame::Torn(format!(
                "frame at offset {} declares {} bytes, {} available",
                cursor.pos,
                frame_len,
                remaining - FRAME_HEADER_SIZE as u64
            )));
        }

        buf.clear();
        buf.resize(frame_len as usize, 0);
        cursor.reader.read_exact(buf)?;
        let frame_start = cursor.pos;
        cursor.pos += FRAME_HEADER_SIZE as u64 + frame_len;

        let actual = crc32fast::hash(buf);
        if expected != actual {
            if cursor.pos == cursor.len {
                return Ok(Frame::Torn(format!(
                    "checksum mismatch in final frame at offset {}",
                    frame_start
                )));
            }
            return Err(TsFileError::ChecksumMismatch { expected, actual });
        }

        Ok(Frame::Entry(LogEntry::from_bytes(buf)?))
    }

    fn advance(&mut self) -> Result<Option<LogEntry>> {
        loop {
            if self.current.is_none() {
                match self.open_next()? {
                    Some(cursor) => self.current = Some(cursor),
                    None => return Ok(None),
                }
            }
            let Some(cursor) = self.current.as_mut() else {
                return Ok(None);
            };

            match Self::read_frame(cursor, self.buf)? {
                Frame::Entry(entry) if entry.version() <= self.after => continue,
                Frame::Entry(entry) => return Ok(Some(entry)),
                Frame::EndOfSegment => self.current = None,
                Frame::Torn(reason) if cursor.is_last => {
                    warn!(
                        "Log node {} ends with a torn frame in {}: {}",
                        self.node,
                        cursor.path.display(),
                        reason
                    );
                    return Ok(None);
                }
                Frame::Torn(reason) => {
                    return Err(TsFileError::Corrupted(format!(
                        "{} in {}",
                        reason,
                        cursor.path.display()
                    )));
                }
            }
        }
    }
}

impl Iterator for ReplayIter<'_> {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
