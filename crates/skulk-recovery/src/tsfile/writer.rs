//! Data file writer with a restorable open mode.
//!
//! [`DataFileWriter::create`] starts a new file. [`DataFileWriter::open_restorable`]
//! re-opens a file left behind by a crash: it scans the records, reports the
//! offset of the last structurally complete one and whether the file was
//! sealed, and then accepts [`DataFileWriter::truncate_to`] followed by further
//! appends and a final [`DataFileWriter::seal`].

use crate::error::{Result, TsFileError};
use crate::tsfile::format::{
    DeviceMeta, FileFooter, FileHeader, Record, FOOTER_PREFIX_SIZE, FOOTER_TRAILER_SIZE,
    HEADER_SIZE, TAIL_MAGIC,
};
use crate::tsfile::reader::DataFileReader;
use crate::tsfile::{ChunkGroup, DeviceId, TimeRange};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Description of damage found while scanning a data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralCorruption {
    /// Offset at which the damaged or incomplete record starts.
    pub offset: u64,
    /// Human readable reason.
    pub reason: String,
}

/// Result of scanning a data file in restorable mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Length of the file when it was opened.
    pub file_len: u64,
    /// Offset up to which the file is intact (the truncation point). For a
    /// sealed file this is the full length, footer included.
    pub last_valid_offset: u64,
    /// Offset just past the last complete record, where a footer starts.
    pub data_end: u64,
    /// True if a valid footer closes the file.
    pub sealed: bool,
    /// Highest flush watermark found in the valid part of the file.
    pub flushed_version: u64,
    /// Number of complete chunk groups found.
    pub chunk_group_count: usize,
    /// First damaged record, if the scan stopped on one.
    pub corruption: Option<StructuralCorruption>,
}

impl ScanReport {
    fn fresh() -> Self {
        Self {
            file_len: HEADER_SIZE as u64,
            last_valid_offset: HEADER_SIZE as u64,
            data_end: HEADER_SIZE as u64,
            sealed: false,
            flushed_version: 0,
            chunk_group_count: 0,
            corruption: None,
        }
    }

    /// Number of bytes past the last complete record.
    pub fn discarded_bytes(&self) -> u64 {
        self.file_len.saturating_sub(self.last_valid_offset)
    }

    /// True if the file holds neither a footer nor a single complete chunk group.
    pub fn is_structurally_empty(&self) -> bool {
        !self.sealed && self.chunk_group_count == 0
    }
}

/// Per-device statistics accumulated while writing.
#[derive(Debug, Default)]
struct DeviceStats {
    devices: BTreeMap<DeviceId, DeviceMeta>,
    chunk_groups: usize,
}

impl DeviceStats {
    fn record(&mut self, group: &ChunkGroup) {
        self.chunk_groups += 1;
        let Some(range) = group.time_range() else {
            return;
        };
        self.devices
            .entry(group.device.clone())
            .and_modify(|meta| {
                meta.range.merge(&range);
                meta.chunk_group_count += 1;
            })
            .or_insert_with(|| DeviceMeta {
                device: group.device.clone(),
                range,
                chunk_group_count: 1,
            });
    }
}

/// Writer for a single data file.
pub struct DataFileWriter {
    /// Path to the data file.
    path: PathBuf,
    /// Buffered writer; `None` once closed.
    writer: Option<BufWriter<File>>,
    /// Current logical end of the file.
    position: u64,
    /// True once the footer has been written (or found).
    sealed: bool,
    /// Bytes past the last valid record remain and must be truncated first.
    dirty_tail: bool,
    /// The header is missing or damaged and must be rewritten before appending.
    needs_header: bool,
    /// Highest flush watermark written or found.
    flushed_version: u64,
    stats: DeviceStats,
    scan: ScanReport,
}

impl DataFileWriter {
    /// Creates a new data file, replacing any existing file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        FileHeader::default().write_to(&mut writer)?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(writer),
            position: HEADER_SIZE as u64,
            sealed: false,
            dirty_tail: false,
            needs_header: false,
            flushed_version: 0,
            stats: DeviceStats::default(),
            scan: ScanReport::fresh(),
        })
    }

    /// Opens an existing (possibly crashed) data file in restorable mode.
    ///
    /// The file is scanned but not modified. The result of the scan is
    /// available from [`DataFileWriter::scan`]. A missing file is created
    /// empty.
    ///
    /// # Errors
    ///
    /// Returns an error only for I/O failures; damaged content is reported
    /// through the scan instead.
    pub fn open_restorable(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let file_len = file.metadata()?.len();

        let mut report = ScanReport {
            file_len,
            last_valid_offset: 0,
            data_end: 0,
            sealed: false,
            flushed_version: 0,
            chunk_group_count: 0,
            corruption: None,
        };
        let mut stats = DeviceStats::default();
        let mut needs_header = false;

        match Self::check_header(&mut file, file_len) {
            Err(reason) => {
                needs_header = true;
                if file_len > 0 {
                    report.corruption = Some(StructuralCorruption { offset: 0, reason });
                }
            }
            Ok(()) => {
                let footer = Self::find_footer(&mut file, file_len)?;
                let limit = footer.as_ref().map_or(file_len, |f| f.data_end);

                let reader = DataFileReader::open(path)?;
                let mut records = reader.records(limit)?;
                let mut failure = None;
                for record in records.by_ref() {
                    match record {
                        Ok((_, Record::ChunkGroup(group))) => {
                            stats.record(&group);
                            report.chunk_group_count += 1;
                        }
                        Ok((_, Record::Version(version))) => {
                            report.flushed_version = report.flushed_version.max(version);
                        }
                        Err(e) => failure = Some(e.to_string()),
                    }
                }
                report.data_end = records.offset();
                report.last_valid_offset = records.offset();
                report.corruption = failure.map(|reason| StructuralCorruption {
                    offset: records.offset(),
                    reason,
                });

                match footer {
                    Some(footer) if report.corruption.is_none() && records.offset() == limit => {
                        report.sealed = true;
                        report.last_valid_offset = file_len;
                        report.flushed_version = report.flushed_version.max(footer.flushed_version);
                    }
                    Some(_) => {
                        warn!(
                            "Footer of {} is intact but records before it are not, treating file as unsealed",
                            path.display()
                        );
                    }
                    None => {
                        if let Some(at) = records.footer_at() {
                            debug!(
                                "Incomplete footer at offset {} in {}",
                                at,
                                path.display()
                            );
                        }
                    }
                }
            }
        }

        let mut writer = BufWriter::new(file);
        let position = report.last_valid_offset.max(file_len);
        writer.seek(SeekFrom::Start(position))?;

        debug!(
            "Scanned {}: len={}, valid={}, data_end={}, sealed={}, groups={}, flushed_version={}",
            path.display(),
            report.file_len,
            report.last_valid_offset,
            report.data_end,
            report.sealed,
            report.chunk_group_count,
            report.flushed_version
        );

        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(writer),
            position,
            sealed: report.sealed,
            dirty_tail: !report.sealed && report.last_valid_offset < file_len,
            needs_header,
            flushed_version: report.flushed_version,
            stats,
            scan: report,
        })
    }

    fn check_header(file: &mut File, file_len: u64) -> std::result::Result<(), String> {
        if file_len < HEADER_SIZE as u64 {
            return Err(format!("file shorter than header ({} bytes)", file_len));
        }
        file.seek(SeekFrom::Start(0)).map_err(|e| e.to_string())?;
        FileHeader::read_from(file)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    /// Looks for a complete footer at the end of the file.
    fn find_footer(file: &mut File, file_len: u64) -> Result<Option<FileFooter>> {
        let min_len = (HEADER_SIZE + FOOTER_PREFIX_SIZE + FOOTER_TRAILER_SIZE) as u64;
        if file_len < min_len {
            return Ok(None);
        }

        let mut tail = [0u8; 8];
        file.seek(SeekFrom::End(-8))?;
        file.read_exact(&mut tail)?;
        if tail[4..8] != TAIL_MAGIC {
            return Ok(None);
        }

        let body_len = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]) as u64;
        let total = FileFooter::total_size(body_len as usize) as u64;
        if total > file_len - HEADER_SIZE as u64 {
            return Ok(None);
        }

        let footer_start = file_len - total;
        let mut bytes = vec![0u8; total as usize];
        file.seek(SeekFrom::Start(footer_start))?;
        file.read_exact(&mut bytes)?;

        match FileFooter::from_bytes(&bytes) {
            Ok(footer) if footer.data_end == footer_start => Ok(Some(footer)),
            Ok(footer) => {
                warn!(
                    "Footer data_end {} does not match footer offset {}",
                    footer.data_end, footer_start
                );
                Ok(None)
            }
            Err(e) => {
                debug!("Ignoring damaged footer: {:?}", e);
                Ok(None)
            }
        }
    }

    /// Returns the report produced when the file was opened.
    pub fn scan(&self) -> &ScanReport {
        &self.scan
    }

    /// Returns the path of the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current logical end of the file.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns true if the file carries a footer.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Returns the highest flush watermark written or found.
    pub fn flushed_version(&self) -> u64 {
        self.flushed_version
    }

    /// Returns the number of complete chunk groups in the file.
    pub fn chunk_group_count(&self) -> usize {
        self.stats.chunk_groups
    }

    /// Returns true if the file holds no chunk groups.
    pub fn is_empty(&self) -> bool {
        self.stats.chunk_groups == 0
    }

    /// Returns the time range covered by each device, sorted by device.
    pub fn device_ranges(&self) -> impl Iterator<Item = (&DeviceId, TimeRange)> {
        self.stats
            .devices
            .iter()
            .map(|(device, meta)| (device, meta.range))
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        let path = &self.path;
        self.writer.as_mut().ok_or_else(|| {
            TsFileError::IoError(std::io::Error::other(format!(
                "data file {} is closed",
                path.display()
            )))
        })
    }

    /// Discards every byte after `offset`.
    ///
    /// Afterwards the file is unsealed and ready for appends. Calling this
    /// with the current length is a no-op. The writer's state only changes
    /// once the underlying truncation has succeeded. An offset inside the
    /// header resets the file to an empty one.
    ///
    /// # Errors
    ///
    /// Returns an error if `offset` lies beyond the end of the file or if
    /// the truncation fails.
    pub fn truncate_to(&mut self, offset: u64) -> Result<()> {
        if offset > self.position {
            return Err(TsFileError::Corrupted(format!(
                "cannot truncate {} to {}, file ends at {}",
                self.path.display(),
                offset,
                self.position
            )));
        }
        if offset == self.position && !self.needs_header {
            return Ok(());
        }

        let reset = offset < HEADER_SIZE as u64 || self.needs_header;
        let target = if reset { 0 } else { offset };
        let writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().set_len(target)?;
        if reset {
            writer.seek(SeekFrom::Start(0))?;
            FileHeader::default().write_to(writer)?;
            writer.flush()?;
        } else {
            writer.seek(SeekFrom::Start(target))?;
        }
        writer.get_ref().sync_all()?;

        let new_position = if reset { HEADER_SIZE as u64 } else { target };
        debug!(
            "Truncated {} from {} to {}",
            self.path.display(),
            self.position,
            new_position
        );

        let dropped_records = new_position < self.scan.data_end.min(self.position);
        self.position = new_position;
        self.sealed = false;
        self.needs_header = false;
        self.dirty_tail = false;
        if reset {
            self.stats = DeviceStats::default();
            self.flushed_version = 0;
        } else if dropped_records {
            self.rebuild_stats()?;
        }
        Ok(())
    }

    /// Recomputes device statistics from the records below the current position.
    fn rebuild_stats(&mut self) -> Result<()> {
        let reader = DataFileReader::open(&self.path)?;
        let mut stats = DeviceStats::default();
        let mut flushed_version = 0;
        for record in reader.records(self.position)? {
            match record? {
                (_, Record::ChunkGroup(group)) => stats.record(&group),
                (_, Record::Version(version)) => flushed_version = flushed_version.max(version),
            }
        }
        self.stats = stats;
        self.flushed_version = flushed_version;
        Ok(())
    }

    fn check_appendable(&self) -> Result<()> {
        if self.sealed {
            return Err(TsFileError::FileSealed(self.path.clone()));
        }
        if self.dirty_tail || self.needs_header {
            return Err(TsFileError::Corrupted(format!(
                "{} has an unrecovered tail, truncate it before appending",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn append_record(&mut self, record: &Record) -> Result<()> {
        self.check_appendable()?;
        let bytes = record.to_bytes()?;
        self.writer()?.write_all(&bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Appends one chunk group.
    ///
    /// # Errors
    ///
    /// Returns `TsFileError::FileSealed` for a sealed file,
    /// `TsFileError::InvalidInput` for a group that cannot be encoded, or an
    /// I/O error.
    pub fn append_chunk_group(&mut self, group: &ChunkGroup) -> Result<()> {
        if group.chunks.is_empty() {
            return Ok(());
        }
        self.append_record(&Record::ChunkGroup(group.clone()))?;
        self.stats.record(group);
        Ok(())
    }

    /// Appends a flush watermark: every log entry up to `version` is in the file.
    pub fn mark_flushed(&mut self, version: u64) -> Result<()> {
        self.append_record(&Record::Version(version))?;
        self.flushed_version = self.flushed_version.max(version);
        Ok(())
    }

    /// Flushes buffered bytes to the OS and syncs them to disk.
    pub fn sync(&mut self) -> Result<()> {
        let writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Writes the footer and syncs the file. Idempotent once sealed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file has an unrecovered tail or if writing fails.
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        self.check_appendable()?;

        let footer = FileFooter {
            flushed_version: self.flushed_version,
            data_end: self.position,
            devices: self.stats.devices.values().cloned().collect(),
        };
        let bytes = footer.to_bytes()?;

        let writer = self.writer()?;
        writer.write_all(&bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        self.position += bytes.len() as u64;
        self.sealed = true;
        debug!(
            "Sealed {} at {} bytes ({} devices)",
            self.path.display(),
            self.position,
            footer.devices.len()
        );
        Ok(())
    }

    /// Alias of [`DataFileWriter::seal`].
    pub fn end_file(&mut self) -> Result<()> {
        self.seal()
    }

    /// Flushes and releases the file handle. Safe to call repeatedly.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Returns true once [`DataFileWriter::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}

impl Drop for DataFileWriter {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.flush() {
                warn!("Failed to flush data file {} on drop: {:?}", self.path.display(), e);
            }
        }
    }
}

impl std::fmt::Debug for DataFileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFileWriter")
            .field("path", &self.path)
            .field("position", &self.position)
            .field("sealed", &self.sealed)
            .field("flushed_version", &self.flushed_version)
            .field("closed", &self.writer.is_none())
            .finish()
    }
}
