//! Resource index: per-device time ranges of one data file.
//!
//! The index lets queries skip files whose time range cannot match. It is a
//! derived artifact: recovery always rebuilds it from the data file and the
//! log, and an index file that fails to decode is simply ignored.
//!
//! ## File Structure
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Magic "SKRI" (4) | version u16 | flushed_version u64     │
//! │  entry count u32                                          │
//! │  entries, sorted by device:                               │
//! │    device (u16 len + UTF-8) | start i64 | end i64         │
//! │  crc32 of everything above (4)                            │
//! └──────────────────────────────────────────────────────────┘
//! ```

use crate::error::{Result, TsFileError};
use crate::tsfile::format::{checked_len, le_u32, put_str, SliceReader};
use crate::tsfile::{DeviceId, TimeRange, Timestamp};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes of a resource index file: "SKRI"
pub const INDEX_MAGIC: [u8; 4] = *b"SKRI";

/// Current resource index format version.
pub const INDEX_VERSION: u16 = 1;

/// Suffix appended to a data file path to name its resource index.
pub const RESOURCE_SUFFIX: &str = ".resource";

/// Per-device `[start, end]` time ranges for one data file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceIndex {
    ranges: BTreeMap<DeviceId, TimeRange>,
    flushed_version: u64,
}

impl ResourceIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index path belonging to a data file.
    pub fn resource_path(data_file: &Path) -> PathBuf {
        let mut name = data_file.as_os_str().to_owned();
        name.push(RESOURCE_SUFFIX);
        PathBuf::from(name)
    }

    /// Records that `device` has a point at `ts`.
    ///
    /// Creates the entry `(ts, ts)` for an unseen device, otherwise widens
    /// the existing range.
    pub fn record_point(&mut self, device: &str, ts: Timestamp) {
        match self.ranges.get_mut(device) {
            Some(range) => range.widen(ts),
            None => {
                self.ranges.insert(device.to_string(), TimeRange::point(ts));
            }
        }
    }

    /// Returns the earliest timestamp of `device`.
    pub fn start_time(&self, device: &str) -> Option<Timestamp> {
        self.ranges.get(device).map(|r| r.start)
    }

    /// Returns the latest timestamp of `device`.
    pub fn end_time(&self, device: &str) -> Option<Timestamp> {
        self.ranges.get(device).map(|r| r.end)
    }

    /// Returns the time range of `device`.
    pub fn time_range(&self, device: &str) -> Option<TimeRange> {
        self.ranges.get(device).copied()
    }

    /// Iterates devices and their ranges in device order.
    pub fn devices(&self) -> impl Iterator<Item = (&DeviceId, &TimeRange)> {
        self.ranges.iter()
    }

    /// Number of devices in the index.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Returns true if no device has been recorded.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Removes every entry and resets the flushed version.
    pub fn clear(&mut self) {
        self.ranges.clear();
        self.flushed_version = 0;
    }

    /// Highest log version known to be contained in the data file.
    pub fn flushed_version(&self) -> u64 {
        self.flushed_version
    }

    /// Sets the flushed version.
    pub fn set_flushed_version(&mut self, version: u64) {
        self.flushed_version = version;
    }

    /// Serializes the index.
    ///
    /// # Errors
    ///
    /// Returns `TsFileError::InvalidInput` if a device name is too long to
    /// encode, or an I/O error. Nothing is written in the first case.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes()?)?;
        Ok(())
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(22 + self.ranges.len() * 32);
        bytes.extend_from_slice(&INDEX_MAGIC);
        bytes.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        bytes.extend_from_slice(&self.flushed_version.to_le_bytes());
        bytes.extend_from_slice(&checked_len::<u32>(self.ranges.len(), "device count")?.to_le_bytes());
        for (device, range) in &self.ranges {
            put_str(&mut bytes, device)?;
            bytes.extend_from_slice(&range.start.to_le_bytes());
            bytes.extend_from_slice(&range.end.to_le_bytes());
        }
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        Ok(bytes)
    }

    /// Deserializes an index written by [`ResourceIndex::write_to`].
    ///
    /// # Errors
    ///
    /// Returns an error for a short read, bad magic, unknown version,
    /// checksum mismatch, inverted range or trailing bytes.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 + 2 + 8 + 4 + 4 {
            return Err(TsFileError::Corrupted(format!(
                "resource index too short ({} bytes)",
                bytes.len()
            )));
        }

        let (content, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let mut cursor = SliceReader::new(content);
        let magic = cursor.take(4)?;
        if magic != INDEX_MAGIC {
            return Err(TsFileError::InvalidMagic([
                magic[0], magic[1], magic[2], magic[3],
            ]));
        }
        let version = cursor.u16()?;
        if version != INDEX_VERSION {
            return Err(TsFileError::UnsupportedVersion(version));
        }

        let expected = le_u32(crc_bytes);
        let actual = crc32fast::hash(content);
        if expected != actual {
            return Err(TsFileError::ChecksumMismatch { expected, actual });
        }

        let flushed_version = cursor.u64()?;
        let count = cursor.u32()? as usize;
        let mut ranges = BTreeMap::new();
        for _ in 0..count {
            let device = cursor.string()?;
            let start = cursor.i64()?;
            let end = cursor.i64()?;
            if start > end {
                return Err(TsFileError::Corrupted(format!(
                    "device {} has inverted range [{}, {}]",
                    device, start, end
                )));
            }
            ranges.insert(device, TimeRange::new(start, end));
        }
        cursor.finish("resource index")?;

        Ok(Self {
            ranges,
            flushed_version,
        })
    }

    /// Loads the index stored at `path`.
    ///
    /// Returns `None` when the file is absent or cannot be decoded; a damaged
    /// index is logged and otherwise ignored.
    pub fn load(path: &Path) -> Option<Self> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No resource index at {}", path.display());
                return None;
            }
            Err(e) => {
                warn!("Cannot open resource index {}: {:?}", path.display(), e);
                return None;
            }
        };

        match Self::read_from(&mut file) {
            Ok(index) => Some(index),
            Err(e) => {
                warn!(
                    "Ignoring corrupt resource index {}: {:?}",
                    path.display(),
                    e
                );
                None
            }
        }
    }

    /// Atomically replaces the index file at `path`.
    ///
    /// Writes a temporary file, fsyncs it, renames it over `path` and fsyncs
    /// the directory, so readers see either the old or the new index.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let bytes = self.to_bytes()?;
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, path)?;

        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            File::open(dir)?.sync_all()?;
        }

        debug!(
            "Persisted resource index {} ({} devices)",
            path.display(),
            self.ranges.len()
        );
        Ok(())
    }
}
