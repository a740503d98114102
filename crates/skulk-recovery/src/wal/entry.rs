//! Log entry payloads.

use crate::error::{Result, TsFileError};
use crate::tsfile::format::{checked_len, put_str, SliceReader};
use crate::tsfile::{DeviceId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum LogEntryType {
    Insert = 1,
    Delete = 2,
    FlushMarker = 3,
}

/// A single write-ahead log entry.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    /// One row of one or more measurements of a device.
    Insert {
        /// Version issued by the version controller.
        version: u64,
        /// Target device.
        device: DeviceId,
        /// Row timestamp.
        timestamp: Timestamp,
        /// `(measurement, value)` pairs.
        values: Vec<(String, f64)>,
    },
    /// Deletion of the points of one measurement inside `[start, end]`.
    Delete {
        /// Version issued by the version controller.
        version: u64,
        /// Target device.
        device: DeviceId,
        /// Target measurement.
        measurement: String,
        /// First deleted timestamp (inclusive).
        start: Timestamp,
        /// Last deleted timestamp (inclusive).
        end: Timestamp,
    },
    /// The engine flushed its memtable into the data file at this version.
    FlushMarker {
        /// Version issued by the version controller.
        version: u64,
    },
}

impl LogEntry {
    /// Creates an insert entry.
    pub fn insert(
        version: u64,
        device: impl Into<DeviceId>,
        timestamp: Timestamp,
        values: Vec<(String, f64)>,
    ) -> Self {
        Self::Insert {
            version,
            device: device.into(),
            timestamp,
            values,
        }
    }

    /// Creates a delete entry.
    pub fn delete(
        version: u64,
        device: impl Into<DeviceId>,
        measurement: impl Into<String>,
        start: Timestamp,
        end: Timestamp,
    ) -> Self {
        Self::Delete {
            version,
            device: device.into(),
            measurement: measurement.into(),
            start,
            end,
        }
    }

    /// Returns the version of the entry.
    pub fn version(&self) -> u64 {
        match self {
            Self::Insert { version, .. }
            | Self::Delete { version, .. }
            | Self::FlushMarker { version } => *version,
        }
    }

    /// Serializes the entry payload into `buf`, replacing its contents.
    ///
    /// On error `buf` holds a partial payload and must not be written.
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.clear();
        match self {
            Self::Insert {
                version,
                device,
                timestamp,
                values,
            } => {
                buf.push(LogEntryType::Insert as u8);
                buf.extend_from_slice(&version.to_le_bytes());
                put_str(buf, device)?;
                buf.extend_from_slice(&timestamp.to_le_bytes());
                buf.extend_from_slice(&checked_len::<u16>(values.len(), "value count")?.to_le_bytes());
                for (measurement, value) in values {
                    put_str(buf, measurement)?;
                    buf.extend_from_slice(&value.to_le_bytes());
                }
            }
            Self::Delete {
                version,
                device,
                measurement,
                start,
                end,
            } => {
                buf.push(LogEntryType::Delete as u8);
                buf.extend_from_slice(&version.to_le_bytes());
                put_str(buf, device)?;
                put_str(buf, measurement)?;
                buf.extend_from_slice(&start.to_le_bytes());
                buf.extend_from_slice(&end.to_le_bytes());
            }
            Self::FlushMarker { version } => {
                buf.push(LogEntryType::FlushMarker as u8);
                buf.extend_from_slice(&version.to_le_bytes());
            }
        }
        Ok(())
    }

    /// Deserializes an entry payload.
    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = SliceReader::new(bytes);
        let entry_type = cursor.take(1)?[0];
        let version = cursor.u64()?;

        let entry = match entry_type {
            x if x == LogEntryType::Insert as u8 => {
                let device = cursor.string()?;
                let timestamp = cursor.i64()?;
                let count = cursor.u16()? as usize;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    let measurement = cursor.string()?;
                    values.push((measurement, cursor.f64()?));
                }
                Self::Insert {
                    version,
                    device,
                    timestamp,
                    values,
                }
            }
            x if x == LogEntryType::Delete as u8 => Self::Delete {
                version,
                device: cursor.string()?,
                measurement: cursor.string()?,
                start: cursor.i64()?,
                end: cursor.i64()?,
            },
            x if x == LogEntryType::FlushMarker as u8 => Self::FlushMarker { version },
            other => {
                return Err(TsFileError::Corrupted(format!(
                    "Unknown log entry type {}",
                    other
                )))
            }
        };
        cursor.finish("log entry")?;
        Ok(entry)
    }
}
