//! Data file model: devices, chunks, chunk groups and the on-disk container.
//!
//! A data file is an append-only sequence of records after a fixed header:
//! chunk groups (one device, one chunk per measurement), version watermarks
//! written after each flush, and, once sealed, a footer carrying per-device
//! metadata. See [`format`] for the byte layout.

pub mod format;
pub mod reader;
pub mod writer;

pub use format::{FileFooter, FileHeader, Record, DATA_FILE_EXTENSION};
pub use reader::{DataFileReader, RecordIter};
pub use writer::{DataFileWriter, ScanReport, StructuralCorruption};

/// Timestamp type (monotone integer, nanoseconds in the engine).
pub type Timestamp = i64;

/// Device identifier, e.g. `root.sg.device0`.
pub type DeviceId = String;

/// Inclusive time range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    /// First timestamp covered (inclusive).
    pub start: Timestamp,
    /// Last timestamp covered (inclusive).
    pub end: Timestamp,
}

impl TimeRange {
    /// Creates a range covering a single timestamp.
    pub fn point(ts: Timestamp) -> Self {
        Self { start: ts, end: ts }
    }

    /// Creates a range from explicit bounds.
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Returns true if `ts` lies inside the range.
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts <= self.end
    }

    /// Widens the range so that it covers `ts`.
    pub fn widen(&mut self, ts: Timestamp) {
        self.start = self.start.min(ts);
        self.end = self.end.max(ts);
    }

    /// Widens the range so that it covers `other`.
    pub fn merge(&mut self, other: &TimeRange) {
        self.widen(other.start);
        self.widen(other.end);
    }
}

/// Time-ordered values of one measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Measurement name, e.g. `sensor3`.
    pub measurement: String,
    /// `(timestamp, value)` pairs sorted by timestamp.
    pub points: Vec<(Timestamp, f64)>,
}

impl Chunk {
    /// Creates a chunk, sorting the points by timestamp.
    pub fn new(measurement: impl Into<String>, mut points: Vec<(Timestamp, f64)>) -> Self {
        points.sort_by_key(|(ts, _)| *ts);
        Self {
            measurement: measurement.into(),
            points,
        }
    }

    /// Returns the covered time range, `None` for an empty chunk.
    pub fn time_range(&self) -> Option<TimeRange> {
        let first = self.points.first()?.0;
        let last = self.points.last()?.0;
        Some(TimeRange::new(first, last))
    }
}

/// All chunks of one device written as a single unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkGroup {
    /// Device the chunks belong to.
    pub device: DeviceId,
    /// One chunk per measurement.
    pub chunks: Vec<Chunk>,
}

impl ChunkGroup {
    /// Creates a chunk group.
    pub fn new(device: impl Into<DeviceId>, chunks: Vec<Chunk>) -> Self {
        Self {
            device: device.into(),
            chunks,
        }
    }

    /// Total number of points across all chunks.
    pub fn point_count(&self) -> usize {
        self.chunks.iter().map(|c| c.points.len()).sum()
    }

    /// Iterates every timestamp stored in the group.
    pub fn timestamps(&self) -> impl Iterator<Item = Timestamp> + '_ {
        self.chunks
            .iter()
            .flat_map(|c| c.points.iter().map(|(ts, _)| *ts))
    }

    /// Returns the covered time range, `None` when the group holds no points.
    pub fn time_range(&self) -> Option<TimeRange> {
        let mut ranges = self.chunks.iter().filter_map(Chunk::time_range);
        let mut range = ranges.next()?;
        for r in ranges {
            range.merge(&r);
        }
        Some(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_widen() {
        let mut range = TimeRange::point(10);
        range.widen(5);
        range.widen(7);
        range.widen(20);
        assert_eq!(range, TimeRange::new(5, 20));
        assert!(range.contains(5));
        assert!(range.contains(20));
        assert!(!range.contains(21));
    }

    #[test]
    fn test_chunk_sorts_points() {
        let chunk = Chunk::new("s1", vec![(3, 0.3), (1, 0.1), (2, 0.2)]);
        assert_eq!(chunk.points, vec![(1, 0.1), (2, 0.2), (3, 0.3)]);
        assert_eq!(chunk.time_range(), Some(TimeRange::new(1, 3)));
    }

    #[test]
    fn test_chunk_group_time_range() {
        let group = ChunkGroup::new(
            "root.sg.d1",
            vec![
                Chunk::new("s1", vec![(100, 1.0)]),
                Chunk::new("s2", vec![(2, 1.0), (50, 2.0)]),
                Chunk::new("s3", vec![]),
            ],
        );
        assert_eq!(group.point_count(), 3);
        assert_eq!(group.time_range(), Some(TimeRange::new(2, 100)));

        let empty = ChunkGroup::new("root.sg.d2", vec![]);
        assert_eq!(empty.time_range(), None);
    }
}
