//! In-memory buffer collecting replayed log entries until they are flushed.

use crate::tsfile::{Chunk, ChunkGroup, DeviceId, Timestamp};
use std::collections::BTreeMap;

/// Points replayed from the log but not yet written to the data file.
///
/// Organized as device → measurement → timestamp so that draining it yields
/// chunk groups in a deterministic order. A later insert at the same
/// timestamp overwrites the earlier value.
#[derive(Debug, Default)]
pub struct ReplayBuffer {
    data: BTreeMap<DeviceId, BTreeMap<String, BTreeMap<Timestamp, f64>>>,
    point_count: usize,
}

impl ReplayBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no point is buffered.
    pub fn is_empty(&self) -> bool {
        self.point_count == 0
    }

    /// Number of buffered points.
    pub fn point_count(&self) -> usize {
        self.point_count
    }

    /// Buffers one row of `device`.
    pub fn insert(&mut self, device: &str, timestamp: Timestamp, values: &[(String, f64)]) {
        if values.is_empty() {
            return;
        }
        let measurements = self.data.entry(device.to_string()).or_default();
        for (measurement, value) in values {
            let series = measurements.entry(measurement.clone()).or_default();
            if series.insert(timestamp, *value).is_none() {
                self.point_count += 1;
            }
        }
    }

    /// Removes the buffered points of one measurement inside `[start, end]`.
    ///
    /// Returns the number of points removed.
    pub fn delete(
        &mut self,
        device: &str,
        measurement: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> usize {
        if start > end {
            return 0;
        }
        let Some(measurements) = self.data.get_mut(device) else {
            return 0;
        };
        let Some(series) = measurements.get_mut(measurement) else {
            return 0;
        };

        let doomed: Vec<Timestamp> = series.range(start..=end).map(|(ts, _)| *ts).collect();
        for ts in &doomed {
            series.remove(ts);
        }
        if series.is_empty() {
            measurements.remove(measurement);
        }
        if measurements.is_empty() {
            self.data.remove(device);
        }

        self.point_count -= doomed.len();
        doomed.len()
    }

    /// Empties the buffer, returning one chunk group per device.
    ///
    /// Groups are sorted by device and chunks by measurement.
    pub fn drain(&mut self) -> Vec<ChunkGroup> {
        self.point_count = 0;
        std::mem::take(&mut self.data)
            .into_iter()
            .map(|(device, measurements)| {
                let chunks = measurements
                    .into_iter()
                    .map(|(measurement, series)| Chunk {
                        measurement,
                        points: series.into_iter().collect(),
                    })
                    .collect();
                ChunkGroup { device, chunks }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, f64)]) -> Vec<(String, f64)> {
        pairs.iter().map(|(m, v)| (m.to_string(), *v)).collect()
    }

    #[test]
    fn test_insert_counts_distinct_points() {
        let mut buffer = ReplayBuffer::new();
        buffer.insert("d1", 10, &row(&[("s1", 1.0), ("s2", 2.0)]));
        buffer.insert("d1", 10, &row(&[("s1", 3.0)]));
        assert_eq!(buffer.point_count(), 2);
    }

    #[test]
    fn test_drain_is_sorted() {
        let mut buffer = ReplayBuffer::new();
        buffer.insert("d2", 5, &row(&[("s9", 1.0)]));
        buffer.insert("d1", 7, &row(&[("s2", 1.0)]));
        buffer.insert("d1", 3, &row(&[("s1", 1.0), ("s2", 4.0)]));

        let groups = buffer.drain();
        assert!(buffer.is_empty());

        let devices: Vec<_> = groups.iter().map(|g| g.device.as_str()).collect();
        assert_eq!(devices, vec!["d1", "d2"]);
        let d1 = &groups[0];
        assert_eq!(d1.chunks[0].measurement, "s1");
        assert_eq!(d1.chunks[1].points, vec![(3, 4.0), (7, 1.0)]);
    }

    #[test]
    fn test_delete_range() {
        let mut buffer = ReplayBuffer::new();
        for ts in 0..10 {
            buffer.insert("d1", ts, &row(&[("s1", ts as f64), ("s2", 0.0)]));
        }

        assert_eq!(buffer.delete("d1", "s1", 2, 5), 4);
        assert_eq!(buffer.point_count(), 16);
        assert_eq!(buffer.delete("d1", "missing", 0, 100), 0);
        assert_eq!(buffer.delete("d9", "s1", 0, 100), 0);
        assert_eq!(buffer.delete("d1", "s1", 5, 2), 0);
    }

    #[test]
    fn test_delete_everything_drops_device() {
        let mut buffer = ReplayBuffer::new();
        buffer.insert("d1", 1, &row(&[("s1", 1.0)]));
        buffer.delete("d1", "s1", i64::MIN, i64::MAX);
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
    }
}
