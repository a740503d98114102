//! Integration tests for replaying write-ahead log entries into data files.

use alopex_skulk_recovery::tsfile::format::Record;
use alopex_skulk_recovery::tsfile::{Chunk, ChunkGroup, DataFileReader, DataFileWriter};
use alopex_skulk_recovery::wal::{BufferSet, LogEntry, LogNodeConfig, LogNodeManager, SyncMode};
use alopex_skulk_recovery::{
    FileVersionController, RecoveryOptions, RecoveryPerformer, ResourceIndex,
    SimpleVersionController, VersionController,
};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const NODE: &str = "root.sg-3-3-0.tsfile";

struct Harness {
    temp_dir: TempDir,
    data_file: PathBuf,
    manager: LogNodeManager,
}

impl Harness {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let data_file = temp_dir.path().join("3-3-0.tsfile");
        let manager = LogNodeManager::new(
            temp_dir.path().join("wal"),
            LogNodeConfig::new(4 * 1024, SyncMode::None),
        )
        .unwrap();
        Self {
            temp_dir,
            data_file,
            manager,
        }
    }

    fn log(&self, entries: &[LogEntry]) {
        let node = self
            .manager
            .get_or_create(NODE, &mut BufferSet::default)
            .unwrap();
        node.append_batch(entries).unwrap();
        node.sync().unwrap();
    }

    fn recover(
        &self,
        index: &mut ResourceIndex,
        versions: &dyn VersionController,
        options: RecoveryOptions,
    ) -> Option<DataFileWriter> {
        RecoveryPerformer::new("root.sg-", &self.data_file, index, &self.manager, versions)
            .with_options(options)
            .recover(true, BufferSet::default, |_| Ok(()))
            .unwrap()
    }
}

fn write_file(path: &Path, groups: &[ChunkGroup], flushed: u64, seal: bool) {
    let mut writer = DataFileWriter::create(path).unwrap();
    for g in groups {
        writer.append_chunk_group(g).unwrap();
    }
    if flushed > 0 {
        writer.mark_flushed(flushed).unwrap();
    }
    if seal {
        writer.seal().unwrap();
    }
    writer.close().unwrap();
}

fn insert(version: u64, device: &str, ts: i64, measurement: &str) -> LogEntry {
    LogEntry::insert(version, device, ts, vec![(measurement.to_string(), ts as f64)])
}

fn read_records(path: &Path) -> Vec<Record> {
    let reader = DataFileReader::open(path).unwrap();
    reader
        .records(reader.file_len())
        .unwrap()
        .map(|r| r.unwrap().1)
        .collect()
}

#[test]
fn test_flush_markers_split_replayed_groups() {
    let h = Harness::new();
    write_file(&h.data_file, &[], 0, false);
    h.log(&[
        insert(1, "root.sg.d1", 10, "s1"),
        insert(2, "root.sg.d1", 11, "s1"),
        LogEntry::FlushMarker { version: 3 },
        insert(4, "root.sg.d2", 5, "s1"),
    ]);

    let versions = SimpleVersionController::default();
    let mut index = ResourceIndex::new();
    let mut writer = h
        .recover(&mut index, &versions, RecoveryOptions::active_file())
        .unwrap();
    writer.close().unwrap();

    let records = read_records(&h.data_file);
    assert_eq!(records.len(), 4);
    assert!(matches!(&records[0], Record::ChunkGroup(g) if g.device == "root.sg.d1"));
    assert_eq!(records[1], Record::Version(3));
    assert!(matches!(&records[2], Record::ChunkGroup(g) if g.device == "root.sg.d2"));
    assert_eq!(records[3], Record::Version(4));

    assert_eq!(index.flushed_version(), 4);
    assert_eq!(versions.curr_version(), 4);
}

#[test]
fn test_delete_entries_drop_buffered_points() {
    let h = Harness::new();
    write_file(&h.data_file, &[], 0, false);
    h.log(&[
        insert(1, "root.sg.d1", 1, "s1"),
        insert(2, "root.sg.d1", 50, "s1"),
        insert(3, "root.sg.d1", 99, "s1"),
        LogEntry::delete(4, "root.sg.d1", "s1", 40, 200),
        insert(5, "root.sg.d2", 7, "s1"),
        LogEntry::delete(6, "root.sg.d2", "s1", 0, 10),
    ]);

    let versions = SimpleVersionController::default();
    let mut index = ResourceIndex::new();
    let mut writer = h
        .recover(&mut index, &versions, RecoveryOptions::default())
        .unwrap();
    writer.close().unwrap();

    assert_eq!(index.time_range("root.sg.d1").map(|r| (r.start, r.end)), Some((1, 1)));
    assert_eq!(index.time_range("root.sg.d2"), None);
    assert_eq!(index.flushed_version(), 6);
}

#[test]
fn test_delete_does_not_touch_stored_points() {
    let h = Harness::new();
    let stored = ChunkGroup::new("root.sg.d1", vec![Chunk::new("s1", vec![(100, 1.0)])]);
    write_file(&h.data_file, &[stored], 10, false);
    h.log(&[LogEntry::delete(11, "root.sg.d1", "s1", 0, 1000)]);

    let versions = SimpleVersionController::default();
    let mut index = ResourceIndex::new();
    h.recover(&mut index, &versions, RecoveryOptions::default())
        .unwrap()
        .close()
        .unwrap();

    assert_eq!(index.end_time("root.sg.d1"), Some(100));
    assert_eq!(index.flushed_version(), 11);
}

#[test]
fn test_sealed_file_without_pending_entries_is_untouched() {
    let h = Harness::new();
    let stored = ChunkGroup::new("root.sg.d1", vec![Chunk::new("s1", vec![(1, 1.0), (2, 2.0)])]);
    write_file(&h.data_file, &[stored], 20, true);
    let before = fs::read(&h.data_file).unwrap();
    h.log(&[insert(5, "root.sg.d1", -100, "s1"), insert(20, "root.sg.d9", 0, "s1")]);

    let versions = SimpleVersionController::default();
    let mut index = ResourceIndex::new();
    h.recover(&mut index, &versions, RecoveryOptions::default())
        .unwrap()
        .close()
        .unwrap();

    assert_eq!(fs::read(&h.data_file).unwrap(), before);
    assert_eq!(index.len(), 1);
    assert_eq!(index.start_time("root.sg.d1"), Some(1));
    assert!(h.manager.node(NODE).is_none());
}

#[test]
fn test_sealed_file_with_pending_entries_is_reopened() {
    let h = Harness::new();
    let stored = ChunkGroup::new("root.sg.d1", vec![Chunk::new("s1", vec![(1, 1.0)])]);
    write_file(&h.data_file, &[stored], 20, true);
    h.log(&[insert(21, "root.sg.d1", 40, "s1"), insert(22, "root.sg.d2", 3, "s2")]);

    let versions = SimpleVersionController::default();
    let mut index = ResourceIndex::new();
    let mut writer = h
        .recover(&mut index, &versions, RecoveryOptions::default())
        .unwrap();
    assert!(writer.is_sealed());
    assert_eq!(writer.flushed_version(), 22);
    writer.close().unwrap();

    assert_eq!(index.time_range("root.sg.d1").map(|r| (r.start, r.end)), Some((1, 40)));
    assert_eq!(index.start_time("root.sg.d2"), Some(3));

    let reopened = DataFileWriter::open_restorable(&h.data_file).unwrap();
    assert!(reopened.is_sealed());
    assert_eq!(reopened.chunk_group_count(), 3);
}

#[test]
fn test_repeated_recovery_is_idempotent() {
    let h = Harness::new();
    write_file(&h.data_file, &[], 0, false);
    h.log(&[insert(1, "root.sg.d1", 10, "s1"), insert(2, "root.sg.d1", 20, "s1")]);

    let versions = SimpleVersionController::default();
    let resource_path = ResourceIndex::resource_path(&h.data_file);

    let mut first = ResourceIndex::new();
    h.recover(&mut first, &versions, RecoveryOptions::active_file())
        .unwrap()
        .close()
        .unwrap();
    let data_after_first = fs::read(&h.data_file).unwrap();
    let index_after_first = fs::read(&resource_path).unwrap();

    // the log still holds both entries, but they are at or below the watermark now
    let mut second = ResourceIndex::new();
    h.recover(&mut second, &versions, RecoveryOptions::active_file())
        .unwrap()
        .close()
        .unwrap();

    assert_eq!(fs::read(&h.data_file).unwrap(), data_after_first);
    assert_eq!(fs::read(&resource_path).unwrap(), index_after_first);
    assert_eq!(first, second);
}

#[test]
fn test_version_controller_advances_past_replayed_entries() {
    let h = Harness::new();
    write_file(&h.data_file, &[], 0, false);
    h.log(&[insert(41, "root.sg.d1", 1, "s1"), insert(57, "root.sg.d1", 2, "s1")]);

    let version_dir = h.temp_dir.path().join("versions");
    let versions = FileVersionController::open(&version_dir, 10).unwrap();
    let mut index = ResourceIndex::new();
    h.recover(&mut index, &versions, RecoveryOptions::default())
        .unwrap()
        .close()
        .unwrap();

    assert!(versions.curr_version() >= 57);
    assert!(versions.next_version().unwrap() > 57);

    let reopened = FileVersionController::open(&version_dir, 10).unwrap();
    assert!(reopened.curr_version() >= 57);
}

#[test]
fn test_log_rotated_across_segments() {
    let h = Harness::new();
    write_file(&h.data_file, &[], 0, false);
    let entries: Vec<LogEntry> = (1..=500)
        .map(|v| insert(v, "root.sg.d1", v as i64, "s1"))
        .collect();
    h.log(&entries);
    let node = h.manager.node(NODE).unwrap();
    assert!(node.segment_count().unwrap() > 1);

    let versions = SimpleVersionController::default();
    let mut index = ResourceIndex::new();
    h.recover(&mut index, &versions, RecoveryOptions::default())
        .unwrap()
        .close()
        .unwrap();

    assert_eq!(index.time_range("root.sg.d1").map(|r| (r.start, r.end)), Some((1, 500)));
    assert_eq!(versions.curr_version(), 500);
}
