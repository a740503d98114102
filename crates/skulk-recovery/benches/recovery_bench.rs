//! Benchmarks for Skulk data file recovery.
//!
//! Run with: cargo bench --package alopex-skulk-recovery
//!
//! ## Benchmark Categories
//!
//! - **Scan**: opening a data file in restorable mode
//! - **Replay**: recovering a torn file with pending log entries
//! - **Index**: persisting a rebuilt resource index

use alopex_skulk_recovery::tsfile::format::Record;
use alopex_skulk_recovery::tsfile::{Chunk, ChunkGroup, DataFileWriter};
use alopex_skulk_recovery::wal::{BufferSet, LogEntry, LogNodeConfig, LogNodeManager, SyncMode};
use alopex_skulk_recovery::{
    RecoveryOptions, RecoveryPerformer, ResourceIndex, SimpleVersionController,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tempfile::TempDir;

const DEVICES: usize = 10;

/// Generate one chunk group per device with `points` regular points each.
fn generate_groups(points: usize) -> Vec<ChunkGroup> {
    (0..DEVICES)
        .map(|d| {
            let series = (0..points)
                .map(|i| (1_000_000 + i as i64 * 1_000, 20.0 + (i as f64 * 0.1).sin()))
                .collect();
            ChunkGroup::new(format!("root.bench.d{}", d), vec![Chunk::new("s0", series)])
        })
        .collect()
}

/// A crashed file: stored groups, a torn trailing group and `pending` log entries.
struct CrashedFile {
    _temp_dir: TempDir,
    data_file: PathBuf,
    manager: LogNodeManager,
}

fn crashed_file(points: usize, pending: usize) -> CrashedFile {
    let temp_dir = TempDir::new().unwrap();
    let data_file = temp_dir.path().join("1-1-0.tsfile");

    let groups = generate_groups(points);
    let mut writer = DataFileWriter::create(&data_file).unwrap();
    for group in &groups {
        writer.append_chunk_group(group).unwrap();
    }
    writer.mark_flushed(1).unwrap();
    writer.close().unwrap();

    let torn = Record::ChunkGroup(groups[0].clone()).to_bytes().unwrap();
    let mut file = OpenOptions::new().append(true).open(&data_file).unwrap();
    file.write_all(&torn[..torn.len() / 2]).unwrap();

    let manager = LogNodeManager::new(
        temp_dir.path().join("wal"),
        LogNodeConfig::new(16 * 1024 * 1024, SyncMode::None),
    )
    .unwrap();
    let node = manager
        .get_or_create("root.bench-1-1-0.tsfile", &mut BufferSet::default)
        .unwrap();
    let entries: Vec<LogEntry> = (0..pending)
        .map(|i| {
            LogEntry::insert(
                i as u64 + 2,
                format!("root.bench.d{}", i % DEVICES),
                2_000_000 + i as i64,
                vec![("s0".to_string(), i as f64)],
            )
        })
        .collect();
    node.append_batch(&entries).unwrap();

    CrashedFile {
        _temp_dir: temp_dir,
        data_file,
        manager,
    }
}

fn bench_open_restorable(c: &mut Criterion) {
    let mut group = c.benchmark_group("open_restorable");

    for points in [100, 1_000, 10_000].iter() {
        let crashed = crashed_file(*points, 0);
        group.throughput(Throughput::Elements((*points * DEVICES) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(points),
            &crashed.data_file,
            |b, path| b.iter(|| DataFileWriter::open_restorable(black_box(path)).unwrap()),
        );
    }

    group.finish();
}

fn bench_recover_with_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("recover_with_replay");
    group.sample_size(20);

    for pending in [100, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*pending as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(pending),
            pending,
            |b, &pending| {
                b.iter_batched(
                    || crashed_file(1_000, pending),
                    |crashed| {
                        let versions = SimpleVersionController::default();
                        let mut index = ResourceIndex::new();
                        let writer = RecoveryPerformer::new(
                            "root.bench-",
                            &crashed.data_file,
                            &mut index,
                            &crashed.manager,
                            &versions,
                        )
                        .with_options(RecoveryOptions::active_file())
                        .recover(true, || BufferSet::with_capacity(2, 16 * 1024), |_| Ok(()))
                        .unwrap();
                        if let Some(mut writer) = writer {
                            writer.close().unwrap();
                        }
                        black_box(index.len())
                    },
                    criterion::BatchSize::SmallInput,
                )
            },
        );
    }

    group.finish();
}

fn bench_index_persist(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bench.tsfile.resource");

    let mut index = ResourceIndex::new();
    for d in 0..1_000 {
        let device = format!("root.bench.d{}", d);
        index.record_point(&device, d);
        index.record_point(&device, d + 1_000);
    }

    c.bench_function("index_persist_1k_devices", |b| {
        b.iter(|| index.persist(black_box(&path)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_open_restorable,
    bench_recover_with_replay,
    bench_index_persist,
);
criterion_main!(benches);
