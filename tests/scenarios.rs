//! End-to-end scenarios against the public `Engine`/`Table` API.

use std::io::{Seek, SeekFrom, Write};
use std::time::Duration;

use seqstore::{Engine, EngineConfig};
use tempfile::TempDir;

fn open_table(tmp: &TempDir, config: EngineConfig) -> std::sync::Arc<seqstore::Table> {
    let engine = Engine::open(tmp.path()).unwrap();
    let table = engine.create_table("events", config).unwrap();
    // The table's own Arcs (manifest, background worker) keep it
    // alive independent of `engine`, which we can safely drop here.
    drop(engine);
    table
}

/// S1 — Basic round-trip.
#[test]
fn basic_round_trip() {
    let tmp = TempDir::new().unwrap();
    let table = open_table(&tmp, EngineConfig::default());

    let s1 = table.put(1, b"a".to_vec()).unwrap();
    let s2 = table.put(2, b"bb".to_vec()).unwrap();
    let s3 = table.put(3, b"ccc".to_vec()).unwrap();

    assert_eq!((s1, s2, s3), (1, 2, 3));
    let (_, payload) = table.get(2).unwrap();
    assert_eq!(payload, b"bb");
}

/// S2 — Forced flush.
#[test]
fn forced_flush_produces_l0_sst() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig { memtable_max_bytes: 1024, ..Default::default() };
    let table = open_table(&tmp, config);

    for i in 1..=50u64 {
        table.put(i, vec![b'x'; 100]).unwrap();
    }

    // The flush worker drains the immutable queue on its own background
    // thread; poll until it has written the frozen memtable out as an L0
    // file rather than assuming the flush already happened inline.
    let mut stats = table.stats().unwrap();
    for _ in 0..200 {
        if stats.sst_count_per_level[0] >= 1 && stats.immutable_count == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
        stats = table.stats().unwrap();
    }
    assert!(stats.sst_count_per_level[0] >= 1);
    assert_eq!(stats.immutable_count, 0);

    let (_, payload) = table.get(25).unwrap();
    assert_eq!(payload.len(), 100);
}

/// S3 — L0 merge (reduced scale to keep the test fast).
#[test]
fn l0_merge_keeps_files_readable() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        memtable_max_bytes: 512,
        l0_compaction_threshold: 2,
        compaction_tick_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let table = open_table(&tmp, config);

    for i in 1..=300u64 {
        table.put(i, vec![b'y'; 50]).unwrap();
    }

    // Allow the background compaction worker a few ticks to run.
    std::thread::sleep(Duration::from_millis(500));

    for i in [1u64, 150, 300] {
        let (_, payload) = table.get(i).unwrap();
        assert_eq!(payload.len(), 50);
    }
}

/// S4 — Crash recovery: reopen without any flush having occurred.
#[test]
fn crash_recovery_replays_wal() {
    let tmp = TempDir::new().unwrap();
    {
        let config = EngineConfig { memtable_max_bytes: usize::MAX, ..Default::default() };
        let engine = Engine::open(tmp.path()).unwrap();
        let table = engine.create_table("events", config).unwrap();
        for i in 1..=200u64 {
            table.put(i, vec![b'z']).unwrap();
        }
        // Simulate a crash: no explicit close/flush.
    }

    let engine = Engine::open(tmp.path()).unwrap();
    let table = engine.open_table("events").unwrap();
    assert_eq!(table.memtable_record_count().unwrap(), 200);
    assert_eq!(table.max_seq(), 200);
    assert!(table.get(1).is_ok());
    assert!(table.get(200).is_ok());
}

/// S5 — Truncated WAL tail: a crash that leaves garbage bytes after the
/// last valid frame must not surface as an error, and recovery must stop
/// exactly at the last valid record.
#[test]
fn truncated_wal_tail_recovers_cleanly() {
    let tmp = TempDir::new().unwrap();
    let wal_path = tmp.path().join("events").join("wal").join("000001.wal");
    {
        let config = EngineConfig { memtable_max_bytes: usize::MAX, ..Default::default() };
        let engine = Engine::open(tmp.path()).unwrap();
        let table = engine.create_table("events", config).unwrap();
        for i in 1..=10u64 {
            table.put(i * 10, format!("v{i}").into_bytes()).unwrap();
        }
        engine.close().unwrap();
    }

    // Simulate a crash mid-append: append 20 garbage bytes past the last
    // valid frame.
    let mut f = std::fs::OpenOptions::new().append(true).open(&wal_path).unwrap();
    f.write_all(&[0xAB; 20]).unwrap();
    f.sync_all().unwrap();
    drop(f);

    let engine = Engine::open(tmp.path()).unwrap();
    let table = engine.open_table("events").unwrap();
    assert_eq!(table.memtable_record_count().unwrap(), 10);
    assert_eq!(table.max_seq(), 10);
    let (_, payload) = table.get(1).unwrap();
    assert_eq!(payload, b"v1");

    let seq = table.put(110, b"v11".to_vec()).unwrap();
    assert_eq!(seq, 11);
    let (_, payload) = table.get(11).unwrap();
    assert_eq!(payload, b"v11");
}

/// S6 — Header CRC mismatch: a corrupted SST header must surface
/// `Corruption` when the table is reopened, not silently on first read.
#[test]
fn corrupt_sst_header_surfaces_corruption_on_reopen() {
    let tmp = TempDir::new().unwrap();
    let sst_dir = tmp.path().join("events").join("sst");
    {
        let config = EngineConfig { memtable_max_bytes: 1024, ..Default::default() };
        let engine = Engine::open(tmp.path()).unwrap();
        let table = engine.create_table("events", config).unwrap();
        for i in 1..=50u64 {
            table.put(i, vec![b'q'; 100]).unwrap();
        }

        // Poll for the async flush worker to drain the frozen memtable.
        let mut stats = table.stats().unwrap();
        for _ in 0..200 {
            if stats.sst_count_per_level[0] >= 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
            stats = table.stats().unwrap();
        }
        assert!(stats.sst_count_per_level[0] >= 1, "flush never produced an L0 file");
        engine.close().unwrap();
    }

    let sst_file = std::fs::read_dir(&sst_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| e.path().extension().is_some_and(|ext| ext == "sst"))
        .expect("flush should have left one SST file on disk")
        .path();

    // Flip a byte inside the header's CRC-covered region.
    let mut f = std::fs::OpenOptions::new().write(true).open(&sst_file).unwrap();
    f.seek(SeekFrom::Start(20)).unwrap();
    f.write_all(&[0xFF]).unwrap();
    f.sync_all().unwrap();
    drop(f);

    let err = Engine::open(tmp.path()).unwrap_err();
    let message = err.to_string().to_lowercase();
    assert!(message.contains("corrupt"), "expected a corruption error, got: {err}");
}

/// S1 variant exercising `scan`.
#[test]
fn scan_returns_ascending_range_across_memtable_and_sst() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig { memtable_max_bytes: 256, ..Default::default() };
    let table = open_table(&tmp, config);

    for i in 1..=40u64 {
        table.put(i, vec![i as u8]).unwrap();
    }

    let rows = table.scan(10, 20).unwrap();
    let seqs: Vec<u64> = rows.iter().map(|(s, _, _)| *s).collect();
    assert_eq!(seqs, (10..=20).collect::<Vec<_>>());
}
