//! The public engine surface: `Engine` owns a directory of tables;
//! `Table` owns one table's WAL, memtables, manifest, and background
//! workers.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::compaction::{CompactionConfig, CompactionError, CompactionWorker};
use crate::manifest::{FileMetadata, Manifest, ManifestError, VersionEdit};
use crate::memtable::{MemTableError, MemTableManager};
use crate::sstable::{sst_path, Compression, SSTableError, SSTableWriter};
use crate::wal::{Wal, WalError};

const WAL_DIR: &str = "wal";
const SST_DIR: &str = "sst";

/// Errors surfaced by the public engine API, aggregating every
/// component's error type.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    MemTable(#[from] MemTableError),

    #[error(transparent)]
    SSTable(#[from] SSTableError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Compaction(#[from] CompactionError),

    /// A requested `seq` does not exist in the table.
    #[error("seq {0} not found")]
    NotFound(u64),

    /// Operation attempted on a closed engine or table.
    #[error("operation attempted on a closed {0}")]
    Closed(&'static str),

    /// An internal consistency check failed; indicates a bug rather
    /// than an environmental failure.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),
}

/// Top-level engine configuration (§6's configuration table).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub memtable_max_bytes: usize,
    pub reserved_index_bytes: u64,
    pub compression: Compression,
    pub l0_compaction_threshold: usize,
    pub level_size_base: u64,
    pub level_size_multiplier: u64,
    pub compaction_tick_interval: Duration,
    pub sync_on_append: bool,
    /// Backpressure bound on the immutable memtable queue (SPEC_FULL
    /// §C, §5): once `Put` triggers a rotation, the writer blocks
    /// while the flush worker hasn't drained the queue below this
    /// many memtables.
    pub immutable_queue_bound: usize,
    /// Target size of one compaction output file (SPEC_FULL §C).
    pub compaction_output_target_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memtable_max_bytes: 4 * 1024 * 1024,
            reserved_index_bytes: 10 * 1024 * 1024,
            compression: Compression::Snappy,
            l0_compaction_threshold: 4,
            level_size_base: 10 * 1024 * 1024,
            level_size_multiplier: 10,
            compaction_tick_interval: Duration::from_secs(10),
            sync_on_append: true,
            immutable_queue_bound: 4,
            compaction_output_target_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Per-table options; currently identical to [`EngineConfig`] but
/// kept as a distinct type so tables can diverge from engine defaults.
pub type TableOptions = EngineConfig;

/// Snapshot of a table's runtime statistics.
#[derive(Debug, Clone)]
pub struct TableStats {
    pub memtable_size: usize,
    pub immutable_count: usize,
    pub sst_count_per_level: [usize; crate::manifest::NUM_LEVELS],
    pub total_bytes: u64,
}

/// The engine: a directory containing zero or more tables.
pub struct Engine {
    dir: PathBuf,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    closed: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("dir", &self.dir).finish()
    }
}

impl Engine {
    /// Opens (or creates) the engine rooted at `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut tables = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let table = Table::open(dir.join(&name), name.clone(), EngineConfig::default())?;
                tables.insert(name, Arc::new(table));
            }
        }
        info!(dir = %dir.display(), tables = tables.len(), "engine opened");
        Ok(Self { dir, tables: RwLock::new(tables), closed: std::sync::atomic::AtomicBool::new(false) })
    }

    fn check_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed("engine"));
        }
        Ok(())
    }

    /// Creates a new, empty table named `name`.
    pub fn create_table(&self, name: &str, opts: TableOptions) -> Result<Arc<Table>, EngineError> {
        self.check_open()?;
        let mut tables = self.tables.write().expect("tables lock poisoned");
        if tables.contains_key(name) {
            return Err(EngineError::InvariantViolated(format!("table {name} already exists")));
        }
        let table = Arc::new(Table::open(self.dir.join(name), name.to_string(), opts)?);
        tables.insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    /// Opens an already-created table.
    pub fn open_table(&self, name: &str) -> Result<Arc<Table>, EngineError> {
        self.check_open()?;
        let tables = self.tables.read().expect("tables lock poisoned");
        tables
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::InvariantViolated(format!("table {name} does not exist")))
    }

    /// Lists every table name known to the engine.
    pub fn list_tables(&self) -> Result<Vec<String>, EngineError> {
        self.check_open()?;
        let tables = self.tables.read().expect("tables lock poisoned");
        Ok(tables.keys().cloned().collect())
    }

    /// Closes every table and marks the engine closed.
    pub fn close(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::SeqCst);
        let tables = self.tables.write().expect("tables lock poisoned");
        for table in tables.values() {
            table.close()?;
        }
        info!(dir = %self.dir.display(), "engine closed");
        Ok(())
    }
}

/// Condvar-guarded signal the flush worker uses to wake writers
/// blocked in [`Table::wait_for_immutable_room`].
type Backpressure = (Mutex<()>, Condvar);

struct TableInner {
    wal: Mutex<Wal>,
    write_mutex: Mutex<()>,
    memtables: Arc<MemTableManager>,
    manifest: Arc<Manifest>,
    backpressure: Arc<Backpressure>,
    flush: FlushWorker,
    compaction: Arc<CompactionWorker>,
    next_seq: AtomicU64,
    wal_dir: PathBuf,
    sst_dir: PathBuf,
    config: EngineConfig,
    closed: std::sync::atomic::AtomicBool,
}

/// One append-only table: a WAL-backed memtable manager, its SST
/// files, and the manifest tracking them.
pub struct Table {
    name: String,
    inner: Arc<TableInner>,
}

impl Table {
    fn open(dir: PathBuf, name: String, config: EngineConfig) -> Result<Self, EngineError> {
        fs::create_dir_all(&dir)?;
        let wal_dir = dir.join(WAL_DIR);
        let sst_dir = dir.join(SST_DIR);
        fs::create_dir_all(&wal_dir)?;
        fs::create_dir_all(&sst_dir)?;

        // `Manifest::open` eagerly opens (and header-validates) every
        // SST file the replayed manifest references, so a corrupt
        // file surfaces here rather than lazily on a later `Get`.
        let manifest = Arc::new(Manifest::open(&dir, &sst_dir)?);
        let removed = manifest.garbage_collect()?;
        if !removed.is_empty() {
            warn!(table = %name, count = removed.len(), "removed orphan SST files at open");
        }

        let wal_number = 1u64;
        let wal_path = wal_dir.join(format!("{wal_number:06}.wal"));
        let wal = Wal::open(&wal_path, wal_number, config.sync_on_append)?;

        let memtables = Arc::new(MemTableManager::new(wal_number, config.memtable_max_bytes));
        let mut max_seq = 0u64;
        for record in wal.iter()? {
            memtables.put(record.seq, record.time, record.payload)?;
            max_seq = max_seq.max(record.seq);
        }

        let compaction_config = CompactionConfig {
            l0_threshold: config.l0_compaction_threshold,
            level_size_base: config.level_size_base,
            level_size_multiplier: config.level_size_multiplier,
            output_target_bytes: config.compaction_output_target_bytes,
            tick_interval: config.compaction_tick_interval,
            reserved_index_bytes: config.reserved_index_bytes,
            compression: config.compression,
        };
        let compaction = Arc::new(CompactionWorker::spawn(sst_dir.clone(), Arc::clone(&manifest), compaction_config));
        let backpressure = Arc::new((Mutex::new(()), Condvar::new()));
        let flush = FlushWorker::spawn(
            name.clone(),
            Arc::clone(&memtables),
            Arc::clone(&manifest),
            Arc::clone(&compaction),
            Arc::clone(&backpressure),
            wal_dir.clone(),
            sst_dir.clone(),
            config.clone(),
        );

        let inner = Arc::new(TableInner {
            wal: Mutex::new(wal),
            write_mutex: Mutex::new(()),
            memtables,
            manifest,
            backpressure,
            flush,
            compaction,
            next_seq: AtomicU64::new(max_seq + 1),
            wal_dir,
            sst_dir,
            config,
            closed: std::sync::atomic::AtomicBool::new(false),
        });

        info!(table = %name, max_seq, "table opened");
        Ok(Self { name, inner })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_open(&self) -> Result<(), EngineError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed("table"));
        }
        Ok(())
    }

    /// Appends a record. The engine assigns the returned `seq`.
    ///
    /// Holds the write mutex only for the critical section: allocate
    /// `seq`, append to the WAL, insert into the active memtable.
    pub fn put(&self, time: u64, payload: Vec<u8>) -> Result<u64, EngineError> {
        self.check_open()?;
        let _guard = self.inner.write_mutex.lock().expect("write mutex poisoned");

        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        {
            let wal = self.inner.wal.lock().expect("wal mutex poisoned");
            wal.append(seq, time, &payload)?;
        }
        self.inner.memtables.put(seq, time, payload)?;
        drop(_guard);

        if self.inner.memtables.should_rotate()? {
            self.wait_for_immutable_room()?;
            self.rotate()?;
        }
        Ok(seq)
    }

    /// Blocks while the immutable queue is at or past
    /// `immutable_queue_bound`, per §5's backpressure requirement.
    /// Woken by the flush worker after every successful flush.
    fn wait_for_immutable_room(&self) -> Result<(), EngineError> {
        let (lock, cvar) = &*self.inner.backpressure;
        let mut guard = lock.lock().expect("backpressure lock poisoned");
        while self.inner.memtables.immutable_count()? >= self.inner.config.immutable_queue_bound {
            let (next_guard, timeout) =
                cvar.wait_timeout(guard, Duration::from_millis(50)).expect("backpressure lock poisoned");
            guard = next_guard;
            let _ = timeout;
        }
        Ok(())
    }

    /// Freezes the active memtable and wakes the flush worker to
    /// drain it; does not flush inline.
    fn rotate(&self) -> Result<(), EngineError> {
        let new_wal_number = self.inner.manifest.new_file_number();
        let new_wal_path = self.inner.wal_dir.join(format!("{new_wal_number:06}.wal"));
        let new_wal = Wal::open(&new_wal_path, new_wal_number, self.inner.config.sync_on_append)?;

        self.inner.memtables.rotate(new_wal_number)?;
        {
            let mut wal_guard = self.inner.wal.lock().expect("wal mutex poisoned");
            *wal_guard = new_wal;
        }

        self.inner.flush.notify();
        Ok(())
    }

    /// Looks up a record by `seq`: active memtable, then immutables
    /// newest-to-oldest, then SSTs of the pinned current version (L0
    /// newest file first, then L1..L6 by non-overlapping range).
    ///
    /// The version is pinned for the whole lookup: every file it
    /// references carries an already-open reader, so a compaction
    /// that commits mid-lookup and drops one of those files from the
    /// *new* current version cannot invalidate this read.
    pub fn get(&self, seq: u64) -> Result<(u64, Vec<u8>), EngineError> {
        self.check_open()?;
        if let Some(entry) = self.inner.memtables.get(seq)? {
            return Ok((entry.time, entry.payload));
        }

        let version = self.inner.manifest.pin();
        for file in version.levels[0].iter().rev() {
            if let Some((time, payload)) = file.reader.get(seq)? {
                return Ok((time, payload));
            }
        }
        for level in &version.levels[1..] {
            let Ok(idx) = level.binary_search_by(|f| {
                if seq < f.meta.min_key {
                    std::cmp::Ordering::Greater
                } else if seq > f.meta.max_key {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            }) else {
                continue;
            };
            if let Some((time, payload)) = level[idx].reader.get(seq)? {
                return Ok((time, payload));
            }
        }
        Err(EngineError::NotFound(seq))
    }

    /// Returns every record with `seq` in `[from_seq, to_seq]`,
    /// ordered ascending, merging memtables and a single pinned
    /// version of the SST files.
    pub fn scan(&self, from_seq: u64, to_seq: u64) -> Result<Vec<(u64, u64, Vec<u8>)>, EngineError> {
        self.check_open()?;
        let mut merged: std::collections::BTreeMap<u64, (u64, Vec<u8>)> = std::collections::BTreeMap::new();

        let version = self.inner.manifest.pin();
        for level in version.levels.iter() {
            for file in level {
                if file.meta.max_key < from_seq || file.meta.min_key > to_seq {
                    continue;
                }
                for (seq, time, payload) in file.reader.scan(from_seq, to_seq)? {
                    merged.insert(seq, (time, payload));
                }
            }
        }

        for seq in from_seq..=to_seq {
            if let Some(entry) = self.inner.memtables.get(seq)? {
                merged.insert(seq, (entry.time, entry.payload));
            }
        }

        Ok(merged.into_iter().map(|(seq, (time, payload))| (seq, time, payload)).collect())
    }

    /// Largest `seq` ever assigned to this table.
    pub fn max_seq(&self) -> u64 {
        self.inner.next_seq.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Current runtime statistics, per §6.
    pub fn stats(&self) -> Result<TableStats, EngineError> {
        let version = self.inner.manifest.current_version();
        let mut sst_count_per_level = [0usize; crate::manifest::NUM_LEVELS];
        let mut total_bytes = 0u64;
        for (i, level) in version.levels.iter().enumerate() {
            sst_count_per_level[i] = level.len();
            total_bytes += level.iter().map(|f| f.meta.file_size).sum::<u64>();
        }
        Ok(TableStats {
            memtable_size: self.inner.memtables.active_size_bytes()?,
            immutable_count: self.inner.memtables.immutable_count()?,
            sst_count_per_level,
            total_bytes,
        })
    }

    /// Total record count currently held across memtables, used by
    /// crash-recovery tests (§8, S4) before any flush has run.
    pub fn memtable_record_count(&self) -> Result<usize, EngineError> {
        Ok(self.inner.memtables.total_count()?)
    }

    /// Closes the table, flushing durability state and stopping
    /// background workers.
    pub fn close(&self) -> Result<(), EngineError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let wal = self.inner.wal.lock().expect("wal mutex poisoned");
        wal.sync()?;
        info!(table = %self.name, "table closed");
        Ok(())
    }
}

/// Background worker that drains the immutable memtable queue:
/// writes each frozen memtable to a new L0 SST, commits the resulting
/// `VersionEdit`, and removes the now-redundant WAL segment. Runs
/// independently of the foreground `put` path so rotation never
/// blocks on file I/O; `Table::wait_for_immutable_room` is the only
/// place `put` waits on this worker.
struct FlushWorker {
    handle: Option<JoinHandle<()>>,
    wake: crossbeam::channel::Sender<()>,
    stop: crossbeam::channel::Sender<()>,
}

impl FlushWorker {
    #[allow(clippy::too_many_arguments)]
    fn spawn(
        table_name: String,
        memtables: Arc<MemTableManager>,
        manifest: Arc<Manifest>,
        compaction: Arc<CompactionWorker>,
        backpressure: Arc<Backpressure>,
        wal_dir: PathBuf,
        sst_dir: PathBuf,
        config: EngineConfig,
    ) -> Self {
        let (wake_tx, wake_rx) = crossbeam::channel::bounded::<()>(1);
        let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(1);

        let handle = std::thread::Builder::new()
            .name("seqstore-flush".into())
            .spawn(move || loop {
                crossbeam::channel::select! {
                    recv(stop_rx) -> _ => {
                        info!(table = %table_name, "flush worker stopping");
                        break;
                    }
                    recv(wake_rx) -> _ => {}
                }

                loop {
                    match Self::flush_one(&memtables, &manifest, &sst_dir, &wal_dir, &config) {
                        Ok(false) => break,
                        Ok(true) => {
                            compaction.notify();
                            let (lock, cvar) = &*backpressure;
                            let _guard = lock.lock().expect("backpressure lock poisoned");
                            cvar.notify_all();
                        }
                        Err(e) => {
                            error!(table = %table_name, error = %e, "flush job failed, will retry on next wake");
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn flush worker thread");

        Self { handle: Some(handle), wake: wake_tx, stop: stop_tx }
    }

    /// Flushes the single oldest immutable memtable, if any. Returns
    /// `Ok(false)` once the queue is empty.
    fn flush_one(
        memtables: &MemTableManager,
        manifest: &Manifest,
        sst_dir: &Path,
        wal_dir: &Path,
        config: &EngineConfig,
    ) -> Result<bool, EngineError> {
        let Some((flushed_wal_number, entries)) = memtables.snapshot_oldest_immutable()? else {
            return Ok(false);
        };

        let file_number = manifest.new_file_number();
        let path = sst_path(sst_dir, file_number);
        let mut writer = SSTableWriter::create(&path, config.reserved_index_bytes, config.compression)?;
        for (seq, entry) in &entries {
            writer.add(*seq, entry.time, &entry.payload)?;
        }
        let summary = writer.finish()?;

        manifest.apply(VersionEdit {
            added: vec![FileMetadata {
                file_number,
                min_key: summary.min_key,
                max_key: summary.max_key,
                file_size: summary.file_size,
                level: 0,
            }],
            removed: vec![],
        })?;

        memtables.drop_immutable(flushed_wal_number)?;
        let old_wal_path = wal_dir.join(format!("{flushed_wal_number:06}.wal"));
        if let Err(e) = fs::remove_file(&old_wal_path) {
            warn!(path = %old_wal_path.display(), error = %e, "failed to remove flushed WAL segment");
        }

        info!(file_number, rows = summary.row_count, "flushed immutable memtable to L0");
        Ok(true)
    }

    /// Wakes the worker immediately, e.g. right after a rotation.
    fn notify(&self) {
        let _ = self.wake.try_send(());
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
