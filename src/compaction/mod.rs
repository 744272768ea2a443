//! Background compaction: merges SST files from level `L` into
//! `L+1`, keeping per-level overlap invariants intact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};

use crate::manifest::{FileMetadata, Manifest, ManifestError, Version, VersionEdit, VersionFile};
use crate::sstable::{sst_path, Compression, SSTableError, SSTableWriter};

/// Errors produced while planning or running a compaction job.
#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    SSTable(#[from] SSTableError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// Tunables for the compaction policy, mirroring the `L0*`/`Level*`
/// options of the configuration table.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    pub l0_threshold: usize,
    pub level_size_base: u64,
    pub level_size_multiplier: u64,
    pub output_target_bytes: u64,
    pub tick_interval: Duration,
    pub reserved_index_bytes: u64,
    pub compression: Compression,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            l0_threshold: 4,
            level_size_base: 10 * 1024 * 1024,
            level_size_multiplier: 10,
            output_target_bytes: 64 * 1024 * 1024,
            tick_interval: Duration::from_secs(10),
            reserved_index_bytes: 10 * 1024 * 1024,
            compression: Compression::Snappy,
        }
    }
}

/// One planned compaction: merge `inputs` (drawn from two adjacent
/// levels) into `output_level`. Each input carries the reader already
/// open on the pinned `Version` it was planned from, so `run` never
/// has to reopen an SST file by path.
#[derive(Clone)]
pub struct CompactionJob {
    pub inputs: Vec<VersionFile>,
    pub output_level: usize,
}

fn ranges_overlap(a_min: u64, a_max: u64, b_min: u64, b_max: u64) -> bool {
    a_min <= b_max && b_min <= a_max
}

/// Evaluates the two triggers of §4.6 top-down against `version`,
/// returning the first job that fires, if any.
pub fn plan(version: &Version, config: &CompactionConfig) -> Option<CompactionJob> {
    let l0 = &version.levels[0];
    if l0.len() >= config.l0_threshold {
        let mut inputs: Vec<VersionFile> = l0.clone();
        let l0_min = inputs.iter().map(|f| f.meta.min_key).min().unwrap();
        let l0_max = inputs.iter().map(|f| f.meta.max_key).max().unwrap();
        for f in &version.levels[1] {
            if ranges_overlap(f.meta.min_key, f.meta.max_key, l0_min, l0_max) {
                inputs.push(f.clone());
            }
        }
        info!(l0_files = l0.len(), total_inputs = inputs.len(), "L0 compaction triggered");
        return Some(CompactionJob { inputs, output_level: 1 });
    }

    for level in 1..crate::manifest::NUM_LEVELS - 1 {
        let level_size: u64 = version.levels[level].iter().map(|f| f.meta.file_size).sum();
        let threshold = config.level_size_base * config.level_size_multiplier.pow((level as u32).saturating_sub(1));
        if level_size > threshold && !version.levels[level].is_empty() {
            let picked = version.levels[level]
                .iter()
                .min_by_key(|f| f.meta.min_key)
                .expect("checked non-empty above")
                .clone();
            let mut inputs = vec![picked.clone()];
            for f in &version.levels[level + 1] {
                if ranges_overlap(f.meta.min_key, f.meta.max_key, picked.meta.min_key, picked.meta.max_key) {
                    inputs.push(f.clone());
                }
            }
            info!(level, level_size, threshold, "level size compaction triggered");
            return Some(CompactionJob { inputs, output_level: level + 1 });
        }
    }
    None
}

fn is_newer(a: &FileMetadata, b: &FileMetadata) -> bool {
    if a.level != b.level {
        a.level < b.level
    } else {
        a.file_number > b.file_number
    }
}

/// Runs one compaction job to completion: merges `job.inputs` by
/// `seq` (newest file wins on key collision), writes one or more
/// output SSTs at `job.output_level`, and commits the resulting
/// `VersionEdit` to the manifest. Input files are not deleted here:
/// the manifest only unlinks a file once no pinned `Version` (such as
/// an in-flight `Get` that planned against the pre-edit version)
/// still references it.
pub fn run(job: CompactionJob, sst_dir: &Path, manifest: &Manifest, config: &CompactionConfig) -> Result<(), CompactionError> {
    let mut merged: BTreeMap<u64, (FileMetadata, u64, Vec<u8>)> = BTreeMap::new();

    for input in &job.inputs {
        for (seq, time, payload) in input.reader.scan(0, u64::MAX)? {
            let replace = match merged.get(&seq) {
                Some((existing_meta, _, _)) => is_newer(&input.meta, existing_meta),
                None => true,
            };
            if replace {
                merged.insert(seq, (input.meta.clone(), time, payload));
            }
        }
    }

    let mut outputs = Vec::new();
    let mut writer: Option<(u64, SSTableWriter)> = None;

    for (seq, (_, time, payload)) in merged {
        if writer.is_none() {
            let file_number = manifest.new_file_number();
            let path = sst_path(sst_dir, file_number);
            writer = Some((file_number, SSTableWriter::create(&path, config.reserved_index_bytes, config.compression)?));
        }
        let (_, w) = writer.as_mut().unwrap();
        w.add(seq, time, &payload)?;
        if w.data_bytes_written() >= config.output_target_bytes {
            let (file_number, w) = writer.take().unwrap();
            let summary = w.finish()?;
            outputs.push(FileMetadata {
                file_number,
                min_key: summary.min_key,
                max_key: summary.max_key,
                file_size: summary.file_size,
                level: job.output_level,
            });
        }
    }
    if let Some((file_number, w)) = writer {
        let summary = w.finish()?;
        outputs.push(FileMetadata {
            file_number,
            min_key: summary.min_key,
            max_key: summary.max_key,
            file_size: summary.file_size,
            level: job.output_level,
        });
    }

    let edit = VersionEdit {
        added: outputs.clone(),
        removed: job.inputs.iter().map(|f| f.meta.file_number).collect(),
    };
    manifest.apply(edit)?;

    info!(
        inputs = job.inputs.len(),
        outputs = outputs.len(),
        output_level = job.output_level,
        "compaction job committed"
    );
    Ok(())
}

/// A background worker that evaluates the compaction policy on a
/// timer and whenever woken by a flush commit, per §4.6 and §9's
/// "named worker threads with a shared stop channel" guidance.
pub struct CompactionWorker {
    handle: Option<JoinHandle<()>>,
    wake: crossbeam::channel::Sender<()>,
    stop: crossbeam::channel::Sender<()>,
}

impl CompactionWorker {
    pub fn spawn(sst_dir: PathBuf, manifest: Arc<Manifest>, config: CompactionConfig) -> Self {
        let (wake_tx, wake_rx) = crossbeam::channel::bounded::<()>(1);
        let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(1);

        let handle = std::thread::Builder::new()
            .name("seqstore-compaction".into())
            .spawn(move || {
                let ticker = crossbeam::channel::tick(config.tick_interval);
                loop {
                    crossbeam::channel::select! {
                        recv(stop_rx) -> _ => {
                            info!("compaction worker stopping");
                            break;
                        }
                        recv(wake_rx) -> _ => {}
                        recv(ticker) -> _ => {}
                    }

                    loop {
                        let version = manifest.current_version();
                        let Some(job) = plan(&version, &config) else { break };
                        if let Err(e) = run(job, &sst_dir, &manifest, &config) {
                            error!(error = %e, "compaction job failed, will retry on next tick");
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn compaction worker thread");

        Self { handle: Some(handle), wake: wake_tx, stop: stop_tx }
    }

    /// Wakes the worker immediately, e.g. after an L0 flush commits.
    pub fn notify(&self) {
        let _ = self.wake.try_send(());
    }

    /// Signals the worker to finish its in-progress job and exit.
    pub fn stop(mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CompactionWorker {
    fn drop(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use tempfile::TempDir;

    fn open_manifest(tmp: &TempDir) -> (Manifest, PathBuf) {
        let sst_dir = tmp.path().join("sst");
        std::fs::create_dir_all(&sst_dir).unwrap();
        (Manifest::open(tmp.path(), &sst_dir).unwrap(), sst_dir)
    }

    fn write_sst(manifest: &Manifest, sst_dir: &Path, seqs: &[u64]) -> FileMetadata {
        let file_number = manifest.new_file_number();
        let path = sst_path(sst_dir, file_number);
        let mut writer = SSTableWriter::create(&path, 64 * 1024, Compression::None).unwrap();
        for &seq in seqs {
            writer.add(seq, seq, &seq.to_le_bytes()).unwrap();
        }
        let summary = writer.finish().unwrap();
        FileMetadata {
            file_number,
            min_key: summary.min_key,
            max_key: summary.max_key,
            file_size: summary.file_size,
            level: 0,
        }
    }

    #[test]
    fn plan_triggers_l0_merge_when_threshold_reached() {
        let tmp = TempDir::new().unwrap();
        let (manifest, sst_dir) = open_manifest(&tmp);
        let f1 = write_sst(&manifest, &sst_dir, &[1, 2, 3]);
        let f2 = write_sst(&manifest, &sst_dir, &[4, 5, 6]);
        manifest.apply(VersionEdit { added: vec![f1, f2], removed: vec![] }).unwrap();

        let config = CompactionConfig { l0_threshold: 2, ..Default::default() };
        let job = plan(&manifest.current_version(), &config).unwrap();
        assert_eq!(job.output_level, 1);
        assert_eq!(job.inputs.len(), 2);
    }

    #[test]
    fn run_merges_l0_into_l1_and_commits_edit() {
        let tmp = TempDir::new().unwrap();
        let (manifest, sst_dir) = open_manifest(&tmp);

        let f1 = write_sst(&manifest, &sst_dir, &[1, 2, 3]);
        let f2 = write_sst(&manifest, &sst_dir, &[4, 5, 6]);
        manifest.apply(VersionEdit { added: vec![f1, f2], removed: vec![] }).unwrap();

        let config = CompactionConfig { l0_threshold: 2, ..Default::default() };
        let job = plan(&manifest.current_version(), &config).unwrap();
        run(job, &sst_dir, &manifest, &config).unwrap();

        let version = manifest.current_version();
        assert!(version.levels[0].is_empty());
        assert_eq!(version.levels[1].len(), 1);

        let output = &version.levels[1][0];
        for seq in 1..=6u64 {
            assert!(output.reader.get(seq).unwrap().is_some());
        }
    }

    #[test]
    fn compaction_unlinks_input_files_once_unpinned() {
        let tmp = TempDir::new().unwrap();
        let (manifest, sst_dir) = open_manifest(&tmp);
        let f1 = write_sst(&manifest, &sst_dir, &[1, 2, 3]);
        let f2 = write_sst(&manifest, &sst_dir, &[4, 5, 6]);
        manifest.apply(VersionEdit { added: vec![f1.clone(), f2.clone()], removed: vec![] }).unwrap();

        let config = CompactionConfig { l0_threshold: 2, ..Default::default() };
        let job = plan(&manifest.current_version(), &config).unwrap();
        run(job, &sst_dir, &manifest, &config).unwrap();

        assert!(!sst_path(&sst_dir, f1.file_number).exists());
        assert!(!sst_path(&sst_dir, f2.file_number).exists());
    }

    #[test]
    fn a_pinned_version_survives_compaction_of_its_inputs() {
        let tmp = TempDir::new().unwrap();
        let (manifest, sst_dir) = open_manifest(&tmp);
        let f1 = write_sst(&manifest, &sst_dir, &[1, 2, 3]);
        let f2 = write_sst(&manifest, &sst_dir, &[4, 5, 6]);
        manifest.apply(VersionEdit { added: vec![f1.clone(), f2], removed: vec![] }).unwrap();

        let pinned = manifest.pin();
        let config = CompactionConfig { l0_threshold: 2, ..Default::default() };
        let job = plan(&manifest.current_version(), &config).unwrap();
        run(job, &sst_dir, &manifest, &config).unwrap();

        // The compacted input is gone from disk-in-the-current-version
        // terms, but the earlier pin still resolves its reader.
        assert!(!sst_path(&sst_dir, f1.file_number).exists());
        let pinned_input = pinned.levels[0].iter().find(|f| f.meta.file_number == f1.file_number).unwrap();
        assert!(pinned_input.reader.get(1).unwrap().is_some());
    }

    #[test]
    fn newest_file_wins_on_key_collision() {
        let tmp = TempDir::new().unwrap();
        let (manifest, sst_dir) = open_manifest(&tmp);

        let older_num = manifest.new_file_number();
        let path = sst_path(&sst_dir, older_num);
        let mut w = SSTableWriter::create(&path, 64 * 1024, Compression::None).unwrap();
        w.add(1, 1, b"old").unwrap();
        let older_summary = w.finish().unwrap();
        let older = FileMetadata { file_number: older_num, min_key: older_summary.min_key, max_key: older_summary.max_key, file_size: older_summary.file_size, level: 0 };

        let newer_num = manifest.new_file_number();
        let path = sst_path(&sst_dir, newer_num);
        let mut w = SSTableWriter::create(&path, 64 * 1024, Compression::None).unwrap();
        w.add(1, 2, b"new").unwrap();
        let newer_summary = w.finish().unwrap();
        let newer = FileMetadata { file_number: newer_num, min_key: newer_summary.min_key, max_key: newer_summary.max_key, file_size: newer_summary.file_size, level: 0 };

        manifest
            .apply(VersionEdit { added: vec![older.clone(), newer.clone()], removed: vec![] })
            .unwrap();

        let config = CompactionConfig { l0_threshold: 2, ..Default::default() };
        let job = plan(&manifest.current_version(), &config).unwrap();
        run(job, &sst_dir, &manifest, &config).unwrap();

        let version = manifest.current_version();
        let output = &version.levels[1][0];
        let (_, payload) = output.reader.get(1).unwrap().unwrap();
        assert_eq!(payload, b"new");
    }
}
