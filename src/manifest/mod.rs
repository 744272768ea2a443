//! The version set: an append-only log of [`VersionEdit`]s that lets
//! the engine reconstruct, at any point in time, which SST files
//! belong to which LSM level.
//!
//! Each [`Version`] carries not just file metadata but an already-open
//! reader for every file it references (see [`VersionFile`]). Pinning
//! a `Version` (cloning its `Arc`) therefore keeps the underlying
//! mmap'd files mapped for as long as the pin is held, even if a
//! concurrent compaction commits an edit that drops the file from the
//! *current* version. Physical deletion of a superseded file is
//! deferred until no live `Version` still references it.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{decode_from_slice, encode_to_vec, Decode, Encode, EncodingError};
use crate::sstable::{sst_path, SSTableError, SSTableReader};

/// Highest level permitted (L0..=L6), per §6's `MaxLevels` default.
pub const NUM_LEVELS: usize = 7;

const MANIFEST_FILE_NAME: &str = "MANIFEST";
const CURRENT_FILE_NAME: &str = "CURRENT";

/// Errors produced by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("manifest corruption: {0}")]
    Corruption(String),

    #[error(transparent)]
    SSTable(#[from] SSTableError),
}

/// Metadata describing one SST file within a [`Version`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub file_number: u64,
    pub min_key: u64,
    pub max_key: u64,
    pub file_size: u64,
    pub level: usize,
}

impl Encode for FileMetadata {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.file_number.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)?;
        self.file_size.encode_to(buf)?;
        (self.level as u64).encode_to(buf)?;
        Ok(())
    }
}

impl Decode for FileMetadata {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (file_number, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (min_key, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (max_key, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (file_size, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (level, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            FileMetadata { file_number, min_key, max_key, file_size, level: level as usize },
            offset,
        ))
    }
}

/// An atomic description of files added and removed between two
/// [`Version`]s.
#[derive(Debug, Clone, Default)]
pub struct VersionEdit {
    pub added: Vec<FileMetadata>,
    pub removed: Vec<u64>,
}

impl Encode for VersionEdit {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        crate::encoding::encode_vec(&self.added, buf)?;
        crate::encoding::encode_vec(&self.removed, buf)?;
        Ok(())
    }
}

impl Decode for VersionEdit {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (added, n1) = crate::encoding::decode_vec::<FileMetadata>(buf)?;
        let (removed, n2) = crate::encoding::decode_vec::<u64>(&buf[n1..])?;
        Ok((VersionEdit { added, removed }, n1 + n2))
    }
}

enum ManifestEntry {
    FileNumberHighWaterMark(u64),
    Edit(VersionEdit),
}

impl Encode for ManifestEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            ManifestEntry::FileNumberHighWaterMark(n) => {
                0u8.encode_to(buf)?;
                n.encode_to(buf)?;
            }
            ManifestEntry::Edit(edit) => {
                1u8.encode_to(buf)?;
                edit.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for ManifestEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u8::decode_from(buf)?;
        match tag {
            0 => {
                let (n, consumed) = u64::decode_from(&buf[offset..])?;
                offset += consumed;
                Ok((ManifestEntry::FileNumberHighWaterMark(n), offset))
            }
            1 => {
                let (edit, consumed) = VersionEdit::decode_from(&buf[offset..])?;
                offset += consumed;
                Ok((ManifestEntry::Edit(edit), offset))
            }
            other => Err(EncodingError::InvalidTag { tag: other as u32, type_name: "ManifestEntry" }),
        }
    }
}

/// One file within a [`Version`]: its metadata plus an already-open,
/// mmap-backed reader. Cloning a `Version` (via its `Arc`) clones
/// these reader handles too, which is exactly what keeps a pinned
/// read consistent across a concurrent compaction (see module docs).
#[derive(Clone)]
pub struct VersionFile {
    pub meta: FileMetadata,
    pub reader: Arc<SSTableReader>,
}

/// An immutable snapshot of which SST files belong to each level.
///
/// Per the data model invariants: L0 files may overlap; files at
/// `L >= 1` are pairwise non-overlapping and kept sorted by `min_key`.
#[derive(Clone, Default)]
pub struct Version {
    pub levels: [Vec<VersionFile>; NUM_LEVELS],
}

impl Version {
    /// All file numbers referenced by this version, used for orphan
    /// garbage collection and for deciding which open readers are
    /// still pinned.
    pub fn all_file_numbers(&self) -> Vec<u64> {
        self.levels.iter().flatten().map(|f| f.meta.file_number).collect()
    }

    fn metadata_levels(&self) -> [Vec<FileMetadata>; NUM_LEVELS] {
        let mut out: [Vec<FileMetadata>; NUM_LEVELS] = Default::default();
        for (i, level) in self.levels.iter().enumerate() {
            out[i] = level.iter().map(|f| f.meta.clone()).collect();
        }
        out
    }
}

/// Applies `edit` to a plain metadata view of a version's levels.
/// Pure and I/O-free; [`Manifest::build_version`] turns the result
/// into a real `Version` by opening a reader per file.
fn apply_metadata(levels: &[Vec<FileMetadata>; NUM_LEVELS], edit: &VersionEdit) -> [Vec<FileMetadata>; NUM_LEVELS] {
    let mut levels = levels.clone();
    for level in &mut levels {
        level.retain(|f| !edit.removed.contains(&f.file_number));
    }
    for file in &edit.added {
        levels[file.level].push(file.clone());
    }
    for (level_idx, level) in levels.iter_mut().enumerate() {
        if level_idx >= 1 {
            level.sort_by_key(|f| f.min_key);
        }
    }
    levels
}

/// Append-only, fsync-backed log of [`VersionEdit`]s plus the
/// monotonic file-number allocator, and the in-memory current
/// [`Version`] it reconstructs.
///
/// `open_files` is the refcount GC registry of §9: it holds one
/// `Arc<SSTableReader>` per file number known to any version that has
/// ever been current. A file is only unmapped and unlinked once its
/// entry's strong count drops to one, i.e. no live `Version` (current
/// or pinned-but-superseded) references it any more.
pub struct Manifest {
    dir: PathBuf,
    sst_dir: PathBuf,
    log_file: Mutex<File>,
    next_file_number: AtomicU64,
    current: RwLock<Arc<Version>>,
    open_files: Mutex<HashMap<u64, Arc<SSTableReader>>>,
}

impl std::fmt::Debug for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manifest")
            .field("dir", &self.dir)
            .field("sst_dir", &self.sst_dir)
            .finish()
    }
}

impl Manifest {
    /// Opens the manifest under `dir`, creating one if absent, and
    /// replaying it to reconstruct the current [`Version`]. SST files
    /// referenced by the replayed version are opened (and their
    /// headers validated) eagerly, so a corrupt file is surfaced here
    /// rather than on the first `Get` that happens to touch it.
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(dir: P, sst_dir: Q) -> Result<Self, ManifestError> {
        let dir = dir.as_ref().to_path_buf();
        let sst_dir = sst_dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let manifest_path = dir.join(MANIFEST_FILE_NAME);
        let current_path = dir.join(CURRENT_FILE_NAME);

        if !manifest_path.exists() {
            File::create(&manifest_path)?;
            let mut current = File::create(&current_path)?;
            current.write_all(MANIFEST_FILE_NAME.as_bytes())?;
            current.sync_all()?;
        }

        let mut file = OpenOptions::new().read(true).append(true).open(&manifest_path)?;
        let mut bytes = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut bytes)?;

        let mut metadata: [Vec<FileMetadata>; NUM_LEVELS] = Default::default();
        let mut high_water_mark = 0u64;
        let mut offset = 0usize;
        while offset < bytes.len() {
            match Self::read_frame(&bytes[offset..]) {
                Ok(Some((entry, consumed))) => {
                    offset += consumed;
                    match entry {
                        ManifestEntry::FileNumberHighWaterMark(n) => high_water_mark = high_water_mark.max(n),
                        ManifestEntry::Edit(edit) => metadata = apply_metadata(&metadata, &edit),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(ManifestError::Corruption(format!("manifest log corrupt at offset {offset}: {e}")));
                }
            }
        }

        let manifest = Self {
            dir,
            sst_dir,
            log_file: Mutex::new(file),
            next_file_number: AtomicU64::new(high_water_mark),
            current: RwLock::new(Arc::new(Version::default())),
            open_files: Mutex::new(HashMap::new()),
        };
        let version = manifest.build_version(metadata)?;
        let file_count = version.all_file_numbers().len();
        *manifest.current.write().expect("manifest version lock poisoned") = Arc::new(version);

        info!(dir = %manifest.dir.display(), files = file_count, high_water_mark, "replayed manifest");
        Ok(manifest)
    }

    fn read_frame(buf: &[u8]) -> Result<Option<(ManifestEntry, usize)>, ManifestError> {
        if buf.len() < 8 {
            return Ok(None);
        }
        let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        if buf.len() < 4 + len + 4 {
            return Ok(None);
        }
        let body = &buf[4..4 + len];
        let stored_crc = u32::from_le_bytes(buf[4 + len..4 + len + 4].try_into().unwrap());
        let mut hasher = Crc32::new();
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            return Ok(None);
        }
        let (entry, consumed) = decode_from_slice::<ManifestEntry>(body)?;
        if consumed != body.len() {
            return Err(ManifestError::Corruption("trailing bytes after manifest entry".into()));
        }
        Ok(Some((entry, 4 + len + 4)))
    }

    fn append_entry(&self, entry: &ManifestEntry) -> Result<(), ManifestError> {
        let body = encode_to_vec(entry)?;
        let mut frame = Vec::with_capacity(8 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        let mut hasher = Crc32::new();
        hasher.update(&body);
        frame.extend_from_slice(&hasher.finalize().to_le_bytes());

        let mut file = self.log_file.lock().expect("manifest log mutex poisoned");
        file.write_all(&frame)?;
        file.sync_all()?;
        Ok(())
    }

    /// Returns the already-open reader for `file_number`, opening
    /// (and header-validating) it on first reference.
    fn get_or_open_reader(&self, file_number: u64) -> Result<Arc<SSTableReader>, ManifestError> {
        let mut open_files = self.open_files.lock().expect("open files lock poisoned");
        if let Some(reader) = open_files.get(&file_number) {
            return Ok(Arc::clone(reader));
        }
        let path = sst_path(&self.sst_dir, file_number);
        let reader = Arc::new(SSTableReader::open(&path)?);
        open_files.insert(file_number, Arc::clone(&reader));
        Ok(reader)
    }

    /// Turns a plain metadata view into a real [`Version`] by
    /// attaching an open reader to every file.
    fn build_version(&self, metadata: [Vec<FileMetadata>; NUM_LEVELS]) -> Result<Version, ManifestError> {
        let mut levels: [Vec<VersionFile>; NUM_LEVELS] = Default::default();
        for (i, level) in metadata.into_iter().enumerate() {
            let mut files = Vec::with_capacity(level.len());
            for meta in level {
                let reader = self.get_or_open_reader(meta.file_number)?;
                files.push(VersionFile { meta, reader });
            }
            levels[i] = files;
        }
        Ok(Version { levels })
    }

    /// Allocates the next monotonic file number. File numbers are
    /// never reused.
    pub fn new_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Durably appends `edit` to the manifest log, then atomically
    /// swaps the in-memory current [`Version`] pointer. Files dropped
    /// by `edit` are not deleted here; [`Self::sweep_orphaned_files`]
    /// deletes them once no live version still references them.
    pub fn apply(&self, edit: VersionEdit) -> Result<(), ManifestError> {
        self.append_entry(&ManifestEntry::FileNumberHighWaterMark(
            self.next_file_number.load(Ordering::SeqCst),
        ))?;
        self.append_entry(&ManifestEntry::Edit(edit.clone()))?;

        let current_metadata = self.current_version().metadata_levels();
        let new_metadata = apply_metadata(&current_metadata, &edit);
        let new_version = self.build_version(new_metadata)?;

        {
            let mut current = self.current.write().expect("manifest version lock poisoned");
            *current = Arc::new(new_version);
        }
        info!(added = edit.added.len(), removed = edit.removed.len(), "applied version edit");

        self.sweep_orphaned_files();
        Ok(())
    }

    /// Returns a reference-counted snapshot of the current version,
    /// safe to read without holding the version lock.
    pub fn current_version(&self) -> Arc<Version> {
        Arc::clone(&self.current.read().expect("manifest version lock poisoned"))
    }

    /// Pins a version for the duration the caller holds the returned
    /// `Arc`; the version, and the mmap'd reader of every file it
    /// references, stays alive until the last pin is dropped, even if
    /// a concurrent `apply` removes those files from the *current*
    /// version.
    pub fn pin(&self) -> Arc<Version> {
        self.current_version()
    }

    /// Releases a pinned version. A plain `drop` would do the same;
    /// this exists to name the operation at call sites per §4.5. Once
    /// the last pin referencing a file is released, the next `apply`
    /// sweeps it off disk.
    pub fn unpin(version: Arc<Version>) {
        drop(version);
    }

    /// Deletes files that are no longer referenced by the current
    /// version *and* have no other live version still holding a
    /// reader for them (the registry's own clone is the only
    /// remaining strong reference). Called after every `apply`.
    fn sweep_orphaned_files(&self) {
        let referenced: HashSet<u64> = self.current_version().all_file_numbers().into_iter().collect();
        let mut open_files = self.open_files.lock().expect("open files lock poisoned");
        let orphans: Vec<u64> = open_files.keys().filter(|n| !referenced.contains(n)).copied().collect();
        for file_number in orphans {
            let Some(reader) = open_files.get(&file_number) else { continue };
            if Arc::strong_count(reader) > 1 {
                // Still referenced by a pinned (but superseded) version; try again next apply.
                continue;
            }
            let reader = open_files.remove(&file_number).expect("checked present above");
            drop(reader);
            let path = sst_path(&self.sst_dir, file_number);
            match fs::remove_file(&path) {
                Ok(()) => debug!(file_number, path = %path.display(), "deleted obsolete SST file"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to delete obsolete SST file"),
            }
        }
    }

    /// Deletes SST files under the table's SST directory that are not
    /// referenced by the current version, as orphaned leftovers of a
    /// crashed flush or compaction. Returns the paths removed.
    pub fn garbage_collect(&self) -> Result<Vec<PathBuf>, ManifestError> {
        if !self.sst_dir.exists() {
            return Ok(Vec::new());
        }
        let referenced: HashSet<u64> = self.current_version().all_file_numbers().into_iter().collect();
        let mut removed = Vec::new();
        for entry in fs::read_dir(&self.sst_dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            let Ok(file_number) = stem.parse::<u64>() else { continue };
            if !referenced.contains(&file_number) {
                warn!(path = %path.display(), "deleting orphan SST file at open");
                fs::remove_file(&path)?;
                removed.push(path);
            }
        }
        Ok(removed)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
