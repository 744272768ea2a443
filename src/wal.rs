//! Write-Ahead Log (WAL) Module
//!
//! This module implements the **durable**, **append-only** journal that
//! backs a single active [`crate::memtable::MemTable`].
//!
//! ## On-disk layout
//!
//! ```text
//! [MAGIC:4][SEQ:8][TIME:8][PAYLOAD_LEN:4][PAYLOAD:PAYLOAD_LEN][CRC32:4]
//! [MAGIC:4][SEQ:8][TIME:8][PAYLOAD_LEN:4][PAYLOAD:PAYLOAD_LEN][CRC32:4]
//! ...
//! ```
//!
//! There is no file header — a WAL segment is nothing but a sequence of
//! these frames. The CRC32 is computed over every preceding field of the
//! frame (magic through payload) so a single bit flip anywhere is caught.
//!
//! # Durability
//!
//! [`Wal::append`] writes the frame and, unless the caller asked for
//! relaxed per-batch durability, calls [`File::sync_all`] before
//! returning. A record is only considered durable once `append` returns
//! `Ok(())`.
//!
//! # Recovery semantics
//!
//! [`Wal::iter`] replays frames from the start of the file. The first
//! frame that fails to parse — bad magic, a truncated read, or a CRC
//! mismatch — is treated as the tail of an interrupted write: the
//! iterator stops cleanly and yields no error. This is the expected
//! shape of a WAL segment left behind by a process kill mid-`append`.
//! Everything read before that point is valid and is returned as-is.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{trace, warn};

/// Magic value prefixing every WAL frame (`"RSEQ"`).
const FRAME_MAGIC: [u8; 4] = *b"RSEQ";
const FRAME_FIXED_LEN: usize = 4 + 8 + 8 + 4 + 4; // magic + seq + time + payload_len + crc32

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A single durable record as stored in (and replayed from) the WAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Monotonic sequence number assigned by the engine.
    pub seq: u64,
    /// Caller-supplied insertion timestamp.
    pub time: u64,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

/// A sequential, fsync-backed journal of [`WalRecord`] frames.
///
/// One `Wal` backs exactly one memtable for its lifetime: created when
/// the memtable is created, appended to on every `put`, and removed
/// once the memtable has been durably flushed to an SSTable.
#[derive(Debug)]
pub struct Wal {
    file: Arc<Mutex<File>>,
    path: PathBuf,
    /// Numeric segment identifier (matches the memtable's WAL number).
    pub number: u64,
    sync_on_append: bool,
}

impl Wal {
    /// Opens or creates a WAL segment at `path`.
    ///
    /// If the file already exists, the write cursor is positioned at
    /// its current end so that `append` continues the segment rather
    /// than overwriting it. Replaying prior contents is the caller's
    /// responsibility via [`Wal::iter`].
    pub fn open<P: AsRef<Path>>(path: P, number: u64, sync_on_append: bool) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        trace!(path = %path.display(), number, "opened WAL segment");

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path,
            number,
            sync_on_append,
        })
    }

    /// Appends one record to the WAL.
    ///
    /// Returns once the frame is written and, if `sync_on_append` is
    /// set, fsynced. The record is durable only after this returns
    /// `Ok(())`.
    pub fn append(&self, seq: u64, time: u64, payload: &[u8]) -> Result<(), WalError> {
        let frame = Self::encode_frame(seq, time, payload);

        let mut guard = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))?;

        guard.write_all(&frame)?;
        if self.sync_on_append {
            guard.sync_all()?;
        }
        Ok(())
    }

    /// Forces any buffered writes to durable storage.
    ///
    /// Used by the memtable manager to flush a batch of relaxed-durability
    /// appends at once when `SyncOnAppend` is disabled.
    pub fn sync(&self) -> Result<(), WalError> {
        let guard = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))?;
        guard.sync_all()?;
        Ok(())
    }

    /// Returns an iterator that replays every valid frame from the
    /// start of the file. See module docs for truncation semantics.
    pub fn iter(&self) -> Result<WalIter, WalError> {
        let guard = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))?;
        let file = guard.try_clone()?;
        Ok(WalIter {
            file,
            offset: 0,
            ended: false,
        })
    }

    /// Path of the underlying WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the WAL, fsyncing any pending writes.
    pub fn close(self) -> Result<(), WalError> {
        self.sync()
    }

    /// Removes the WAL file from disk.
    ///
    /// Called after the memtable it backed has been durably flushed
    /// to an SSTable and the manifest edit recording that flush is
    /// itself durable.
    pub fn remove(self) -> Result<(), WalError> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(&path)?;
        Ok(())
    }

    fn encode_frame(seq: u64, time: u64, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_FIXED_LEN + payload.len());
        buf.extend_from_slice(&FRAME_MAGIC);
        buf.extend_from_slice(&seq.to_le_bytes());
        buf.extend_from_slice(&time.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);

        let mut hasher = Crc32::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());
        buf
    }
}

/// Streaming replay iterator over a WAL segment.
///
/// Holds its own cloned file handle so replay can proceed independently
/// of any concurrent appender (recovery happens before the WAL is handed
/// to a memtable for live writes, so no such race exists in practice,
/// but the type stays safe either way).
pub struct WalIter {
    file: File,
    offset: u64,
    ended: bool,
}

impl Iterator for WalIter {
    type Item = WalRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.ended {
            return None;
        }

        match self.try_read_frame() {
            Ok(Some(record)) => Some(record),
            Ok(None) => {
                self.ended = true;
                None
            }
            Err(_) => {
                warn!(offset = self.offset, "WAL truncated or corrupt tail; stopping replay");
                self.ended = true;
                None
            }
        }
    }
}

impl WalIter {
    fn try_read_frame(&mut self) -> io::Result<Option<WalRecord>> {
        self.file.seek(SeekFrom::Start(self.offset))?;

        let mut magic = [0u8; 4];
        if !read_exact_or_eof(&mut self.file, &mut magic)? {
            return Ok(None);
        }
        if magic != FRAME_MAGIC {
            return Ok(None);
        }

        let mut seq_bytes = [0u8; 8];
        let mut time_bytes = [0u8; 8];
        let mut len_bytes = [0u8; 4];
        if !read_exact_or_eof(&mut self.file, &mut seq_bytes)? {
            return Ok(None);
        }
        if !read_exact_or_eof(&mut self.file, &mut time_bytes)? {
            return Ok(None);
        }
        if !read_exact_or_eof(&mut self.file, &mut len_bytes)? {
            return Ok(None);
        }

        let payload_len = u32::from_le_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; payload_len];
        if !read_exact_or_eof(&mut self.file, &mut payload)? {
            return Ok(None);
        }

        let mut crc_bytes = [0u8; 4];
        if !read_exact_or_eof(&mut self.file, &mut crc_bytes)? {
            return Ok(None);
        }
        let stored_crc = u32::from_le_bytes(crc_bytes);

        let mut hasher = Crc32::new();
        hasher.update(&magic);
        hasher.update(&seq_bytes);
        hasher.update(&time_bytes);
        hasher.update(&len_bytes);
        hasher.update(&payload);
        if hasher.finalize() != stored_crc {
            return Ok(None);
        }

        self.offset += (FRAME_FIXED_LEN + payload_len) as u64;

        Ok(Some(WalRecord {
            seq: u64::from_le_bytes(seq_bytes),
            time: u64::from_le_bytes(time_bytes),
            payload,
        }))
    }
}

/// Reads exactly `buf.len()` bytes, returning `Ok(false)` on a clean
/// EOF that occurs before any byte of `buf` is filled, and propagating
/// an error for a short/torn read (EOF partway through the buffer).
fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "torn WAL frame"));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
