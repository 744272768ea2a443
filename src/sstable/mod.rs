//! The immutable, self-indexed on-disk table file (SST).
//!
//! A single SST file is laid out as a 256-byte header, a pre-reserved
//! B+Tree index region, and a data region of framed records. See
//! [`btree`] for the index itself.

pub mod btree;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc32fast::Hasher as Crc32;
use memmap2::{Mmap, MmapOptions};
use thiserror::Error;
use tracing::{debug, warn};

use btree::{BTreeBuilder, DataPointer};

/// Path of the SST file with the given `file_number` under `sst_dir`.
pub fn sst_path(sst_dir: &Path, file_number: u64) -> PathBuf {
    sst_dir.join(format!("{file_number:06}.sst"))
}

/// Size in bytes of the fixed SST header.
pub const HEADER_SIZE: u64 = 256;
const MAGIC: u32 = 0x5353_5433; // "SST3"
const FORMAT_VERSION: u32 = 1;
const ROW_MAGIC: u32 = 0x524F_5733;
const HEADER_CRC_COVERED_LEN: usize = 128;

/// Errors produced by SST reads and writes.
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Header magic/version mismatch, CRC failure, or a malformed
    /// node or record frame.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// The writer's pre-reserved index region ran out of space.
    #[error("SST index region exhausted")]
    IndexExhausted,

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Record compression applied to the SST's data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Snappy,
}

impl Compression {
    fn to_byte(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Snappy => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, SSTableError> {
        match byte {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Snappy),
            other => Err(SSTableError::Corruption(format!("unrecognised compression byte {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
struct Header {
    compression: Compression,
    index_offset: u64,
    index_size: u64,
    root_offset: u64,
    data_offset: u64,
    data_size: u64,
    row_count: u64,
    min_key: i64,
    max_key: i64,
    min_time: u64,
    max_time: u64,
}

impl Header {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[8] = self.compression.to_byte();
        buf[32..40].copy_from_slice(&self.index_offset.to_le_bytes());
        buf[40..48].copy_from_slice(&self.index_size.to_le_bytes());
        buf[48..56].copy_from_slice(&self.root_offset.to_le_bytes());
        buf[64..72].copy_from_slice(&self.data_offset.to_le_bytes());
        buf[72..80].copy_from_slice(&self.data_size.to_le_bytes());
        buf[80..88].copy_from_slice(&self.row_count.to_le_bytes());
        buf[96..104].copy_from_slice(&self.min_key.to_le_bytes());
        buf[104..112].copy_from_slice(&self.max_key.to_le_bytes());
        buf[112..120].copy_from_slice(&self.min_time.to_le_bytes());
        buf[120..128].copy_from_slice(&self.max_time.to_le_bytes());

        let mut hasher = Crc32::new();
        hasher.update(&buf[0..HEADER_CRC_COVERED_LEN]);
        buf[128..132].copy_from_slice(&hasher.finalize().to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self, SSTableError> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(SSTableError::Corruption("file shorter than SST header".into()));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(SSTableError::Corruption(format!("bad SST magic: 0x{magic:08X}")));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(SSTableError::Corruption(format!("unsupported SST format version {version}")));
        }
        let compression = Compression::from_byte(buf[8])?;

        let stored_crc = u32::from_le_bytes(buf[128..132].try_into().unwrap());
        let mut hasher = Crc32::new();
        hasher.update(&buf[0..HEADER_CRC_COVERED_LEN]);
        if hasher.finalize() != stored_crc {
            return Err(SSTableError::Corruption("SST header CRC mismatch".into()));
        }

        Ok(Header {
            compression,
            index_offset: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            index_size: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            root_offset: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
            data_offset: u64::from_le_bytes(buf[64..72].try_into().unwrap()),
            data_size: u64::from_le_bytes(buf[72..80].try_into().unwrap()),
            row_count: u64::from_le_bytes(buf[80..88].try_into().unwrap()),
            min_key: i64::from_le_bytes(buf[96..104].try_into().unwrap()),
            max_key: i64::from_le_bytes(buf[104..112].try_into().unwrap()),
            min_time: u64::from_le_bytes(buf[112..120].try_into().unwrap()),
            max_time: u64::from_le_bytes(buf[120..128].try_into().unwrap()),
        })
    }
}

/// Summary statistics produced once an [`SSTableWriter`] finishes,
/// used by the caller (flush/compaction worker) to build the
/// manifest's `FileMetadata` entry.
#[derive(Debug, Clone)]
pub struct SSTableSummary {
    pub row_count: u64,
    pub min_key: u64,
    pub max_key: u64,
    pub file_size: u64,
}

/// Writes one SST file following the builder algorithm of the
/// original component design: reserve the index region up front,
/// stream records into the data region, then build the B+Tree and
/// seal the header last.
pub struct SSTableWriter {
    file: File,
    path: PathBuf,
    reserved_index_bytes: u64,
    compression: Compression,
    data_cursor: u64,
    builder: BTreeBuilder,
    row_count: u64,
    min_key: Option<i64>,
    max_key: Option<i64>,
    min_time: Option<u64>,
    max_time: Option<u64>,
}

impl SSTableWriter {
    /// Creates a new SST file at `path`, reserving `reserved_index_bytes`
    /// for the B+Tree index immediately after the header.
    pub fn create<P: AsRef<Path>>(
        path: P,
        reserved_index_bytes: u64,
        compression: Compression,
    ) -> Result<Self, SSTableError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).write(true).read(true).truncate(true).open(&path)?;
        let data_offset = HEADER_SIZE + reserved_index_bytes;
        Ok(Self {
            file,
            path,
            reserved_index_bytes,
            compression,
            data_cursor: data_offset,
            builder: BTreeBuilder::new(HEADER_SIZE, reserved_index_bytes),
            row_count: 0,
            min_key: None,
            max_key: None,
            min_time: None,
            max_time: None,
        })
    }

    /// Appends one record. Keys (`seq`) must arrive in strictly
    /// ascending order, as required by the B+Tree builder contract.
    pub fn add(&mut self, seq: u64, time: u64, payload: &[u8]) -> Result<(), SSTableError> {
        let mut frame = Vec::with_capacity(24 + payload.len());
        frame.extend_from_slice(&ROW_MAGIC.to_le_bytes());
        frame.extend_from_slice(&seq.to_le_bytes());
        frame.extend_from_slice(&time.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);

        let on_disk = match self.compression {
            Compression::None => frame,
            Compression::Snappy => snap::raw::Encoder::new()
                .compress_vec(&frame)
                .map_err(|e| SSTableError::Internal(format!("snappy compression failed: {e}")))?,
        };

        self.file.seek(SeekFrom::Start(self.data_cursor))?;
        self.file.write_all(&on_disk)?;

        let size = on_disk.len() as u32;
        self.builder.add(seq as i64, DataPointer { offset: self.data_cursor, size })?;
        self.data_cursor += size as u64;

        self.row_count += 1;
        self.min_key = Some(self.min_key.map_or(seq as i64, |m| m.min(seq as i64)));
        self.max_key = Some(self.max_key.map_or(seq as i64, |m| m.max(seq as i64)));
        self.min_time = Some(self.min_time.map_or(time, |m| m.min(time)));
        self.max_time = Some(self.max_time.map_or(time, |m| m.max(time)));
        Ok(())
    }

    /// Bytes of record data written to the data region so far, used
    /// by the compaction worker to decide when to roll over to a new
    /// output file.
    pub fn data_bytes_written(&self) -> u64 {
        self.data_cursor.saturating_sub(HEADER_SIZE + self.reserved_index_bytes)
    }

    /// Finalises the file: builds the B+Tree, writes the index region,
    /// writes the header last, and fsyncs.
    pub fn finish(mut self) -> Result<SSTableSummary, SSTableError> {
        let data_offset = HEADER_SIZE + self.reserved_index_bytes;
        let (root_offset, index_bytes) = self.builder.finish()?;

        self.file.seek(SeekFrom::Start(HEADER_SIZE))?;
        self.file.write_all(&index_bytes)?;

        let header = Header {
            compression: self.compression,
            index_offset: HEADER_SIZE,
            index_size: self.reserved_index_bytes,
            root_offset,
            data_offset,
            data_size: self.data_cursor.saturating_sub(data_offset),
            row_count: self.row_count,
            min_key: self.min_key.unwrap_or(0),
            max_key: self.max_key.unwrap_or(0),
            min_time: self.min_time.unwrap_or(0),
            max_time: self.max_time.unwrap_or(0),
        };
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.to_bytes())?;
        self.file.set_len(self.data_cursor)?;
        self.file.sync_all()?;

        debug!(path = %self.path.display(), rows = self.row_count, "sealed SST file");

        Ok(SSTableSummary {
            row_count: self.row_count,
            min_key: header.min_key as u64,
            max_key: header.max_key as u64,
            file_size: self.data_cursor,
        })
    }
}

/// A sealed, read-only SST file, opened via a zero-copy memory map.
pub struct SSTableReader {
    mmap: Arc<Mmap>,
    header: Header,
    path: PathBuf,
}

impl std::fmt::Debug for SSTableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTableReader")
            .field("path", &self.path)
            .finish()
    }
}

impl SSTableReader {
    /// Opens and validates an SST file's header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SSTableError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mut header_buf = vec![0u8; HEADER_SIZE as usize];
        {
            let mut f = &file;
            f.seek(SeekFrom::Start(0))?;
            f.read_exact(&mut header_buf).map_err(|e| {
                SSTableError::Corruption(format!("failed to read SST header from {}: {e}", path.display()))
            })?;
        }
        let header = Header::from_bytes(&header_buf).map_err(|e| {
            warn!(path = %path.display(), error = %e, "SST header failed validation");
            e
        })?;

        let mmap = unsafe { MmapOptions::new().map(&file)? };
        debug!(path = %path.display(), rows = header.row_count, "opened SST file");

        Ok(Self { mmap: Arc::new(mmap), header, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn min_key(&self) -> u64 {
        self.header.min_key as u64
    }

    pub fn max_key(&self) -> u64 {
        self.header.max_key as u64
    }

    pub fn row_count(&self) -> u64 {
        self.header.row_count
    }

    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Looks up `seq`, descending the embedded B+Tree and decoding the
    /// record it points to, if present.
    pub fn get(&self, seq: u64) -> Result<Option<(u64, Vec<u8>)>, SSTableError> {
        let Some(ptr) = btree::get(&self.mmap, self.header.root_offset, seq as i64)? else {
            return Ok(None);
        };
        self.decode_at(ptr).map(Some)
    }

    /// Returns every `(seq, time, payload)` record with `seq` in
    /// `[from_seq, to_seq]`, in ascending order.
    pub fn scan(&self, from_seq: u64, to_seq: u64) -> Result<Vec<(u64, u64, Vec<u8>)>, SSTableError> {
        let entries = btree::iter_all(&self.mmap, self.header.root_offset)?;
        let mut out = Vec::new();
        for (key, ptr) in entries {
            let seq = key as u64;
            if seq < from_seq || seq > to_seq {
                continue;
            }
            let (time, payload) = self.decode_at(ptr)?;
            out.push((seq, time, payload));
        }
        Ok(out)
    }

    fn decode_at(&self, ptr: DataPointer) -> Result<(u64, Vec<u8>), SSTableError> {
        let start = ptr.offset as usize;
        let end = start
            .checked_add(ptr.size as usize)
            .filter(|&e| e <= self.mmap.len())
            .ok_or_else(|| SSTableError::Corruption("record pointer out of bounds".into()))?;
        let raw = &self.mmap[start..end];

        let frame = match self.header.compression {
            Compression::None => raw.to_vec(),
            Compression::Snappy => snap::raw::Decoder::new()
                .decompress_vec(raw)
                .map_err(|e| SSTableError::Corruption(format!("snappy decompression failed: {e}")))?,
        };

        if frame.len() < 24 {
            return Err(SSTableError::Corruption("record frame shorter than fixed header".into()));
        }
        let row_magic = u32::from_le_bytes(frame[0..4].try_into().unwrap());
        if row_magic != ROW_MAGIC {
            return Err(SSTableError::Corruption(format!("bad record magic: 0x{row_magic:08X}")));
        }
        let time = u64::from_le_bytes(frame[12..20].try_into().unwrap());
        let payload_len = u32::from_le_bytes(frame[20..24].try_into().unwrap()) as usize;
        if frame.len() < 24 + payload_len {
            return Err(SSTableError::Corruption("record frame truncated before payload end".into()));
        }
        Ok((time, frame[24..24 + payload_len].to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_round_trips() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.sst");
        let mut writer = SSTableWriter::create(&path, 1024 * 1024, Compression::None).unwrap();
        for seq in 1..=100u64 {
            writer.add(seq, seq * 10, format!("payload-{seq}").as_bytes()).unwrap();
        }
        let summary = writer.finish().unwrap();
        assert_eq!(summary.row_count, 100);
        assert_eq!(summary.min_key, 1);
        assert_eq!(summary.max_key, 100);

        let reader = SSTableReader::open(&path).unwrap();
        assert_eq!(reader.row_count(), 100);
        let (time, payload) = reader.get(42).unwrap().unwrap();
        assert_eq!(time, 420);
        assert_eq!(payload, b"payload-42");
        assert!(reader.get(101).unwrap().is_none());
    }

    #[test]
    fn snappy_compression_round_trips() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000002.sst");
        let mut writer = SSTableWriter::create(&path, 1024 * 1024, Compression::Snappy).unwrap();
        for seq in 1..=20u64 {
            writer.add(seq, seq, &vec![b'x'; 200]).unwrap();
        }
        writer.finish().unwrap();

        let reader = SSTableReader::open(&path).unwrap();
        let (_, payload) = reader.get(10).unwrap().unwrap();
        assert_eq!(payload, vec![b'x'; 200]);
    }

    #[test]
    fn scan_returns_ordered_range() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000003.sst");
        let mut writer = SSTableWriter::create(&path, 1024 * 1024, Compression::None).unwrap();
        for seq in 1..=500u64 {
            writer.add(seq, seq, &seq.to_le_bytes()).unwrap();
        }
        writer.finish().unwrap();

        let reader = SSTableReader::open(&path).unwrap();
        let rows = reader.scan(100, 105).unwrap();
        let seqs: Vec<u64> = rows.iter().map(|(s, _, _)| *s).collect();
        assert_eq!(seqs, vec![100, 101, 102, 103, 104, 105]);
    }

    #[test]
    fn header_crc_mismatch_surfaces_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000004.sst");
        let mut writer = SSTableWriter::create(&path, 64 * 1024, Compression::None).unwrap();
        writer.add(1, 1, b"a").unwrap();
        writer.finish().unwrap();

        let mut f = OpenOptions::new().write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(10)).unwrap();
        f.write_all(&[0xFF]).unwrap();
        f.sync_all().unwrap();

        let err = SSTableReader::open(&path).unwrap_err();
        assert!(matches!(err, SSTableError::Corruption(_)));
    }

    #[test]
    fn header_consistency_invariant_holds() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000005.sst");
        let mut writer = SSTableWriter::create(&path, 256 * 1024, Compression::None).unwrap();
        for seq in [3u64, 7, 9, 15] {
            writer.add(seq, seq, &[]).unwrap();
        }
        let summary = writer.finish().unwrap();

        let reader = SSTableReader::open(&path).unwrap();
        assert_eq!(reader.row_count(), summary.row_count);
        assert_eq!(reader.min_key(), 3);
        assert_eq!(reader.max_key(), 15);
        let all = btree::iter_all(&reader.mmap, reader.header.root_offset).unwrap();
        assert_eq!(all.len() as u64, reader.row_count());
    }
}
