//! An embeddable, append-only storage engine built on a Log-Structured
//! Merge (LSM) tree, keyed by a monotonically increasing sequence
//! number.
//!
//! Records are durably persisted via a write-ahead log, buffered in
//! ordered in-memory tables, and periodically flushed into immutable,
//! self-indexed SST files organised into levels. A background worker
//! compacts files upward through the levels to bound read
//! amplification.
//!
//! # Quick start
//!
//! ```no_run
//! use seqstore::{Engine, EngineConfig};
//!
//! let engine = Engine::open("/tmp/my-db").unwrap();
//! let table = engine.create_table("events", EngineConfig::default()).unwrap();
//!
//! let seq = table.put(1_700_000_000, b"hello".to_vec()).unwrap();
//! let (_, payload) = table.get(seq).unwrap();
//! assert_eq!(payload, b"hello");
//!
//! engine.close().unwrap();
//! ```
//!
//! The engine does not interpret payloads: schema validation, field
//! encoding, and query planning are the concern of the layer above
//! this crate.

pub mod compaction;
pub mod encoding;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod wal;

pub use engine::{Engine, EngineConfig, EngineError, Table, TableOptions, TableStats};
