//! # Tsurugi
//!
//! The per-shard write engine of a distributed search system: versioned
//! index/delete operations under per-uid locking, a durable translog, and
//! flush/refresh/merge/recovery coordination over a segmented document
//! store.
//!
//! ## Features
//!
//! - Per-document versioning (internal, external, external-gte, force)
//! - Striped per-uid locking; different documents index in parallel
//! - Durable write-ahead translog with CRC-checked records and crash replay
//! - Segment commits bound to the translog generation for exactly-once
//!   recovery
//! - Sync-commit markers for quiescent shards
//! - Merge backpressure with reference-counted indexing throttling

pub mod engine;
pub mod error;
pub mod segment;
pub mod storage;
pub mod translog;

// Re-exports for the public API
pub use engine::{
    Clock, Delete, DeleteResult, EngineConfig, EngineSegment, EngineSettings, Get, GetResult,
    Index, IndexResult, InternalEngine, ManualClock, MergeStats, OpenMode, Origin, ParsedDocument,
    SyncedFlushResult, SystemClock, Term, VersionType,
};
pub use error::{Result, TsurugiError};
pub use segment::{CommitId, IndexCommit, SegmentInfos};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageConfig};
pub use translog::{Location, Translog, TranslogConfig, TranslogGeneration};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
