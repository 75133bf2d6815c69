//! The per-shard write engine and its supporting pieces.

pub mod config;
pub(crate) mod executor;
pub mod internal;
pub mod keyed_lock;
pub mod merge_scheduler;
pub mod operation;
pub mod throttle;
pub mod version;
pub mod version_map;

pub use config::{Clock, EngineConfig, EngineSettings, ManualClock, OpenMode, SystemClock};
pub use internal::{
    EngineSegment, InternalEngine, SyncedFlushResult, MAX_UNSAFE_AUTO_ID_TIMESTAMP_KEY,
    SYNC_COMMIT_ID,
};
pub use merge_scheduler::{EngineMergeScheduler, MergeStats};
pub use operation::{
    Delete, DeleteResult, Get, GetResult, Index, IndexResult, Origin, ParsedDocument, Term,
    UNSET_AUTO_GENERATED_TIMESTAMP,
};
pub use version::{VersionType, MATCH_ANY, NOT_FOUND};
pub use version_map::{LiveVersionMap, VersionValue};
