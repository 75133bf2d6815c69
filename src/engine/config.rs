//! Engine configuration and the engine clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::storage::Storage;
use crate::translog::TranslogConfig;

/// How the engine opens the shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fresh shard: create an empty index and a fresh translog.
    CreateIndexAndTranslog,
    /// Existing index, but discard the translog (e.g. after a file-based
    /// peer recovery shipped a consistent set of segments).
    OpenIndexCreateTranslog,
    /// Existing index plus its translog; the only mode eligible for
    /// translog recovery.
    OpenIndexAndTranslog,
}

/// A coarse monotonic clock.
///
/// All engine timing (tombstone ages, throttle accounting, post-merge flush
/// decisions) goes through this trait so tests can drive time by hand.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds on a monotonic scale with an arbitrary origin.
    fn relative_time_millis(&self) -> i64;

    /// Nanoseconds on a monotonic scale with an arbitrary origin.
    fn relative_time_nanos(&self) -> i64;
}

/// Production clock, measured from process start.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn relative_time_millis(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }

    fn relative_time_nanos(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }
}

/// Hand-driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            millis: AtomicI64::new(0),
        }
    }

    /// Advance the clock.
    pub fn advance_millis(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn relative_time_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }

    fn relative_time_nanos(&self) -> i64 {
        self.millis.load(Ordering::SeqCst) * 1_000_000
    }
}

/// Tunable engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Whether expired deletion tombstones are garbage collected.
    pub gc_deletes_enabled: bool,

    /// Tombstone retention in milliseconds.
    pub gc_deletes_millis: i64,

    /// Idle time after the last write before a finished merge triggers an
    /// asynchronous flush (nanoseconds).
    pub flush_merges_after_nanos: i64,

    /// In-flight merges above this count throttle indexing to one thread.
    pub max_merge_count: usize,

    /// Segment count budget for the natural merge policy.
    pub max_segment_count: usize,

    /// Initial de-optimization floor for auto-generated-id appends.
    pub max_unsafe_auto_id_timestamp: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            gc_deletes_enabled: true,
            gc_deletes_millis: 60_000, // 60s
            flush_merges_after_nanos: 300_000_000_000, // 5 minutes
            max_merge_count: 5,
            max_segment_count: 10,
            max_unsafe_auto_id_timestamp: -1,
        }
    }
}

/// Everything the engine needs to open a shard.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How to open the shard.
    pub open_mode: OpenMode,
    /// The shard directory.
    pub storage: Arc<dyn Storage>,
    /// Tunables.
    pub settings: EngineSettings,
    /// Translog behavior.
    pub translog: TranslogConfig,
    /// The engine clock.
    pub clock: Arc<dyn Clock>,
}

impl EngineConfig {
    /// Create a config with default settings and the system clock.
    pub fn new(storage: Arc<dyn Storage>, open_mode: OpenMode) -> Self {
        EngineConfig {
            open_mode,
            storage,
            settings: EngineSettings::default(),
            translog: TranslogConfig::default(),
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the settings.
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }
}
