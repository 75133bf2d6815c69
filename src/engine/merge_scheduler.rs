//! Merge tracking and indexing backpressure.
//!
//! Wraps the segment writer's merge callbacks: counts in-flight merges and
//! throttles indexing to a single thread when merges fall behind. Once the
//! shard has gone quiet, a post-merge flush is handed to the background
//! executor so the disk space of merged-away segments is released. Merge
//! failures are converted into engine failure off the merge thread.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::engine::config::Clock;
use crate::engine::executor::FlushExecutor;
use crate::engine::internal::InternalEngine;
use crate::error::TsurugiError;
use crate::segment::writer::{MergeListener, OnGoingMerge};

/// Cumulative merge statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeStats {
    /// Merges completed over the engine's lifetime.
    pub total: u64,
    /// Documents fed into completed merges.
    pub total_docs: u64,
    /// Bytes fed into completed merges.
    pub total_size_bytes: u64,
    /// Wall time spent merging, in milliseconds.
    pub total_time_millis: i64,
    /// Merges currently running.
    pub current: u64,
}

/// The engine's merge listener.
#[derive(Debug)]
pub struct EngineMergeScheduler {
    engine: Mutex<Weak<InternalEngine>>,
    executor: FlushExecutor,
    clock: Arc<dyn Clock>,
    max_merge_count: usize,
    flush_merges_after_nanos: i64,
    num_merges_in_flight: AtomicUsize,
    is_throttling: AtomicBool,
    on_going: Mutex<AHashMap<String, (OnGoingMerge, i64)>>,
    total_merges: AtomicU64,
    total_merged_docs: AtomicU64,
    total_merged_bytes: AtomicU64,
    total_merge_time_millis: AtomicI64,
}

impl EngineMergeScheduler {
    pub(crate) fn new(
        executor: FlushExecutor,
        clock: Arc<dyn Clock>,
        max_merge_count: usize,
        flush_merges_after_nanos: i64,
    ) -> Self {
        EngineMergeScheduler {
            engine: Mutex::new(Weak::new()),
            executor,
            clock,
            max_merge_count: max_merge_count.max(1),
            flush_merges_after_nanos,
            num_merges_in_flight: AtomicUsize::new(0),
            is_throttling: AtomicBool::new(false),
            on_going: Mutex::new(AHashMap::new()),
            total_merges: AtomicU64::new(0),
            total_merged_docs: AtomicU64::new(0),
            total_merged_bytes: AtomicU64::new(0),
            total_merge_time_millis: AtomicI64::new(0),
        }
    }

    pub(crate) fn bind_engine(&self, engine: Weak<InternalEngine>) {
        *self.engine.lock() = engine;
    }

    /// Merges currently in flight.
    pub fn on_going_merges(&self) -> Vec<OnGoingMerge> {
        self.on_going
            .lock()
            .values()
            .map(|(merge, _)| merge.clone())
            .collect()
    }

    /// Cumulative statistics.
    pub fn stats(&self) -> MergeStats {
        MergeStats {
            total: self.total_merges.load(Ordering::Relaxed),
            total_docs: self.total_merged_docs.load(Ordering::Relaxed),
            total_size_bytes: self.total_merged_bytes.load(Ordering::Relaxed),
            total_time_millis: self.total_merge_time_millis.load(Ordering::Relaxed),
            current: self.on_going.lock().len() as u64,
        }
    }

    fn engine(&self) -> Option<Arc<InternalEngine>> {
        self.engine.lock().upgrade()
    }
}

impl MergeListener for EngineMergeScheduler {
    fn before_merge(&self, merge: &OnGoingMerge) {
        self.on_going.lock().insert(
            merge.id.clone(),
            (merge.clone(), self.clock.relative_time_millis()),
        );
        let in_flight = self.num_merges_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        if in_flight > self.max_merge_count && !self.is_throttling.swap(true, Ordering::SeqCst) {
            info!(
                "now throttling indexing: numMergesInFlight={in_flight}, maxNumMerges={}",
                self.max_merge_count
            );
            if let Some(engine) = self.engine() {
                engine.activate_throttling();
            }
        }
    }

    fn after_merge(&self, merge: &OnGoingMerge) {
        if let Some((done, started)) = self.on_going.lock().remove(&merge.id) {
            self.total_merges.fetch_add(1, Ordering::Relaxed);
            self.total_merged_docs
                .fetch_add(done.total_docs, Ordering::Relaxed);
            self.total_merged_bytes
                .fetch_add(done.total_size_bytes, Ordering::Relaxed);
            self.total_merge_time_millis.fetch_add(
                (self.clock.relative_time_millis() - started).max(0),
                Ordering::Relaxed,
            );
        }
        let in_flight = self.num_merges_in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        if in_flight < self.max_merge_count && self.is_throttling.swap(false, Ordering::SeqCst) {
            info!(
                "stop throttling indexing: numMergesInFlight={in_flight}, maxNumMerges={}",
                self.max_merge_count
            );
            if let Some(engine) = self.engine() {
                engine.deactivate_throttling();
            }
        }

        let Some(engine) = self.engine() else {
            return;
        };
        let idle_nanos = self.clock.relative_time_nanos() - engine.last_write_nanos();
        if !engine.writer_has_pending_merges() && idle_nanos >= self.flush_merges_after_nanos {
            // Never flush on the merge thread: a concurrent writer rollback
            // would deadlock engine close.
            let weak = Arc::downgrade(&engine);
            self.executor.execute(Box::new(move || {
                let Some(engine) = weak.upgrade() else {
                    return;
                };
                let renewed = engine.try_renew_sync_commit().unwrap_or(false);
                if !renewed {
                    if let Err(e) = engine.flush(false, false) {
                        if !engine.is_closed() {
                            warn!("failed to flush after merge has finished: {e}");
                        }
                    }
                }
            }));
        }
    }

    fn handle_merge_exception(&self, e: &TsurugiError) {
        error!("failed to merge: {e}");
        let weak = self.engine.lock().clone();
        let reason = format!("merge failed: {e}");
        self.executor.execute(Box::new(move || {
            let Some(engine) = weak.upgrade() else {
                debug!("merge failure action dropped, engine is gone");
                return;
            };
            engine.fail_engine("merge failed", &reason);
        }));
    }
}
