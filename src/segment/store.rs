//! Reference-counted handle on the shard's storage directory.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use log::{debug, error};

use crate::error::{Result, TsurugiError};
use crate::segment::infos::SegmentInfos;
use crate::storage::Storage;

/// Owns the shard directory on behalf of the engine.
///
/// While the reference count is positive the directory must not be torn
/// down. The engine takes a reference when it opens and releases it exactly
/// once, on close or on construction failure.
#[derive(Debug)]
pub struct Store {
    storage: Arc<dyn Storage>,
    ref_count: AtomicI64,
}

impl Store {
    /// Create a store over the given storage, holding one reference for the
    /// creator.
    pub fn new(storage: Arc<dyn Storage>) -> Arc<Self> {
        Arc::new(Store {
            storage,
            ref_count: AtomicI64::new(1),
        })
    }

    /// Take a reference.
    pub fn inc_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Release a reference.
    pub fn dec_ref(&self) {
        let count = self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if count < 0 {
            error!("store reference count dropped below zero");
            debug_assert!(false, "unbalanced store dec_ref");
        } else if count == 0 {
            debug!("store released");
        }
    }

    /// Current reference count.
    pub fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// The underlying storage.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Read the newest committed segment state; a commit must exist.
    pub fn read_last_committed_segment_infos(&self) -> Result<SegmentInfos> {
        SegmentInfos::read_latest(self.storage.as_ref())?.ok_or_else(|| {
            TsurugiError::storage("no segment commit found in store".to_string())
        })
    }
}
