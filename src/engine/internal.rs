//! The per-shard write engine.
//!
//! Serializes index/delete operations under per-uid locking, enforces
//! per-document versioning, appends every mutation to the translog, and
//! coordinates flush, refresh, force-merge, sync-commit, and translog
//! recovery against the segment store.
//!
//! Locks are acquired in one order only: engine read-lock, per-uid lock,
//! throttle gate, segment writer internals. Flush adds its own mutex under
//! the read lock; force-merge takes the optimize mutex and nothing else.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashSet;
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::engine::config::{Clock, EngineConfig, EngineSettings, OpenMode};
use crate::engine::executor::FlushExecutor;
use crate::engine::keyed_lock::KeyedLock;
use crate::engine::merge_scheduler::{EngineMergeScheduler, MergeStats};
use crate::engine::operation::{
    Delete, DeleteResult, Get, GetResult, Index, IndexResult, Origin, ParsedDocument, Term,
    UNSET_AUTO_GENERATED_TIMESTAMP,
};
use crate::engine::throttle::IndexThrottle;
use crate::engine::version::{VersionType, MATCH_ANY, NOT_FOUND};
use crate::engine::version_map::{LiveVersionMap, VersionValue};
use crate::error::{Result, TsurugiError};
use crate::segment::infos::CommitId;
use crate::segment::searcher::{RefreshListener, Searcher, SearcherManager};
use crate::segment::store::Store;
use crate::segment::writer::{IndexCommit, MergePolicy, SegmentWriter};
use crate::translog::{
    generation_from_user_data, Translog, TranslogOp, TRANSLOG_GENERATION_KEY, TRANSLOG_UUID_KEY,
};

/// Commit user-data key marking a sync-flushed commit.
pub const SYNC_COMMIT_ID: &str = "sync_commit_id";

/// Commit user-data key persisting the auto-id de-optimization floor.
pub const MAX_UNSAFE_AUTO_ID_TIMESTAMP_KEY: &str = "max_unsafe_auto_id_timestamp";

/// Outcome of a sync flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncedFlushResult {
    /// The sync id was committed.
    Success,
    /// The writer had uncommitted changes.
    PendingOperations,
    /// The current commit id did not match the expected one.
    CommitMismatch,
}

/// One segment as reported by [`InternalEngine::segments`].
#[derive(Debug, Clone)]
pub struct EngineSegment {
    /// Segment name.
    pub name: String,
    /// Commit generation the report was taken at.
    pub generation: u64,
    /// Live documents in the segment.
    pub doc_count: u64,
    /// Size estimate in bytes.
    pub size_bytes: u64,
    /// Whether the segment is part of the last commit.
    pub committed: bool,
    /// Whether the segment is visible to the current searcher.
    pub search: bool,
    /// Id of the merge currently consuming this segment, if any.
    pub merge_id: Option<String>,
    /// Extra attributes, populated for verbose reports.
    pub attributes: Option<BTreeMap<String, String>>,
}

/// How the current doc version in the store compares to an incoming op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpVsStoreDocStatus {
    /// The op is more recent than the stored doc.
    OpNewer,
    /// The op is older than or equal to the stored doc.
    OpStaleOrEqual,
    /// No doc was found in the store.
    StoreDocNotFound,
}

/// Decision record for an index operation.
#[derive(Debug)]
enum IndexingStrategy {
    /// Append without a version lookup; the doc was never seen.
    OptimizedAppendOnly,
    /// Version conflict; carry the failed result, touch nothing.
    SkipDueToVersionConflict {
        error: TsurugiError,
        current_version: i64,
        current_not_found_or_deleted: bool,
    },
    /// Regular indexing under the resolved version.
    ProcessNormally {
        current_not_found_or_deleted: bool,
        version_for_indexing: i64,
    },
    /// The doc may have been seen; overwrite as if it were absent.
    OverrideExistingAsIfNotThere { version_for_indexing: i64 },
    /// Record the op (version map + translog) but skip the store.
    ProcessButSkipStore {
        current_not_found_or_deleted: bool,
        version_for_indexing: i64,
    },
}

impl IndexingStrategy {
    fn optimized_append_only() -> Self {
        IndexingStrategy::OptimizedAppendOnly
    }

    fn skip_due_to_version_conflict(
        error: TsurugiError,
        current_not_found_or_deleted: bool,
        current_version: i64,
    ) -> Self {
        IndexingStrategy::SkipDueToVersionConflict {
            error,
            current_version,
            current_not_found_or_deleted,
        }
    }

    fn process_normally(current_not_found_or_deleted: bool, version_for_indexing: i64) -> Self {
        IndexingStrategy::ProcessNormally {
            current_not_found_or_deleted,
            version_for_indexing,
        }
    }

    fn override_existing_as_if_not_there(version_for_indexing: i64) -> Self {
        IndexingStrategy::OverrideExistingAsIfNotThere {
            version_for_indexing,
        }
    }

    fn process_but_skip_store(
        current_not_found_or_deleted: bool,
        version_for_indexing: i64,
    ) -> Self {
        IndexingStrategy::ProcessButSkipStore {
            current_not_found_or_deleted,
            version_for_indexing,
        }
    }

    fn index_into_store(&self) -> bool {
        matches!(
            self,
            IndexingStrategy::OptimizedAppendOnly
                | IndexingStrategy::ProcessNormally { .. }
                | IndexingStrategy::OverrideExistingAsIfNotThere { .. }
        )
    }

    fn use_update(&self) -> bool {
        match self {
            IndexingStrategy::OverrideExistingAsIfNotThere { .. } => true,
            IndexingStrategy::ProcessNormally {
                current_not_found_or_deleted,
                ..
            } => !current_not_found_or_deleted,
            _ => false,
        }
    }

    fn version_for_indexing(&self) -> i64 {
        match self {
            IndexingStrategy::OptimizedAppendOnly => 1,
            IndexingStrategy::SkipDueToVersionConflict { .. } => NOT_FOUND,
            IndexingStrategy::ProcessNormally {
                version_for_indexing,
                ..
            }
            | IndexingStrategy::OverrideExistingAsIfNotThere {
                version_for_indexing,
            }
            | IndexingStrategy::ProcessButSkipStore {
                version_for_indexing,
                ..
            } => *version_for_indexing,
        }
    }

    fn current_not_found_or_deleted(&self) -> bool {
        match self {
            IndexingStrategy::OptimizedAppendOnly
            | IndexingStrategy::OverrideExistingAsIfNotThere { .. } => true,
            IndexingStrategy::SkipDueToVersionConflict {
                current_not_found_or_deleted,
                ..
            }
            | IndexingStrategy::ProcessNormally {
                current_not_found_or_deleted,
                ..
            }
            | IndexingStrategy::ProcessButSkipStore {
                current_not_found_or_deleted,
                ..
            } => *current_not_found_or_deleted,
        }
    }

    /// The `created` flag reported to the caller. An override of a possibly
    /// delivered append is planned as if the doc were absent but reported as
    /// an update, the client already saw the first delivery.
    fn created(&self) -> bool {
        match self {
            IndexingStrategy::OverrideExistingAsIfNotThere { .. } => false,
            other => other.current_not_found_or_deleted(),
        }
    }
}

/// Decision record for a delete operation.
#[derive(Debug)]
enum DeletionStrategy {
    /// Version conflict; carry the failed result, touch nothing.
    SkipDueToVersionConflict {
        error: TsurugiError,
        current_version: i64,
        currently_deleted: bool,
    },
    /// Regular deletion under the resolved version.
    ProcessNormally {
        currently_deleted: bool,
        version_of_deletion: i64,
    },
    /// Record the op (version map + translog) but skip the store.
    ProcessButSkipStore {
        currently_deleted: bool,
        version_of_deletion: i64,
    },
}

impl DeletionStrategy {
    fn skip_due_to_version_conflict(
        error: TsurugiError,
        current_version: i64,
        currently_deleted: bool,
    ) -> Self {
        DeletionStrategy::SkipDueToVersionConflict {
            error,
            current_version,
            currently_deleted,
        }
    }

    fn process_normally(currently_deleted: bool, version_of_deletion: i64) -> Self {
        DeletionStrategy::ProcessNormally {
            currently_deleted,
            version_of_deletion,
        }
    }

    fn process_but_skip_store(currently_deleted: bool, version_of_deletion: i64) -> Self {
        DeletionStrategy::ProcessButSkipStore {
            currently_deleted,
            version_of_deletion,
        }
    }

    fn delete_from_store(&self) -> bool {
        matches!(self, DeletionStrategy::ProcessNormally { .. })
    }

    fn currently_deleted(&self) -> bool {
        match self {
            DeletionStrategy::SkipDueToVersionConflict {
                currently_deleted, ..
            }
            | DeletionStrategy::ProcessNormally {
                currently_deleted, ..
            }
            | DeletionStrategy::ProcessButSkipStore {
                currently_deleted, ..
            } => *currently_deleted,
        }
    }

    fn version_of_deletion(&self) -> i64 {
        match self {
            DeletionStrategy::SkipDueToVersionConflict { .. } => NOT_FOUND,
            DeletionStrategy::ProcessNormally {
                version_of_deletion,
                ..
            }
            | DeletionStrategy::ProcessButSkipStore {
                version_of_deletion,
                ..
            } => *version_of_deletion,
        }
    }
}

/// The engine.
#[derive(Debug)]
pub struct InternalEngine {
    open_mode: OpenMode,
    settings: RwLock<EngineSettings>,
    clock: Arc<dyn Clock>,

    store: Arc<Store>,
    translog: Arc<Translog>,
    segment_writer: Arc<SegmentWriter>,
    searcher_manager: Arc<SearcherManager>,
    version_map: Arc<LiveVersionMap>,
    merge_scheduler: Arc<EngineMergeScheduler>,
    #[allow(dead_code)]
    executor: FlushExecutor,

    /// Engine-wide reader/writer lock: ops share it, close and sync-commit
    /// exclude everything.
    rwlock: RwLock<()>,
    keyed_lock: KeyedLock,
    flush_lock: Mutex<()>,
    optimize_lock: Mutex<()>,
    fail_engine_lock: Mutex<()>,

    throttle: IndexThrottle,
    throttle_request_count: AtomicI64,

    is_closed: AtomicBool,
    failed_engine: Mutex<Option<String>>,
    pending_translog_recovery: AtomicBool,

    last_committed_segment_infos: RwLock<crate::segment::infos::SegmentInfos>,
    max_unsafe_auto_id_timestamp: AtomicI64,
    last_write_nanos: AtomicI64,
    last_delete_version_prune_time_millis: AtomicI64,
    version_map_refresh_pending: AtomicBool,
    num_version_lookups: AtomicU64,
    num_index_version_lookups: AtomicU64,
}

impl InternalEngine {
    /// Open the engine per the config's [`OpenMode`].
    pub fn open(config: EngineConfig) -> Result<Arc<InternalEngine>> {
        let open_mode = config.open_mode;
        let settings = config.settings.clone();
        let clock = config.clock.clone();
        let store = Store::new(config.storage.clone());
        let version_map = Arc::new(LiveVersionMap::new());
        let executor = FlushExecutor::new("flush");
        let merge_scheduler = Arc::new(EngineMergeScheduler::new(
            executor.clone(),
            clock.clone(),
            settings.max_merge_count,
            settings.flush_merges_after_nanos,
        ));
        let throttle = IndexThrottle::new(clock.clone());

        type EngineParts = (
            Arc<SegmentWriter>,
            Translog,
            Arc<SearcherManager>,
            crate::segment::infos::SegmentInfos,
        );
        let built = (|| -> Result<EngineParts> {
            let policy = Arc::new(MergePolicy::new(settings.max_segment_count));
            let create = open_mode == OpenMode::CreateIndexAndTranslog;
            let writer = Arc::new(SegmentWriter::open(store.clone(), policy, create)?);
            let translog = Self::open_translog(&config, &writer, &settings)?;
            let manager = Arc::new(SearcherManager::new(writer.clone())?);
            manager.add_listener(version_map.clone() as Arc<dyn RefreshListener>);
            let infos = store.read_last_committed_segment_infos()?;
            Ok((writer, translog, manager, infos))
        })();

        let (segment_writer, translog, searcher_manager, infos) = match built {
            Ok(parts) => parts,
            Err(e) => {
                version_map.clear();
                store.dec_ref();
                return Err(e);
            }
        };

        let max_unsafe = infos
            .user_data
            .get(MAX_UNSAFE_AUTO_ID_TIMESTAMP_KEY)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(settings.max_unsafe_auto_id_timestamp);

        let now_millis = clock.relative_time_millis();
        let engine = Arc::new(InternalEngine {
            open_mode,
            settings: RwLock::new(settings),
            clock,
            store,
            translog: Arc::new(translog),
            segment_writer,
            searcher_manager,
            version_map,
            merge_scheduler: merge_scheduler.clone(),
            executor,
            rwlock: RwLock::new(()),
            keyed_lock: KeyedLock::new(),
            flush_lock: Mutex::new(()),
            optimize_lock: Mutex::new(()),
            fail_engine_lock: Mutex::new(()),
            throttle,
            throttle_request_count: AtomicI64::new(0),
            is_closed: AtomicBool::new(false),
            failed_engine: Mutex::new(None),
            pending_translog_recovery: AtomicBool::new(
                open_mode == OpenMode::OpenIndexAndTranslog,
            ),
            last_committed_segment_infos: RwLock::new(infos),
            max_unsafe_auto_id_timestamp: AtomicI64::new(max_unsafe),
            last_write_nanos: AtomicI64::new(0),
            last_delete_version_prune_time_millis: AtomicI64::new(now_millis),
            version_map_refresh_pending: AtomicBool::new(false),
            num_version_lookups: AtomicU64::new(0),
            num_index_version_lookups: AtomicU64::new(0),
        });
        engine.segment_writer.set_merge_listener(merge_scheduler.clone());
        merge_scheduler.bind_engine(Arc::downgrade(&engine));
        trace!("created new engine with open mode {open_mode:?}");
        Ok(engine)
    }

    /// Open or create the translog per the open mode and bind it to the
    /// segment store. In the create modes a commit is written immediately so
    /// the index always points at its translog.
    fn open_translog(
        config: &EngineConfig,
        writer: &Arc<SegmentWriter>,
        settings: &EngineSettings,
    ) -> Result<Translog> {
        match config.open_mode {
            OpenMode::OpenIndexAndTranslog => {
                let committed = writer.committed_infos();
                let generation =
                    generation_from_user_data(&committed.user_data)?.ok_or_else(|| {
                        TsurugiError::illegal_state(
                            "no translog generation present in commit data but translog is expected to exist",
                        )
                    })?;
                if generation.uuid.is_none() {
                    return Err(TsurugiError::IndexFormatTooOld(
                        "commit carries a legacy translog id without a UUID; re-index from a fresh copy"
                            .to_string(),
                    ));
                }
                Translog::open(config.storage.clone(), config.translog.clone(), &generation)
            }
            OpenMode::CreateIndexAndTranslog | OpenMode::OpenIndexCreateTranslog => {
                let translog = Translog::create(config.storage.clone(), config.translog.clone())?;
                let previous = writer.committed_infos();
                let generation = translog.generation();
                let mut user_data = BTreeMap::new();
                user_data.insert(
                    TRANSLOG_GENERATION_KEY.to_string(),
                    generation.file_gen.to_string(),
                );
                if let Some(uuid) = generation.uuid {
                    user_data.insert(TRANSLOG_UUID_KEY.to_string(), uuid);
                }
                let max_unsafe = previous
                    .user_data
                    .get(MAX_UNSAFE_AUTO_ID_TIMESTAMP_KEY)
                    .cloned()
                    .unwrap_or_else(|| settings.max_unsafe_auto_id_timestamp.to_string());
                user_data.insert(MAX_UNSAFE_AUTO_ID_TIMESTAMP_KEY.to_string(), max_unsafe);
                if config.open_mode == OpenMode::OpenIndexCreateTranslog {
                    if let Some(sync_id) = previous.user_data.get(SYNC_COMMIT_ID) {
                        user_data.insert(SYNC_COMMIT_ID.to_string(), sync_id.clone());
                    }
                }
                writer.commit(user_data)?;
                Ok(translog)
            }
        }
    }

    // ── write path ──────────────────────────────────────────────────

    /// Index a document.
    pub fn index(&self, index: Index) -> Result<IndexResult> {
        let do_throttle = !index.origin.is_recovery();
        let outcome = (|| -> Result<IndexResult> {
            let _engine_lock = self.rwlock.read();
            self.ensure_open()?;
            debug_assert!(assert_replication_version_type(
                index.version_type,
                index.origin
            ));
            let uid_bytes = index.uid.bytes();
            let _uid_lock = self.keyed_lock.acquire(&uid_bytes);
            let _throttle = do_throttle.then(|| self.throttle.acquire_throttle());
            self.last_write_nanos
                .store(index.start_time_nanos, Ordering::SeqCst);

            let plan = if index.origin == Origin::Primary {
                self.plan_indexing_as_primary(&index)?
            } else {
                self.plan_indexing_as_non_primary(&index)?
            };

            let mut result = match plan {
                IndexingStrategy::SkipDueToVersionConflict {
                    error,
                    current_version,
                    ..
                } => IndexResult::from_failure(error, current_version),
                ref plan if plan.index_into_store() => {
                    self.index_into_store(&index, plan, &uid_bytes)?
                }
                ref plan => IndexResult::new(plan.version_for_indexing(), plan.created()),
            };

            if !result.has_failure()
                && index.origin != Origin::LocalTranslogRecovery
            {
                let location = self.translog.add(TranslogOp::Index {
                    uid: index.uid.clone(),
                    version: result.version(),
                    version_type: index.version_type,
                    docs: index.doc.docs.clone(),
                    auto_generated_id_timestamp: index.auto_generated_id_timestamp,
                })?;
                result.set_translog_location(location);
            }
            result.freeze(self.clock.relative_time_nanos() - index.start_time_nanos);
            Ok(result)
        })();

        match outcome {
            Ok(result) => Ok(result),
            Err(e) => {
                self.maybe_fail_engine("index", &e);
                Err(e)
            }
        }
    }

    /// Delete a document. Deletes are never throttled: they do not create
    /// new segments.
    pub fn delete(&self, delete: Delete) -> Result<DeleteResult> {
        let outcome = (|| -> Result<DeleteResult> {
            let _engine_lock = self.rwlock.read();
            self.ensure_open()?;
            debug_assert!(assert_replication_version_type(
                delete.version_type,
                delete.origin
            ));
            let uid_bytes = delete.uid.bytes();
            let _uid_lock = self.keyed_lock.acquire(&uid_bytes);
            self.last_write_nanos
                .store(delete.start_time_nanos, Ordering::SeqCst);

            let plan = if delete.origin == Origin::Primary {
                self.plan_deletion_as_primary(&delete)?
            } else {
                self.plan_deletion_as_non_primary(&delete)?
            };

            let mut result = match plan {
                DeletionStrategy::SkipDueToVersionConflict {
                    error,
                    current_version,
                    currently_deleted,
                } => DeleteResult::from_failure(error, current_version, !currently_deleted),
                ref plan if plan.delete_from_store() => {
                    self.delete_in_store(&delete, plan, &uid_bytes)?
                }
                ref plan => {
                    DeleteResult::new(plan.version_of_deletion(), !plan.currently_deleted())
                }
            };

            if !result.has_failure()
                && delete.origin != Origin::LocalTranslogRecovery
            {
                let location = self.translog.add(TranslogOp::Delete {
                    uid: delete.uid.clone(),
                    version: result.version(),
                    version_type: delete.version_type,
                })?;
                result.set_translog_location(location);
            }
            result.freeze(self.clock.relative_time_nanos() - delete.start_time_nanos);
            Ok(result)
        })();

        match outcome {
            Ok(result) => {
                self.maybe_prune_deleted_tombstones();
                Ok(result)
            }
            Err(e) => {
                self.maybe_fail_engine("delete", &e);
                Err(e)
            }
        }
    }

    fn plan_indexing_as_primary(&self, index: &Index) -> Result<IndexingStrategy> {
        debug_assert!(index.origin == Origin::Primary);
        if can_optimize_add_document(index) {
            if self.may_have_been_indexed_before(index) {
                Ok(IndexingStrategy::override_existing_as_if_not_there(1))
            } else {
                Ok(IndexingStrategy::optimized_append_only())
            }
        } else {
            let version_value = self.resolve_doc_version(&index.uid)?;
            let (current_version, current_not_found_or_deleted) = match &version_value {
                None => (NOT_FOUND, true),
                Some(value) => (value.version, value.is_delete),
            };
            if index.version_type.is_version_conflict_for_writes(
                current_version,
                index.version,
                current_not_found_or_deleted,
            ) {
                let error = TsurugiError::version_conflict(
                    format!(
                        "[{}]: version conflict, current version [{current_version}] is different than the one provided [{}]",
                        index.uid.text, index.version
                    ),
                    current_version,
                );
                Ok(IndexingStrategy::skip_due_to_version_conflict(
                    error,
                    current_not_found_or_deleted,
                    current_version,
                ))
            } else {
                Ok(IndexingStrategy::process_normally(
                    current_not_found_or_deleted,
                    index
                        .version_type
                        .update_version(current_version, index.version),
                ))
            }
        }
    }

    fn plan_indexing_as_non_primary(&self, index: &Index) -> Result<IndexingStrategy> {
        if can_optimize_add_document(index) && !self.may_have_been_indexed_before(index) {
            // no out-of-order delivery to deal with, this one was never seen
            debug_assert!(index.version == 1);
            Ok(IndexingStrategy::optimized_append_only())
        } else {
            // drop out-of-order operations based on versions; replicas do
            // not care about the creation status of documents
            let status = self.compare_op_to_store_doc_based_on_versions(
                &index.uid,
                index.version,
                index.version_type,
            )?;
            Ok(match status {
                OpVsStoreDocStatus::OpStaleOrEqual => {
                    IndexingStrategy::process_but_skip_store(false, index.version)
                }
                OpVsStoreDocStatus::StoreDocNotFound => {
                    IndexingStrategy::process_normally(true, index.version)
                }
                OpVsStoreDocStatus::OpNewer => {
                    IndexingStrategy::process_normally(false, index.version)
                }
            })
        }
    }

    fn plan_deletion_as_primary(&self, delete: &Delete) -> Result<DeletionStrategy> {
        let version_value = self.resolve_doc_version(&delete.uid)?;
        let (current_version, currently_deleted) = match &version_value {
            None => (NOT_FOUND, true),
            Some(value) => (value.version, value.is_delete),
        };
        if delete.version_type.is_version_conflict_for_writes(
            current_version,
            delete.version,
            currently_deleted,
        ) {
            let error = TsurugiError::version_conflict(
                format!(
                    "[{}]: version conflict, current version [{current_version}] is different than the one provided [{}]",
                    delete.uid.text, delete.version
                ),
                current_version,
            );
            Ok(DeletionStrategy::skip_due_to_version_conflict(
                error,
                current_version,
                currently_deleted,
            ))
        } else {
            Ok(DeletionStrategy::process_normally(
                currently_deleted,
                delete
                    .version_type
                    .update_version(current_version, delete.version),
            ))
        }
    }

    fn plan_deletion_as_non_primary(&self, delete: &Delete) -> Result<DeletionStrategy> {
        let status = self.compare_op_to_store_doc_based_on_versions(
            &delete.uid,
            delete.version,
            delete.version_type,
        )?;
        Ok(match status {
            OpVsStoreDocStatus::OpStaleOrEqual => {
                DeletionStrategy::process_but_skip_store(false, delete.version)
            }
            OpVsStoreDocStatus::StoreDocNotFound => {
                DeletionStrategy::process_normally(true, delete.version)
            }
            OpVsStoreDocStatus::OpNewer => {
                DeletionStrategy::process_normally(false, delete.version)
            }
        })
    }

    fn index_into_store(
        &self,
        index: &Index,
        plan: &IndexingStrategy,
        uid_bytes: &[u8],
    ) -> Result<IndexResult> {
        let version = plan.version_for_indexing();
        debug_assert!(version >= 0, "version must be set, got {version}");
        let applied = if plan.use_update() {
            self.segment_writer
                .update_document(&index.uid, &index.doc, version)
        } else {
            debug_assert!(
                self.assert_doc_does_not_exist(index, !can_optimize_add_document(index))
            );
            self.segment_writer.add_document(&index.doc, version)
        };
        match applied {
            Ok(()) => {
                self.version_map
                    .put(uid_bytes.to_vec(), VersionValue::live(version));
                Ok(IndexResult::new(version, plan.created()))
            }
            Err(e) => {
                if self.segment_writer.tragic_exception().is_none() {
                    // no tragic event recorded, so this is a document-level
                    // failure and the engine stays open
                    Ok(IndexResult::from_failure(e, MATCH_ANY))
                } else {
                    Err(e)
                }
            }
        }
    }

    fn delete_in_store(
        &self,
        delete: &Delete,
        plan: &DeletionStrategy,
        uid_bytes: &[u8],
    ) -> Result<DeleteResult> {
        let version = plan.version_of_deletion();
        let applied = if !plan.currently_deleted() {
            self.segment_writer.delete_documents(&delete.uid)
        } else {
            Ok(())
        };
        match applied {
            Ok(()) => {
                self.version_map.put(
                    uid_bytes.to_vec(),
                    VersionValue::tombstone(version, self.clock.relative_time_millis()),
                );
                Ok(DeleteResult::new(version, !plan.currently_deleted()))
            }
            Err(e) => {
                if self.segment_writer.tragic_exception().is_none() {
                    Ok(DeleteResult::from_failure(e, version, !plan.currently_deleted()))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// True if the indexing operation may already have been processed.
    /// A rare false positive only de-optimizes; a false negative would lose
    /// the duplicate-delivery protection, so retries raise the floor first.
    fn may_have_been_indexed_before(&self, index: &Index) -> bool {
        debug_assert!(can_optimize_add_document(index));
        let timestamp = index.auto_generated_id_timestamp;
        if index.is_retry {
            let mut current = self.max_unsafe_auto_id_timestamp.load(Ordering::SeqCst);
            while current < timestamp {
                match self.max_unsafe_auto_id_timestamp.compare_exchange(
                    current,
                    timestamp,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
            debug_assert!(self.max_unsafe_auto_id_timestamp.load(Ordering::SeqCst) >= timestamp);
            true
        } else {
            self.max_unsafe_auto_id_timestamp.load(Ordering::SeqCst) >= timestamp
        }
    }

    /// Resolve the current version of a uid: version map first, then the
    /// point-in-time reader. A tombstone past its GC horizon counts as
    /// absent.
    fn resolve_doc_version(&self, uid: &Term) -> Result<Option<VersionValue>> {
        self.num_version_lookups.fetch_add(1, Ordering::Relaxed);
        let mut version_value = self.version_map.get(&uid.bytes());
        match &version_value {
            None => {
                self.num_index_version_lookups.fetch_add(1, Ordering::Relaxed);
                let searcher = self.searcher_manager.acquire("load_version");
                if let Some(current) = searcher.load_version(uid) {
                    version_value = Some(VersionValue::live(current));
                }
            }
            Some(value) if value.is_delete => {
                let settings = self.settings.read();
                if settings.gc_deletes_enabled
                    && self.clock.relative_time_millis() - value.time_millis
                        > settings.gc_deletes_millis
                {
                    version_value = None;
                }
            }
            Some(_) => {}
        }
        Ok(version_value)
    }

    fn compare_op_to_store_doc_based_on_versions(
        &self,
        uid: &Term,
        op_version: i64,
        version_type: VersionType,
    ) -> Result<OpVsStoreDocStatus> {
        debug_assert!(op_version >= 0, "versions should be non-negative");
        match self.resolve_doc_version(uid)? {
            None => Ok(OpVsStoreDocStatus::StoreDocNotFound),
            Some(value) => {
                if version_type.is_version_conflict_for_writes(
                    value.version,
                    op_version,
                    value.is_delete,
                ) {
                    Ok(OpVsStoreDocStatus::OpStaleOrEqual)
                } else {
                    Ok(OpVsStoreDocStatus::OpNewer)
                }
            }
        }
    }

    /// Debug-only: the doc really must not exist before a plain add.
    fn assert_doc_does_not_exist(&self, index: &Index, allow_deleted: bool) -> bool {
        if let Some(value) = self.version_map.get(&index.uid.bytes()) {
            if !value.is_delete || !allow_deleted {
                return false;
            }
        } else {
            let searcher = self.searcher_manager.acquire("assert_doc_does_not_exist");
            if searcher.count(&index.uid) > 0 {
                return false;
            }
        }
        true
    }

    // ── reads ───────────────────────────────────────────────────────

    /// Single-document read. A realtime get whose uid has pending in-memory
    /// state forces a refresh before reading from the searcher.
    pub fn get<F>(&self, get: &Get, searcher_factory: F) -> Result<GetResult>
    where
        F: FnOnce(&str) -> Result<Searcher>,
    {
        let _engine_lock = self.rwlock.read();
        self.ensure_open()?;
        if get.realtime {
            if let Some(value) = self.version_map.get(&get.uid.bytes()) {
                if value.is_delete {
                    return Ok(GetResult::not_exists());
                }
                if get
                    .version_type
                    .is_version_conflict_for_reads(value.version, get.version)
                {
                    return Err(TsurugiError::version_conflict(
                        format!(
                            "[{}]: version conflict, current version [{}] is different than the one provided [{}]",
                            get.uid.text, value.version, get.version
                        ),
                        value.version,
                    ));
                }
                self.do_refresh("realtime_get")?;
            }
        }

        let searcher = searcher_factory("get")?;
        match searcher.get(&get.uid) {
            None => Ok(GetResult::not_exists()),
            Some((version, source)) => {
                if get
                    .version_type
                    .is_version_conflict_for_reads(version, get.version)
                {
                    return Err(TsurugiError::version_conflict(
                        format!(
                            "[{}]: version conflict, current version [{version}] is different than the one provided [{}]",
                            get.uid.text, get.version
                        ),
                        version,
                    ));
                }
                Ok(GetResult {
                    exists: true,
                    version,
                    source: Some(source),
                })
            }
        }
    }

    /// Acquire a point-in-time searcher.
    pub fn acquire_searcher(&self, source: &str) -> Result<Searcher> {
        self.ensure_open()?;
        Ok(self.searcher_manager.acquire(source))
    }

    // ── refresh ─────────────────────────────────────────────────────

    /// Reopen the point-in-time reader if the segment state moved on.
    pub fn refresh(&self, source: &str) -> Result<()> {
        let _engine_lock = self.rwlock.read();
        self.ensure_open()?;
        self.do_refresh(source)
    }

    /// Refresh with the engine read lock already held by the caller.
    fn do_refresh(&self, source: &str) -> Result<()> {
        trace!("refresh with source [{source}]");
        match self.searcher_manager.maybe_refresh_blocking() {
            Ok(_) => {}
            Err(e) if e.is_already_closed() || e.is_tragic() => {
                self.fail_on_tragic_event();
                return Err(e);
            }
            Err(e) => {
                self.fail_engine("refresh failed", &e.to_string());
                return Err(TsurugiError::RefreshFailed(e.to_string()));
            }
        }
        self.maybe_prune_deleted_tombstones();
        self.version_map_refresh_pending.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Free indexing-buffer heap, invoked by the external memory controller.
    /// A version map above a quarter of the writer's buffer forces a full
    /// refresh (which also clears the map); otherwise a cheap segment flush
    /// writes bytes out without opening a new reader.
    pub fn write_indexing_buffer(&self) -> Result<()> {
        let _engine_lock = self.rwlock.read();
        self.ensure_open()?;

        let version_map_bytes = self.version_map.ram_bytes_used_for_refresh();
        let indexing_buffer_bytes = self.segment_writer.ram_bytes_used();
        let use_refresh = self.version_map_refresh_pending.load(Ordering::SeqCst)
            || indexing_buffer_bytes / 4 < version_map_bytes;
        if use_refresh {
            debug!(
                "use refresh to write indexing buffer (heap size [{indexing_buffer_bytes}]), to also clear version map (heap size [{version_map_bytes}])"
            );
            self.do_refresh("write indexing buffer")
        } else {
            debug!(
                "use segment flush to write indexing buffer (heap size [{indexing_buffer_bytes}]) since version map is small (heap size [{version_map_bytes}])"
            );
            match self.segment_writer.flush() {
                Ok(()) => Ok(()),
                Err(e) if e.is_already_closed() || e.is_tragic() => {
                    self.fail_on_tragic_event();
                    Err(e)
                }
                Err(e) => {
                    self.fail_engine("writeIndexingBuffer failed", &e.to_string());
                    Err(TsurugiError::RefreshFailed(e.to_string()))
                }
            }
        }
    }

    // ── flush / commit ──────────────────────────────────────────────

    /// Commit uncommitted segments and rotate the translog.
    pub fn flush(&self, force: bool, wait_if_ongoing: bool) -> Result<CommitId> {
        self.ensure_open()?;
        let new_commit_id;
        {
            let _engine_lock = self.rwlock.read();
            self.ensure_open()?;
            let _flush_guard = match self.flush_lock.try_lock() {
                Some(guard) => {
                    trace!("acquired flush lock immediately");
                    guard
                }
                None => {
                    if wait_if_ongoing {
                        trace!("waiting for in-flight flush to finish");
                        let guard = self.flush_lock.lock();
                        trace!("acquired flush lock after blocking");
                        guard
                    } else {
                        return Ok(self.commit_id());
                    }
                }
            };

            if self.segment_writer.has_uncommitted_changes() || force {
                self.ensure_can_flush()?;
                let flushed = (|| -> Result<()> {
                    self.translog.prepare_commit()?;
                    trace!("starting commit for flush");
                    self.commit_segment_writer(None)?;
                    trace!("finished commit for flush");
                    // refresh clears older version values, and only then may
                    // old translog files be reclaimed
                    self.do_refresh("version_table_flush")?;
                    self.translog.commit()?;
                    Ok(())
                })();
                if let Err(e) = flushed {
                    let wrapped = TsurugiError::FlushFailed(e.to_string());
                    self.maybe_fail_engine("flush", &e);
                    return Err(wrapped);
                }

                self.store.inc_ref();
                let reread = self.store.read_last_committed_segment_infos();
                self.store.dec_ref();
                match reread {
                    Ok(infos) => *self.last_committed_segment_infos.write() = infos,
                    Err(e) => {
                        if !self.is_closed() {
                            warn!("failed to read latest segment infos on flush: {e}");
                        }
                    }
                }
            }
            new_commit_id = self.commit_id();
        }
        if self.settings.read().gc_deletes_enabled {
            self.prune_deleted_tombstones();
        }
        Ok(new_commit_id)
    }

    /// Mark a quiescent shard with a sync id, without writing segments.
    pub fn sync_flush(&self, sync_id: &str, expected_commit_id: &CommitId) -> Result<SyncedFlushResult> {
        // best effort checks before we take the write lock
        self.ensure_open()?;
        if self.segment_writer.has_uncommitted_changes() {
            trace!("can't sync commit [{sync_id}], have pending changes");
            return Ok(SyncedFlushResult::PendingOperations);
        }
        if self.commit_id() != *expected_commit_id {
            trace!("can't sync commit [{sync_id}], current commit id is not equal to expected");
            return Ok(SyncedFlushResult::CommitMismatch);
        }

        let _engine_lock = self.rwlock.write();
        self.ensure_open()?;
        self.ensure_can_flush()?;
        if self.segment_writer.has_uncommitted_changes() {
            trace!("can't sync commit [{sync_id}], have pending changes");
            return Ok(SyncedFlushResult::PendingOperations);
        }
        if self.commit_id() != *expected_commit_id {
            trace!("can't sync commit [{sync_id}], current commit id is not equal to expected");
            return Ok(SyncedFlushResult::CommitMismatch);
        }
        trace!("starting sync commit [{sync_id}]");
        self.commit_segment_writer(Some(sync_id))?;
        debug!("successfully sync committed, sync id [{sync_id}]");
        *self.last_committed_segment_infos.write() =
            self.store.read_last_committed_segment_infos()?;
        Ok(SyncedFlushResult::Success)
    }

    /// Re-commit an existing sync id when only segment-level bookkeeping is
    /// uncommitted, keeping the quiescence marker valid without a full
    /// flush. Returns whether the commit was renewed.
    pub fn try_renew_sync_commit(&self) -> Result<bool> {
        let mut renewed = false;
        {
            let _engine_lock = self.rwlock.write();
            self.ensure_open()?;
            self.ensure_can_flush()?;
            let sync_id = self
                .last_committed_segment_infos
                .read()
                .user_data
                .get(SYNC_COMMIT_ID)
                .cloned();
            if let Some(sync_id) = sync_id {
                if self.translog.total_operations() == 0
                    && self.segment_writer.has_uncommitted_changes()
                {
                    trace!("start renewing sync commit [{sync_id}]");
                    self.commit_segment_writer(Some(&sync_id))?;
                    debug!("successfully sync committed, sync id [{sync_id}]");
                    *self.last_committed_segment_infos.write() =
                        self.store.read_last_committed_segment_infos()?;
                    renewed = true;
                }
            }
        }
        if renewed {
            // refresh outside of the write lock
            self.refresh("renew sync commit")?;
        }
        Ok(renewed)
    }

    /// Write a segment commit binding the current translog generation,
    /// the auto-id floor, and an optional sync id.
    fn commit_segment_writer(&self, sync_id: Option<&str>) -> Result<()> {
        self.ensure_can_flush()?;
        let generation = self.translog.generation();
        trace!(
            "committing writer with translog generation [{}] and sync id [{sync_id:?}]",
            generation.file_gen
        );
        let uuid = generation
            .uuid
            .ok_or_else(|| TsurugiError::illegal_state("translog has no UUID"))?;
        let mut user_data = BTreeMap::new();
        user_data.insert(
            TRANSLOG_GENERATION_KEY.to_string(),
            generation.file_gen.to_string(),
        );
        user_data.insert(TRANSLOG_UUID_KEY.to_string(), uuid);
        user_data.insert(
            MAX_UNSAFE_AUTO_ID_TIMESTAMP_KEY.to_string(),
            self.max_unsafe_auto_id_timestamp
                .load(Ordering::SeqCst)
                .to_string(),
        );
        if let Some(sync_id) = sync_id {
            user_data.insert(SYNC_COMMIT_ID.to_string(), sync_id.to_string());
        }
        match self.segment_writer.commit(user_data) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.fail_engine("segment commit failed", &e.to_string());
                Err(e)
            }
        }
    }

    /// Fail flushes while a translog recovery has not completed; committing
    /// a partial replay would lose documents.
    fn ensure_can_flush(&self) -> Result<()> {
        if self.pending_translog_recovery.load(Ordering::SeqCst) {
            return Err(TsurugiError::illegal_state(
                "flushes are disabled, pending translog recovery",
            ));
        }
        Ok(())
    }

    /// The id of the last commit.
    pub fn commit_id(&self) -> CommitId {
        self.last_committed_segment_infos.read().commit_id.clone()
    }

    // ── force merge / snapshot ──────────────────────────────────────

    /// Merge segments down, optionally expunging deletes or upgrading
    /// old-format segments, then optionally flush.
    pub fn force_merge(
        &self,
        flush_after: bool,
        max_num_segments: i32,
        only_expunge_deletes: bool,
        upgrade: bool,
        upgrade_only_ancient_segments: bool,
    ) -> Result<()> {
        let policy = self.segment_writer.merge_policy().clone();
        let _optimize_guard = self.optimize_lock.lock();
        let outcome = (|| -> Result<()> {
            self.ensure_open()?;
            if upgrade {
                info!(
                    "starting segment upgrade upgrade_only_ancient_segments={upgrade_only_ancient_segments}"
                );
                policy.set_upgrade_in_progress(true, upgrade_only_ancient_segments);
            }
            self.store.inc_ref();
            let merged = (|| -> Result<()> {
                if only_expunge_deletes {
                    debug_assert!(!upgrade);
                    self.segment_writer.force_merge_deletes()?;
                } else if max_num_segments <= 0 {
                    debug_assert!(!upgrade);
                    self.segment_writer.maybe_merge()?;
                } else {
                    self.segment_writer.force_merge(max_num_segments as usize)?;
                }
                if flush_after && !self.try_renew_sync_commit()? {
                    self.flush(false, true)?;
                }
                if upgrade {
                    info!("finished segment upgrade");
                }
                Ok(())
            })();
            self.store.dec_ref();
            merged
        })();
        policy.set_upgrade_in_progress(false, false);
        match outcome {
            Ok(()) => Ok(()),
            Err(e) => {
                self.maybe_fail_engine("force merge", &e);
                Err(e)
            }
        }
    }

    /// Pin the current commit for snapshot/backup.
    pub fn acquire_index_commit(&self, flush_first: bool) -> Result<IndexCommit> {
        // flush outside the read lock: failing the engine mid-flush needs
        // the write path to be free
        if flush_first {
            trace!("start flush for snapshot");
            self.flush(false, true)?;
            trace!("finish flush for snapshot");
        }
        let _engine_lock = self.rwlock.read();
        self.ensure_open()?;
        trace!("pulling snapshot");
        SegmentWriter::acquire_commit(&self.segment_writer)
            .map_err(|e| TsurugiError::SnapshotFailed(e.to_string()))
    }

    // ── recovery ────────────────────────────────────────────────────

    /// Replay the translog into the engine. Valid exactly once, only for
    /// [`OpenMode::OpenIndexAndTranslog`].
    pub fn recover_from_translog(&self) -> Result<usize> {
        let replayed = {
            let _flush_guard = self.flush_lock.lock();
            {
                let _engine_lock = self.rwlock.read();
                self.ensure_open()?;
                if self.open_mode != OpenMode::OpenIndexAndTranslog {
                    return Err(TsurugiError::illegal_state(format!(
                        "cannot recover from translog with open mode {:?}",
                        self.open_mode
                    )));
                }
                if !self.pending_translog_recovery.load(Ordering::SeqCst) {
                    return Err(TsurugiError::illegal_state(
                        "engine has already been recovered",
                    ));
                }
            }
            self.replay_translog()
        };

        let ops_recovered = match replayed {
            Ok(count) => count,
            Err(e) => {
                // never allow commits after a partial replay
                self.pending_translog_recovery.store(true, Ordering::SeqCst);
                self.fail_engine("failed to recover from translog", &e.to_string());
                return Err(TsurugiError::recovery(e.to_string()));
            }
        };

        self.pending_translog_recovery.store(false, Ordering::SeqCst);
        let finished = (|| -> Result<()> {
            if ops_recovered > 0 {
                trace!(
                    "flushing post recovery from translog, ops recovered [{ops_recovered}], current translog generation [{}]",
                    self.translog.current_file_generation()
                );
                self.flush(true, true)?;
            } else {
                let committed = generation_from_user_data(
                    &self.last_committed_segment_infos.read().user_data,
                )?;
                let is_current = committed
                    .as_ref()
                    .map(|generation| self.translog.is_current(generation))
                    .unwrap_or(false);
                if !is_current {
                    // nothing replayed, but the translog rolled on open:
                    // re-bind the commit to the new generation
                    let _engine_lock = self.rwlock.read();
                    let sync_id = self
                        .last_committed_segment_infos
                        .read()
                        .user_data
                        .get(SYNC_COMMIT_ID)
                        .cloned();
                    self.commit_segment_writer(sync_id.as_deref())?;
                    *self.last_committed_segment_infos.write() =
                        self.store.read_last_committed_segment_infos()?;
                }
            }
            Ok(())
        })();
        if let Err(e) = finished {
            self.pending_translog_recovery.store(true, Ordering::SeqCst);
            self.fail_engine("failed to recover from translog", &e.to_string());
            return Err(TsurugiError::recovery(e.to_string()));
        }
        Ok(ops_recovered)
    }

    fn replay_translog(&self) -> Result<usize> {
        let snapshot = self.translog.new_snapshot()?;
        let mut ops_recovered = 0;
        for op in snapshot.into_ops() {
            match op {
                TranslogOp::Index {
                    uid,
                    version,
                    version_type,
                    docs,
                    auto_generated_id_timestamp,
                } => {
                    let doc = ParsedDocument {
                        uid: uid.clone(),
                        docs,
                    };
                    let op = Index {
                        uid,
                        doc,
                        version,
                        version_type: version_type.version_type_for_replication_and_recovery(),
                        origin: Origin::LocalTranslogRecovery,
                        start_time_nanos: self.clock.relative_time_nanos(),
                        auto_generated_id_timestamp,
                        is_retry: false,
                    };
                    let result = self.index(op)?;
                    if let Some(failure) = result.failure() {
                        return Err(TsurugiError::recovery(format!(
                            "replayed index operation failed: {failure}"
                        )));
                    }
                }
                TranslogOp::Delete {
                    uid,
                    version,
                    version_type,
                } => {
                    let op = Delete {
                        uid,
                        version,
                        version_type: version_type.version_type_for_replication_and_recovery(),
                        origin: Origin::LocalTranslogRecovery,
                        start_time_nanos: self.clock.relative_time_nanos(),
                    };
                    let result = self.delete(op)?;
                    if let Some(failure) = result.failure() {
                        return Err(TsurugiError::recovery(format!(
                            "replayed delete operation failed: {failure}"
                        )));
                    }
                }
            }
            ops_recovered += 1;
        }
        Ok(ops_recovered)
    }

    /// Whether translog recovery is still pending.
    pub fn is_recovering(&self) -> bool {
        self.pending_translog_recovery.load(Ordering::SeqCst)
    }

    // ── tombstone GC ────────────────────────────────────────────────

    /// Prune if enough time has passed since the last pass. Walking the
    /// tombstones takes the per-uid lock for each entry, so this runs at
    /// most once per quarter of the GC horizon.
    fn maybe_prune_deleted_tombstones(&self) {
        let (enabled, gc_millis) = {
            let settings = self.settings.read();
            (settings.gc_deletes_enabled, settings.gc_deletes_millis)
        };
        if enabled
            && self.clock.relative_time_millis()
                - self.last_delete_version_prune_time_millis.load(Ordering::SeqCst)
                > gc_millis / 4
        {
            self.prune_deleted_tombstones();
        }
    }

    fn prune_deleted_tombstones(&self) {
        let now = self.clock.relative_time_millis();
        let gc_millis = self.settings.read().gc_deletes_millis;
        for (uid, _) in self.version_map.all_tombstones() {
            let _uid_lock = self.keyed_lock.acquire(&uid);
            // re-read under the lock, the uid may have been written since
            if let Some(tombstone) = self.version_map.get_tombstone(&uid) {
                if now - tombstone.time_millis > gc_millis {
                    self.version_map.remove_tombstone(&uid);
                }
            }
        }
        self.last_delete_version_prune_time_millis
            .store(now, Ordering::SeqCst);
    }

    // ── throttling ──────────────────────────────────────────────────

    /// Request indexing throttling; requests are reference-counted.
    pub fn activate_throttling(&self) {
        let count = self.throttle_request_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug_assert!(count >= 1, "invalid post-increment throttle request count");
        if count == 1 {
            self.throttle.activate();
        }
    }

    /// Release one throttling request.
    pub fn deactivate_throttling(&self) {
        let count = self.throttle_request_count.fetch_sub(1, Ordering::SeqCst) - 1;
        debug_assert!(count >= 0, "invalid post-decrement throttle request count");
        if count == 0 {
            self.throttle.deactivate();
        }
    }

    /// Whether indexing is currently throttled.
    pub fn is_throttled(&self) -> bool {
        self.throttle.is_throttled()
    }

    /// Total milliseconds indexing has been throttled.
    pub fn index_throttle_time_millis(&self) -> i64 {
        self.throttle.throttle_time_millis()
    }

    // ── stats / reporting ───────────────────────────────────────────

    /// The segments of the shard, committed and searchable flags filled in.
    pub fn segments(&self, verbose: bool) -> Vec<EngineSegment> {
        let _engine_lock = self.rwlock.read();
        let infos = self.last_committed_segment_infos.read().clone();
        let committed_ids: AHashSet<u64> = infos.segments.iter().map(|m| m.id).collect();
        let searcher = self.searcher_manager.acquire("segments");
        let search_ids: AHashSet<u64> = searcher.segment_ids().iter().copied().collect();
        let on_going = self.merge_scheduler.on_going_merges();

        let mut segments = Vec::new();
        let mut seen: AHashSet<u64> = AHashSet::new();
        for segment in self.segment_writer.segments_snapshot() {
            seen.insert(segment.id);
            segments.push(self.describe_segment(
                segment.id,
                segment.doc_count,
                segment.size_bytes,
                segment.format,
                infos.generation,
                &committed_ids,
                &search_ids,
                &on_going,
                verbose,
            ));
        }
        // committed segments already merged away but still in the commit
        for meta in &infos.segments {
            if !seen.contains(&meta.id) {
                segments.push(self.describe_segment(
                    meta.id,
                    meta.doc_count,
                    meta.size_bytes,
                    meta.format,
                    infos.generation,
                    &committed_ids,
                    &search_ids,
                    &on_going,
                    verbose,
                ));
            }
        }
        segments.sort_by_key(|s| s.name.clone());
        segments
    }

    #[allow(clippy::too_many_arguments)]
    fn describe_segment(
        &self,
        id: u64,
        doc_count: u64,
        size_bytes: u64,
        format: u32,
        generation: u64,
        committed_ids: &AHashSet<u64>,
        search_ids: &AHashSet<u64>,
        on_going: &[crate::segment::writer::OnGoingMerge],
        verbose: bool,
    ) -> EngineSegment {
        let merge_id = on_going
            .iter()
            .find(|m| m.segments.contains(&id))
            .map(|m| m.id.clone());
        let attributes = verbose.then(|| {
            let mut attributes = BTreeMap::new();
            attributes.insert("format".to_string(), format.to_string());
            attributes
        });
        EngineSegment {
            name: format!("_{id}"),
            generation,
            doc_count,
            size_bytes,
            committed: committed_ids.contains(&id),
            search: search_ids.contains(&id),
            merge_id,
            attributes,
        }
    }

    /// Cumulative merge statistics.
    pub fn merge_stats(&self) -> MergeStats {
        self.merge_scheduler.stats()
    }

    /// Heap held by the indexing buffer plus the refresh-reclaimable part
    /// of the version map.
    pub fn index_buffer_ram_bytes_used(&self) -> u64 {
        self.segment_writer.ram_bytes_used() + self.version_map.ram_bytes_used_for_refresh()
    }

    /// Times a version was resolved from memory or the index.
    pub fn num_version_lookups(&self) -> u64 {
        self.num_version_lookups.load(Ordering::Relaxed)
    }

    /// Times a version lookup had to go to the index.
    pub fn num_index_version_lookups(&self) -> u64 {
        self.num_index_version_lookups.load(Ordering::Relaxed)
    }

    /// The auto-id de-optimization floor.
    pub fn max_unsafe_auto_id_timestamp(&self) -> i64 {
        self.max_unsafe_auto_id_timestamp.load(Ordering::SeqCst)
    }

    /// Whether the writer holds deletes, buffered or in segments.
    pub fn writer_has_deletions(&self) -> bool {
        self.segment_writer.has_deletions()
    }

    /// The engine's translog.
    pub fn translog(&self) -> &Arc<Translog> {
        &self.translog
    }

    /// The live version map, for introspection.
    pub fn version_map(&self) -> &Arc<LiveVersionMap> {
        &self.version_map
    }

    /// Apply changed settings: re-evaluate tombstone pruning and the
    /// anti-viral auto-id opt-out.
    pub fn on_settings_changed(&self, settings: EngineSettings) {
        let anti_viral = settings.max_unsafe_auto_id_timestamp == i64::MAX;
        *self.settings.write() = settings;
        self.maybe_prune_deleted_tombstones();
        if anti_viral {
            // opting out applies to the whole index until it is reopened
            self.max_unsafe_auto_id_timestamp
                .store(i64::MAX, Ordering::SeqCst);
        }
    }

    pub(crate) fn last_write_nanos(&self) -> i64 {
        self.last_write_nanos.load(Ordering::SeqCst)
    }

    pub(crate) fn writer_has_pending_merges(&self) -> bool {
        self.segment_writer.has_pending_merges()
    }

    // ── lifecycle / failure ─────────────────────────────────────────

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed.load(Ordering::SeqCst) {
            let reason = self.failed_engine.lock().clone();
            return Err(TsurugiError::already_closed(
                reason.unwrap_or_else(|| "engine is closed".to_string()),
            ));
        }
        Ok(())
    }

    /// Whether the engine is closed or failed.
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::SeqCst)
    }

    /// The failure reason, once the engine has failed.
    pub fn failed_reason(&self) -> Option<String> {
        self.failed_engine.lock().clone()
    }

    /// Fail the engine: record the reason once and close without waiting
    /// for in-flight operations. Idempotent.
    pub fn fail_engine(&self, reason: &str, cause: &str) {
        let Some(_fail_guard) = self.fail_engine_lock.try_lock() else {
            debug!("tried to fail engine but engine is already failing, ignoring [{reason}]");
            return;
        };
        let mut failed = self.failed_engine.lock();
        if failed.is_some() {
            debug!("tried to fail engine but engine is already failed, ignoring [{reason}]");
            return;
        }
        *failed = Some(format!("{reason}: {cause}"));
        drop(failed);
        warn!("failed engine [{reason}]: {cause}");
        if self.is_closed.load(Ordering::SeqCst) {
            // already torn down; the failure reason is recorded and sticky
            return;
        }
        // keep the store alive while tearing down
        self.store.inc_ref();
        self.close_no_lock(reason);
        self.store.dec_ref();
    }

    /// Convert an escaping error into engine failure when it is tragic.
    /// Returns whether the engine was failed.
    pub(crate) fn maybe_fail_engine(&self, source: &str, e: &TsurugiError) -> bool {
        if e.is_already_closed() {
            // AlreadyClosed is only legitimate after a tragic event
            return self.fail_on_tragic_event();
        }
        if e.is_tragic() || e.is_corruption() {
            self.fail_engine(source, &e.to_string());
            return true;
        }
        false
    }

    /// The engine observed an already-closed collaborator: fail if a tragic
    /// cause is recorded; a close without one is a bug.
    fn fail_on_tragic_event(&self) -> bool {
        if !self.segment_writer.is_open() {
            if let Some(msg) = self.segment_writer.tragic_exception() {
                let msg = msg.to_string();
                self.fail_engine("already closed by tragic event on the index writer", &msg);
                return true;
            }
        }
        if !self.translog.is_open() {
            if let Some(msg) = self.translog.tragic_exception() {
                let msg = msg.to_string();
                self.fail_engine("already closed by tragic event on the translog", &msg);
                return true;
            }
        }
        if self.failed_engine.lock().is_none() && !self.is_closed.load(Ordering::SeqCst) {
            error!("engine observed an unexpected already-closed state without a tragic cause");
            debug_assert!(false, "unexpected AlreadyClosed without a tragic event");
        }
        false
    }

    /// Close the engine, waiting for in-flight operations to drain.
    pub fn close(&self) {
        if !self.is_closed.load(Ordering::SeqCst) {
            let _engine_lock = self.rwlock.write();
            self.close_no_lock("api");
        }
    }

    /// Close without the engine write lock. Callers hold either the write
    /// lock or the fail-engine lock.
    fn close_no_lock(&self, reason: &str) {
        if self
            .is_closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.version_map.clear();
            self.translog.close();
            trace!("rollback segment writer");
            self.segment_writer.rollback();
            trace!("rollback segment writer done");
            self.store.dec_ref();
            debug!("engine closed [{reason}]");
        }
    }
}

impl Drop for InternalEngine {
    fn drop(&mut self) {
        if !self.is_closed.load(Ordering::SeqCst) {
            self.close_no_lock("destructor");
        }
    }
}

/// Append-only ops can skip the version lookup entirely when they carry an
/// auto-generated-id timestamp; local translog replay never optimizes.
fn can_optimize_add_document(index: &Index) -> bool {
    if index.auto_generated_id_timestamp != UNSET_AUTO_GENERATED_TIMESTAMP {
        debug_assert!(
            index.auto_generated_id_timestamp >= 0,
            "auto-generated-id timestamp must be positive"
        );
        return match index.origin {
            Origin::Primary => {
                debug_assert!(
                    index.version == MATCH_ANY && index.version_type == VersionType::Internal
                );
                true
            }
            Origin::Replica | Origin::PeerRecovery => {
                debug_assert!(index.version == 1 && index.version_type == VersionType::External);
                true
            }
            Origin::LocalTranslogRecovery => false,
        };
    }
    false
}

/// Replica and recovery ops must arrive with a version type that is stable
/// under replication.
fn assert_replication_version_type(version_type: VersionType, origin: Origin) -> bool {
    if origin == Origin::Primary {
        return true;
    }
    version_type == version_type.version_type_for_replication_and_recovery()
}
