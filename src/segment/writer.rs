//! The buffered segment writer.
//!
//! Mutations are buffered in memory as an ordered action list. `flush` cuts
//! the buffer into an immutable in-memory segment; `commit` persists every
//! live segment plus a new [`SegmentInfos`] generation carrying the commit
//! user data. Replaying the segment action lists oldest-first reproduces the
//! visible document set, which is how the searcher builds its point-in-time
//! view.
//!
//! Failures split the same way the engine expects: a rejected document
//! leaves the writer healthy, while an I/O failure during commit is recorded
//! in the sticky tragic channel and poisons the writer.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use ahash::{AHashMap, AHashSet};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::operation::{ParsedDocument, Term};
use crate::error::{Result, TsurugiError};
use crate::segment::infos::{
    parse_infos_generation, parse_segment_id, segment_file_name, CommitId, SegmentInfos,
    SegmentMeta,
};
use crate::segment::store::Store;

/// Current on-disk segment format.
pub const SEGMENT_FORMAT_CURRENT: u32 = 2;

const ACTION_OVERHEAD_BYTES: u64 = 48;

/// One recorded mutation inside a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SegmentAction {
    /// Append documents without displacing an existing uid.
    Add {
        uid: Term,
        version: i64,
        docs: Vec<Value>,
    },
    /// Replace any existing documents under the uid.
    Update {
        uid: Term,
        version: i64,
        docs: Vec<Value>,
    },
    /// Remove any existing documents under the uid.
    Delete { uid: Term },
}

impl SegmentAction {
    fn ram_bytes(&self) -> u64 {
        let payload = match self {
            SegmentAction::Add { uid, docs, .. } | SegmentAction::Update { uid, docs, .. } => {
                uid.bytes().len() as u64
                    + docs
                        .iter()
                        .map(|d| serde_json::to_vec(d).map(|v| v.len() as u64).unwrap_or(64))
                        .sum::<u64>()
            }
            SegmentAction::Delete { uid } => uid.bytes().len() as u64,
        };
        payload + ACTION_OVERHEAD_BYTES
    }
}

/// An immutable cut of buffered mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    /// Segment id, unique within the store.
    pub id: u64,
    /// On-disk format version.
    pub format: u32,
    /// The mutations, in arrival order.
    pub actions: Vec<SegmentAction>,
    /// Documents added by this segment.
    pub doc_count: u64,
    /// Serialized size estimate in bytes.
    pub size_bytes: u64,
}

impl Segment {
    fn meta(&self) -> SegmentMeta {
        SegmentMeta {
            id: self.id,
            doc_count: self.doc_count,
            size_bytes: self.size_bytes,
            format: self.format,
        }
    }
}

/// A merge in flight, reported to the merge listener.
#[derive(Debug, Clone)]
pub struct OnGoingMerge {
    /// Identity of the merge.
    pub id: String,
    /// Segments being merged.
    pub segments: Vec<u64>,
    /// Documents going into the merge.
    pub total_docs: u64,
    /// Bytes going into the merge.
    pub total_size_bytes: u64,
}

/// Callbacks around merge execution.
pub trait MergeListener: Send + Sync + std::fmt::Debug {
    /// A merge is about to run.
    fn before_merge(&self, merge: &OnGoingMerge);

    /// A merge finished (successfully or not).
    fn after_merge(&self, merge: &OnGoingMerge);

    /// A merge failed. Never invoked while writer locks are held, so the
    /// listener may schedule engine failure.
    fn handle_merge_exception(&self, error: &TsurugiError);
}

/// Merge selection policy, with a one-shot upgrade mode for force-merge.
#[derive(Debug)]
pub struct MergePolicy {
    /// Segment count above which background merging kicks in.
    pub max_segment_count: usize,
    upgrade_in_progress: AtomicBool,
    upgrade_only_ancient: AtomicBool,
}

impl MergePolicy {
    /// Create a policy merging down to `max_segment_count` segments.
    pub fn new(max_segment_count: usize) -> Self {
        MergePolicy {
            max_segment_count: max_segment_count.max(1),
            upgrade_in_progress: AtomicBool::new(false),
            upgrade_only_ancient: AtomicBool::new(false),
        }
    }

    /// Arm or reset the one-shot upgrade mode.
    pub fn set_upgrade_in_progress(&self, upgrade: bool, only_ancient: bool) {
        self.upgrade_in_progress.store(upgrade, Ordering::SeqCst);
        self.upgrade_only_ancient
            .store(only_ancient, Ordering::SeqCst);
    }

    fn upgrade_in_progress(&self) -> bool {
        self.upgrade_in_progress.load(Ordering::SeqCst)
    }

    fn upgrade_only_ancient(&self) -> bool {
        self.upgrade_only_ancient.load(Ordering::SeqCst)
    }

    /// Pick the next natural merge: the adjacent pair with the smallest
    /// combined size, once the segment count exceeds the budget. In upgrade
    /// mode, old-format segments are selected individually for rewrite.
    fn find_merge(&self, segments: &[Arc<Segment>]) -> Option<(usize, usize)> {
        if self.upgrade_in_progress() {
            let only_ancient = self.upgrade_only_ancient();
            if let Some(idx) = segments.iter().position(|s| {
                s.format < SEGMENT_FORMAT_CURRENT
                    || (!only_ancient && s.format != SEGMENT_FORMAT_CURRENT)
            }) {
                return Some((idx, 1));
            }
        }
        if segments.len() <= self.max_segment_count {
            return None;
        }
        let mut best: Option<(usize, u64)> = None;
        for idx in 0..segments.len() - 1 {
            let combined = segments[idx].size_bytes + segments[idx + 1].size_bytes;
            if best.map_or(true, |(_, size)| combined < size) {
                best = Some((idx, combined));
            }
        }
        best.map(|(idx, _)| (idx, 2))
    }
}

#[derive(Debug)]
struct WriterState {
    buffer: Vec<SegmentAction>,
    segments: Vec<Arc<Segment>>,
    committed: SegmentInfos,
    next_segment_id: u64,
    /// Changes (segments cut, merges, rollbacks) since the last commit.
    dirty: bool,
    /// Pinned commits: generation -> files that must not be reclaimed.
    pinned: AHashMap<u64, Vec<String>>,
}

/// The segment store's writer.
#[derive(Debug)]
pub struct SegmentWriter {
    store: Arc<Store>,
    policy: Arc<MergePolicy>,
    state: Mutex<WriterState>,
    ram_bytes: AtomicU64,
    change_stamp: AtomicU64,
    closed: AtomicBool,
    tragic: OnceLock<String>,
    merge_listener: Mutex<Option<Arc<dyn MergeListener>>>,
}

impl SegmentWriter {
    /// Open a writer. With `create` set, any previous commit is discarded;
    /// otherwise the newest commit is loaded and must exist.
    pub fn open(store: Arc<Store>, policy: Arc<MergePolicy>, create: bool) -> Result<Self> {
        let storage = store.storage().clone();
        let (committed, segments) = if create {
            // wipe whatever a previous instance left behind
            for name in storage.list_files()? {
                if parse_infos_generation(&name).is_some() || parse_segment_id(&name).is_some() {
                    storage.delete_file(&name)?;
                }
            }
            (SegmentInfos::empty(), Vec::new())
        } else {
            let committed = SegmentInfos::read_latest(storage.as_ref())?.ok_or_else(|| {
                TsurugiError::storage("cannot append to a store without a commit".to_string())
            })?;
            let mut segments = Vec::with_capacity(committed.segments.len());
            for meta in &committed.segments {
                segments.push(Arc::new(read_segment(storage.as_ref(), meta.id)?));
            }
            // drop segment files a crash left orphaned between flush and commit
            let referenced: AHashSet<u64> = committed.segments.iter().map(|m| m.id).collect();
            for name in storage.list_files()? {
                if let Some(id) = parse_segment_id(&name) {
                    if !referenced.contains(&id) {
                        debug!("removing orphaned segment file [{name}]");
                        storage.delete_file(&name)?;
                    }
                }
            }
            (committed, segments)
        };

        let next_segment_id = segments.iter().map(|s| s.id + 1).max().unwrap_or(1);
        Ok(SegmentWriter {
            store,
            policy,
            state: Mutex::new(WriterState {
                buffer: Vec::new(),
                segments,
                committed,
                next_segment_id,
                dirty: false,
                pinned: AHashMap::new(),
            }),
            ram_bytes: AtomicU64::new(0),
            change_stamp: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            tragic: OnceLock::new(),
            merge_listener: Mutex::new(None),
        })
    }

    /// Register the listener notified around merges.
    pub fn set_merge_listener(&self, listener: Arc<dyn MergeListener>) {
        *self.merge_listener.lock() = Some(listener);
    }

    /// The merge policy driving this writer.
    pub fn merge_policy(&self) -> &Arc<MergePolicy> {
        &self.policy
    }

    /// Append documents without displacing an existing uid.
    pub fn add_document(&self, doc: &ParsedDocument, version: i64) -> Result<()> {
        self.ensure_open()?;
        validate_document(doc)?;
        self.push_action(SegmentAction::Add {
            uid: doc.uid.clone(),
            version,
            docs: doc.docs.clone(),
        });
        Ok(())
    }

    /// Replace any existing documents under the uid.
    pub fn update_document(&self, uid: &Term, doc: &ParsedDocument, version: i64) -> Result<()> {
        self.ensure_open()?;
        validate_document(doc)?;
        self.push_action(SegmentAction::Update {
            uid: uid.clone(),
            version,
            docs: doc.docs.clone(),
        });
        Ok(())
    }

    /// Remove any existing documents under the uid.
    pub fn delete_documents(&self, uid: &Term) -> Result<()> {
        self.ensure_open()?;
        self.push_action(SegmentAction::Delete { uid: uid.clone() });
        Ok(())
    }

    /// Cut the buffer into a new segment without opening a new view. This is
    /// the cheap way to release indexing-buffer memory.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        self.cut_segment_locked(&mut state);
        Ok(())
    }

    /// Commit: cut the buffer, persist segments and a new infos generation
    /// with the given user data, then reclaim unreferenced files.
    pub fn commit(&self, user_data: BTreeMap<String, String>) -> Result<SegmentInfos> {
        self.ensure_open()?;
        let result = self.commit_inner(user_data);
        match result {
            Ok(infos) => {
                self.run_merges()?;
                Ok(infos)
            }
            Err(e) => Err(self.record_tragic(format!("segment commit failed: {e}"))),
        }
    }

    fn commit_inner(&self, user_data: BTreeMap<String, String>) -> Result<SegmentInfos> {
        let storage = self.store.storage().clone();
        let mut state = self.state.lock();
        self.cut_segment_locked(&mut state);

        let previous = state.committed.clone();
        let infos = SegmentInfos {
            generation: previous.generation + 1,
            commit_id: CommitId::random(),
            segments: state.segments.iter().map(|s| s.meta()).collect(),
            user_data,
        };

        for segment in &state.segments {
            let name = segment_file_name(segment.id);
            if !storage.file_exists(&name) {
                write_segment(storage.as_ref(), segment)?;
            }
        }
        infos.write(storage.as_ref())?;

        // reclaim every store file the new commit no longer references,
        // unless a pinned commit still needs it
        let referenced: AHashSet<String> = infos
            .segments
            .iter()
            .map(|m| segment_file_name(m.id))
            .chain(std::iter::once(infos.file_name()))
            .collect();
        let pinned: AHashSet<String> = state
            .pinned
            .values()
            .flat_map(|files| files.iter().cloned())
            .collect();
        for name in storage.list_files()? {
            let is_store_file =
                parse_segment_id(&name).is_some() || parse_infos_generation(&name).is_some();
            if is_store_file && !referenced.contains(&name) && !pinned.contains(&name) {
                storage.delete_file(&name)?;
            }
        }
        storage.sync()?;

        state.committed = infos.clone();
        state.dirty = false;
        trace!(
            "committed segment infos generation [{}] with [{}] segments",
            infos.generation,
            infos.segments.len()
        );
        Ok(infos)
    }

    /// Whether anything changed since the last commit.
    pub fn has_uncommitted_changes(&self) -> bool {
        let state = self.state.lock();
        state.dirty || !state.buffer.is_empty()
    }

    /// Bytes held by the in-memory indexing buffer.
    pub fn ram_bytes_used(&self) -> u64 {
        self.ram_bytes.load(Ordering::Relaxed)
    }

    /// Monotonic stamp bumped whenever the visible segment list changes.
    pub fn change_stamp(&self) -> u64 {
        self.change_stamp.load(Ordering::SeqCst)
    }

    /// Snapshot of the live segments, oldest first.
    pub fn segments_snapshot(&self) -> Vec<Arc<Segment>> {
        self.state.lock().segments.clone()
    }

    /// The last committed state.
    pub fn committed_infos(&self) -> SegmentInfos {
        self.state.lock().committed.clone()
    }

    /// Whether any deletes exist, buffered or already cut into segments.
    pub fn has_deletions(&self) -> bool {
        let is_deletion = |action: &SegmentAction| {
            matches!(
                action,
                SegmentAction::Delete { .. } | SegmentAction::Update { .. }
            )
        };
        let state = self.state.lock();
        state.buffer.iter().any(is_deletion)
            || state
                .segments
                .iter()
                .any(|segment| segment.actions.iter().any(is_deletion))
    }

    /// Whether the policy would merge right now.
    pub fn has_pending_merges(&self) -> bool {
        let state = self.state.lock();
        self.policy.find_merge(&state.segments).is_some()
    }

    /// Run natural merges until the policy is satisfied.
    pub fn maybe_merge(&self) -> Result<()> {
        self.ensure_open()?;
        self.run_merges()
    }

    /// Merge until at most `max_num_segments` remain.
    pub fn force_merge(&self, max_num_segments: usize) -> Result<()> {
        self.ensure_open()?;
        let max = max_num_segments.max(1);
        loop {
            let plan = {
                let state = self.state.lock();
                if state.segments.len() <= max {
                    // upgrade mode may still want single-segment rewrites
                    self.policy
                        .upgrade_in_progress()
                        .then(|| self.policy.find_merge(&state.segments))
                        .flatten()
                } else {
                    Some((0, 2))
                }
            };
            let Some((start, len)) = plan else {
                return Ok(());
            };
            self.merge_range(start, len)?;
        }
    }

    /// Fold every segment into one, expunging deletes.
    pub fn force_merge_deletes(&self) -> Result<()> {
        self.ensure_open()?;
        let len = self.state.lock().segments.len();
        if len > 1 {
            self.merge_range(0, len)?;
        } else if len == 1 {
            // single segment: rewrite in place to drop shadowed entries
            self.merge_range(0, 1)?;
        }
        Ok(())
    }

    /// Discard uncommitted changes and poison the writer. The last durable
    /// commit stays untouched.
    pub fn rollback(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock();
        state.buffer.clear();
        self.ram_bytes.store(0, Ordering::Relaxed);
        debug!("segment writer rolled back");
    }

    /// Whether the writer accepts operations.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.tragic.get().is_none()
    }

    /// The sticky tragic failure, if one was recorded.
    pub fn tragic_exception(&self) -> Option<&str> {
        self.tragic.get().map(|s| s.as_str())
    }

    /// Pin the current commit so its files survive future commits. The pin
    /// is dropped with the returned handle.
    pub fn acquire_commit(writer: &Arc<SegmentWriter>) -> Result<IndexCommit> {
        writer.ensure_open()?;
        let mut state = writer.state.lock();
        if state.committed.generation == 0 {
            return Err(TsurugiError::SnapshotFailed(
                "no commit exists yet".to_string(),
            ));
        }
        let files: Vec<String> = state
            .committed
            .segments
            .iter()
            .map(|m| segment_file_name(m.id))
            .chain(std::iter::once(state.committed.file_name()))
            .collect();
        let generation = state.committed.generation;
        state.pinned.insert(generation, files.clone());
        Ok(IndexCommit {
            generation,
            segment_files: files,
            user_data: state.committed.user_data.clone(),
            writer: Arc::downgrade(writer),
        })
    }

    fn release_commit(&self, generation: u64) {
        self.state.lock().pinned.remove(&generation);
    }

    fn push_action(&self, action: SegmentAction) {
        let bytes = action.ram_bytes();
        let mut state = self.state.lock();
        state.buffer.push(action);
        self.ram_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn cut_segment_locked(&self, state: &mut WriterState) {
        if state.buffer.is_empty() {
            return;
        }
        let actions = std::mem::take(&mut state.buffer);
        let doc_count = actions
            .iter()
            .filter(|a| !matches!(a, SegmentAction::Delete { .. }))
            .map(|a| match a {
                SegmentAction::Add { docs, .. } | SegmentAction::Update { docs, .. } => {
                    docs.len() as u64
                }
                SegmentAction::Delete { .. } => 0,
            })
            .sum();
        let size_bytes: u64 = actions.iter().map(|a| a.ram_bytes()).sum();
        let segment = Segment {
            id: state.next_segment_id,
            format: SEGMENT_FORMAT_CURRENT,
            actions,
            doc_count,
            size_bytes,
        };
        state.next_segment_id += 1;
        trace!(
            "cut segment [{}] with [{}] docs",
            segment.id,
            segment.doc_count
        );
        state.segments.push(Arc::new(segment));
        state.dirty = true;
        self.ram_bytes.store(0, Ordering::Relaxed);
        self.change_stamp.fetch_add(1, Ordering::SeqCst);
    }

    fn run_merges(&self) -> Result<()> {
        loop {
            let plan = {
                let state = self.state.lock();
                self.policy.find_merge(&state.segments)
            };
            let Some((start, len)) = plan else {
                return Ok(());
            };
            self.merge_range(start, len)?;
        }
    }

    /// Merge `len` adjacent segments starting at `start`. Listener callbacks
    /// run outside the writer lock.
    fn merge_range(&self, start: usize, len: usize) -> Result<()> {
        let run: Vec<Arc<Segment>> = {
            let state = self.state.lock();
            if start + len > state.segments.len() {
                return Ok(());
            }
            state.segments[start..start + len].to_vec()
        };
        if run.is_empty() {
            return Ok(());
        }

        let merge = OnGoingMerge {
            id: Uuid::new_v4().to_string(),
            segments: run.iter().map(|s| s.id).collect(),
            total_docs: run.iter().map(|s| s.doc_count).sum(),
            total_size_bytes: run.iter().map(|s| s.size_bytes).sum(),
        };
        let listener = self.merge_listener.lock().clone();
        if let Some(listener) = &listener {
            listener.before_merge(&merge);
        }

        let result = self.execute_merge(&merge, &run, start);

        if let Some(listener) = &listener {
            listener.after_merge(&merge);
            if let Err(e) = &result {
                listener.handle_merge_exception(e);
            }
        }
        result
    }

    fn execute_merge(&self, merge: &OnGoingMerge, run: &[Arc<Segment>], start: usize) -> Result<()> {
        // Fold the run outside the lock; the result only applies if the run
        // is still in place when we re-acquire it.
        let keeps_older = start > 0;
        let folded = fold_segments(run, keeps_older);

        let mut state = self.state.lock();
        let still_in_place = state.segments.len() >= start + run.len()
            && state.segments[start..start + run.len()]
                .iter()
                .zip(run)
                .all(|(a, b)| a.id == b.id);
        if !still_in_place {
            trace!("merge [{}] abandoned, segments changed underneath", merge.id);
            return Ok(());
        }

        let doc_count = folded
            .iter()
            .map(|a| match a {
                SegmentAction::Add { docs, .. } | SegmentAction::Update { docs, .. } => {
                    docs.len() as u64
                }
                SegmentAction::Delete { .. } => 0,
            })
            .sum();
        let size_bytes: u64 = folded.iter().map(|a| a.ram_bytes()).sum();
        let segment = Arc::new(Segment {
            id: state.next_segment_id,
            format: SEGMENT_FORMAT_CURRENT,
            actions: folded,
            doc_count,
            size_bytes,
        });
        state.next_segment_id += 1;
        state
            .segments
            .splice(start..start + run.len(), std::iter::once(segment.clone()));
        state.dirty = true;
        self.change_stamp.fetch_add(1, Ordering::SeqCst);
        debug!(
            "merged segments {:?} into [{}] ({} docs)",
            merge.segments, segment.id, segment.doc_count
        );
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if let Some(msg) = self.tragic.get() {
            return Err(TsurugiError::tragic(msg.clone()));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(TsurugiError::already_closed("segment writer is closed"));
        }
        Ok(())
    }

    fn record_tragic(&self, msg: String) -> TsurugiError {
        let _ = self.tragic.set(msg.clone());
        self.closed.store(true, Ordering::SeqCst);
        warn!("segment writer hit a tragic event: {msg}");
        TsurugiError::tragic(msg)
    }
}

/// Fold a run of segments into a single action list. When `keep_shadows` is
/// set, uids the run deleted or replaced are preserved as leading deletes so
/// they keep shadowing older segments outside the run.
fn fold_segments(run: &[Arc<Segment>], keep_shadows: bool) -> Vec<SegmentAction> {
    let mut shadows: Vec<Term> = Vec::new();
    let mut shadowed: AHashSet<Vec<u8>> = AHashSet::new();
    let mut live: Vec<(Term, i64, Vec<Value>)> = Vec::new();

    for segment in run {
        for action in &segment.actions {
            match action {
                SegmentAction::Add { uid, version, docs } => {
                    live.push((uid.clone(), *version, docs.clone()));
                }
                SegmentAction::Update { uid, version, docs } => {
                    let key = uid.bytes();
                    live.retain(|(t, _, _)| t.bytes() != key);
                    if shadowed.insert(key) {
                        shadows.push(uid.clone());
                    }
                    live.push((uid.clone(), *version, docs.clone()));
                }
                SegmentAction::Delete { uid } => {
                    let key = uid.bytes();
                    live.retain(|(t, _, _)| t.bytes() != key);
                    if shadowed.insert(key) {
                        shadows.push(uid.clone());
                    }
                }
            }
        }
    }

    let mut folded = Vec::with_capacity(shadows.len() + live.len());
    if keep_shadows {
        for uid in shadows {
            folded.push(SegmentAction::Delete { uid });
        }
    }
    for (uid, version, docs) in live {
        folded.push(SegmentAction::Add { uid, version, docs });
    }
    folded
}

fn validate_document(doc: &ParsedDocument) -> Result<()> {
    if doc.uid.text.is_empty() {
        return Err(TsurugiError::document_failure(
            "document uid term is empty",
        ));
    }
    if doc.docs.is_empty() {
        return Err(TsurugiError::document_failure(
            "parsed document has no store documents",
        ));
    }
    Ok(())
}

fn write_segment(storage: &dyn crate::storage::Storage, segment: &Segment) -> Result<()> {
    let mut output = storage.create_output(&segment_file_name(segment.id))?;
    let bytes = serde_json::to_vec(segment)?;
    output.write_all(&bytes)?;
    output.flush_and_sync()?;
    Ok(())
}

fn read_segment(storage: &dyn crate::storage::Storage, id: u64) -> Result<Segment> {
    let mut input = storage.open_input(&segment_file_name(id))?;
    let mut bytes = Vec::new();
    input.read_to_end(&mut bytes)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| TsurugiError::storage(format!("undecodable segment [{id}]: {e}")))
}

/// A pinned commit for snapshot/backup. Dropping the handle releases the pin.
#[derive(Debug)]
pub struct IndexCommit {
    /// Commit generation.
    pub generation: u64,
    /// Files making up the commit.
    pub segment_files: Vec<String>,
    /// The commit's user data.
    pub user_data: BTreeMap<String, String>,
    writer: Weak<SegmentWriter>,
}

impl Drop for IndexCommit {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.upgrade() {
            writer.release_commit(self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::infos::infos_file_name;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn test_writer(max_segments: usize) -> Arc<SegmentWriter> {
        let store = Store::new(Arc::new(MemoryStorage::new_default()));
        Arc::new(
            SegmentWriter::open(store, Arc::new(MergePolicy::new(max_segments)), true).unwrap(),
        )
    }

    fn doc(id: &str, value: i64) -> ParsedDocument {
        ParsedDocument::new(Term::new("_uid", id), json!({"id": id, "value": value}))
    }

    #[test]
    fn test_flush_cuts_a_segment_and_frees_ram() {
        let writer = test_writer(10);
        writer.add_document(&doc("a", 1), 1).unwrap();
        assert!(writer.ram_bytes_used() > 0);
        assert!(writer.has_uncommitted_changes());

        writer.flush().unwrap();
        assert_eq!(writer.ram_bytes_used(), 0);
        assert_eq!(writer.segments_snapshot().len(), 1);
        assert!(writer.has_uncommitted_changes());
    }

    #[test]
    fn test_commit_persists_and_clears_dirty() {
        let store = Store::new(Arc::new(MemoryStorage::new_default()));
        let writer = Arc::new(
            SegmentWriter::open(store.clone(), Arc::new(MergePolicy::new(10)), true).unwrap(),
        );
        writer.add_document(&doc("a", 1), 1).unwrap();
        let infos = writer.commit(BTreeMap::new()).unwrap();
        assert_eq!(infos.generation, 1);
        assert!(!writer.has_uncommitted_changes());

        let reread = store.read_last_committed_segment_infos().unwrap();
        assert_eq!(reread, infos);
    }

    #[test]
    fn test_reopen_after_commit_restores_segments() {
        let storage = Arc::new(MemoryStorage::new_default());
        {
            let store = Store::new(storage.clone());
            let writer =
                SegmentWriter::open(store, Arc::new(MergePolicy::new(10)), true).unwrap();
            writer.add_document(&doc("a", 1), 1).unwrap();
            writer.commit(BTreeMap::new()).unwrap();
        }
        let store = Store::new(storage);
        let writer = SegmentWriter::open(store, Arc::new(MergePolicy::new(10)), false).unwrap();
        let segments = writer.segments_snapshot();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].doc_count, 1);
    }

    #[test]
    fn test_document_failure_keeps_writer_healthy() {
        let writer = test_writer(10);
        let bad = ParsedDocument::new(Term::new("_uid", ""), json!({}));
        let err = writer.add_document(&bad, 1).unwrap_err();
        assert!(matches!(err, TsurugiError::DocumentFailure(_)));
        assert!(writer.tragic_exception().is_none());
        assert!(writer.is_open());
        writer.add_document(&doc("a", 1), 1).unwrap();
    }

    #[test]
    fn test_merges_fold_updates_and_deletes() {
        let writer = test_writer(1);
        writer.add_document(&doc("a", 1), 1).unwrap();
        writer.flush().unwrap();
        writer.update_document(&Term::new("_uid", "a"), &doc("a", 2), 2).unwrap();
        writer.add_document(&doc("b", 1), 1).unwrap();
        writer.flush().unwrap();
        writer.delete_documents(&Term::new("_uid", "b")).unwrap();
        writer.flush().unwrap();

        writer.maybe_merge().unwrap();
        let segments = writer.segments_snapshot();
        assert_eq!(segments.len(), 1);
        // one live doc (a@2), b was deleted
        let folded = fold_segments(&segments, false);
        assert_eq!(folded.len(), 1);
        match &folded[0] {
            SegmentAction::Add { uid, version, .. } => {
                assert_eq!(uid.text, "a");
                assert_eq!(*version, 2);
            }
            other => panic!("expected Add, got {other:?}"),
        }
    }

    #[test]
    fn test_merge_preserves_shadow_over_older_segments() {
        let writer = test_writer(100);
        writer.add_document(&doc("a", 1), 1).unwrap();
        writer.flush().unwrap();
        writer.update_document(&Term::new("_uid", "a"), &doc("a", 2), 2).unwrap();
        writer.flush().unwrap();
        writer.add_document(&doc("b", 1), 1).unwrap();
        writer.flush().unwrap();

        // merge the two NEWER segments; the update must keep shadowing
        // the old copy of "a" in segment one
        writer.merge_range(1, 2).unwrap();
        let segments = writer.segments_snapshot();
        assert_eq!(segments.len(), 2);
        let folded = fold_segments(&segments, false);
        let mut uids: Vec<(&str, i64)> = folded
            .iter()
            .filter_map(|a| match a {
                SegmentAction::Add { uid, version, .. } => Some((uid.text.as_str(), *version)),
                _ => None,
            })
            .collect();
        uids.sort();
        assert_eq!(uids, vec![("a", 2), ("b", 1)]);
    }

    #[test]
    fn test_acquire_commit_pins_files_across_commits() {
        let store = Store::new(Arc::new(MemoryStorage::new_default()));
        let storage = store.storage().clone();
        let writer = Arc::new(
            SegmentWriter::open(store, Arc::new(MergePolicy::new(10)), true).unwrap(),
        );
        writer.add_document(&doc("a", 1), 1).unwrap();
        writer.commit(BTreeMap::new()).unwrap();

        let commit = SegmentWriter::acquire_commit(&writer).unwrap();
        let pinned_infos = infos_file_name(commit.generation);

        writer.add_document(&doc("b", 1), 1).unwrap();
        writer.commit(BTreeMap::new()).unwrap();
        assert!(storage.file_exists(&pinned_infos), "pinned commit was reclaimed");

        drop(commit);
        writer.add_document(&doc("c", 1), 1).unwrap();
        writer.commit(BTreeMap::new()).unwrap();
        assert!(!storage.file_exists(&pinned_infos), "released commit should be reclaimed");
    }

    #[test]
    fn test_rollback_discards_buffered_changes() {
        let writer = test_writer(10);
        writer.add_document(&doc("a", 1), 1).unwrap();
        writer.rollback();
        assert!(!writer.is_open());
        assert!(writer.add_document(&doc("b", 1), 1).is_err());
    }
}
