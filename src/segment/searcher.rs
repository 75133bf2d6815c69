//! Point-in-time search views over the segment store.
//!
//! The [`SearcherManager`] owns the current view and reopens it on demand.
//! Refresh listeners are notified around every refresh attempt; the live
//! version map registers itself here so its `old` tier is dropped exactly
//! when a new view makes those documents visible.

use std::sync::Arc;

use ahash::AHashMap;
use log::trace;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::engine::operation::Term;
use crate::error::{Result, TsurugiError};
use crate::segment::writer::{Segment, SegmentAction, SegmentWriter};

/// Notified around every refresh attempt.
pub trait RefreshListener: Send + Sync + std::fmt::Debug {
    /// A refresh is about to run.
    fn before_refresh(&self);

    /// A refresh attempt finished; `did_refresh` says whether a new view
    /// was actually opened.
    fn after_refresh(&self, did_refresh: bool);
}

/// One visible copy of a document.
#[derive(Debug, Clone)]
struct ViewEntry {
    version: i64,
    docs: Vec<Value>,
}

/// An immutable uid -> documents view of the segment store.
#[derive(Debug)]
pub struct SearcherView {
    stamp: u64,
    entries: AHashMap<Vec<u8>, Vec<ViewEntry>>,
    segment_ids: Vec<u64>,
    doc_count: u64,
}

impl SearcherView {
    fn build(stamp: u64, segments: &[Arc<Segment>]) -> Self {
        let mut entries: AHashMap<Vec<u8>, Vec<ViewEntry>> = AHashMap::new();
        for segment in segments {
            for action in &segment.actions {
                match action {
                    SegmentAction::Add { uid, version, docs } => {
                        entries.entry(uid.bytes()).or_default().push(ViewEntry {
                            version: *version,
                            docs: docs.clone(),
                        });
                    }
                    SegmentAction::Update { uid, version, docs } => {
                        let slot = entries.entry(uid.bytes()).or_default();
                        slot.clear();
                        slot.push(ViewEntry {
                            version: *version,
                            docs: docs.clone(),
                        });
                    }
                    SegmentAction::Delete { uid } => {
                        entries.remove(&uid.bytes());
                    }
                }
            }
        }
        entries.retain(|_, copies| !copies.is_empty());
        let doc_count = entries.values().map(|copies| copies.len() as u64).sum();
        SearcherView {
            stamp,
            entries,
            segment_ids: segments.iter().map(|s| s.id).collect(),
            doc_count,
        }
    }
}

/// A point-in-time reader over one [`SearcherView`].
#[derive(Debug, Clone)]
pub struct Searcher {
    source: String,
    view: Arc<SearcherView>,
}

impl Searcher {
    /// Why this searcher was acquired.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The current version of the uid, newest copy winning.
    pub fn load_version(&self, uid: &Term) -> Option<i64> {
        self.view
            .entries
            .get(&uid.bytes())
            .and_then(|copies| copies.last())
            .map(|entry| entry.version)
    }

    /// How many copies of the uid are visible.
    pub fn count(&self, uid: &Term) -> usize {
        self.view
            .entries
            .get(&uid.bytes())
            .map_or(0, |copies| copies.len())
    }

    /// The newest visible copy: version plus root document.
    pub fn get(&self, uid: &Term) -> Option<(i64, Value)> {
        self.view
            .entries
            .get(&uid.bytes())
            .and_then(|copies| copies.last())
            .map(|entry| {
                (
                    entry.version,
                    entry.docs.last().cloned().unwrap_or(Value::Null),
                )
            })
    }

    /// Total visible document copies.
    pub fn doc_count(&self) -> u64 {
        self.view.doc_count
    }

    /// Segments backing this view.
    pub fn segment_ids(&self) -> &[u64] {
        &self.view.segment_ids
    }
}

/// Manages the current point-in-time view and refreshes it on demand.
#[derive(Debug)]
pub struct SearcherManager {
    writer: Arc<SegmentWriter>,
    current: RwLock<Arc<SearcherView>>,
    listeners: Mutex<Vec<Arc<dyn RefreshListener>>>,
    /// Serializes refresh attempts so listener callbacks never interleave.
    refresh_lock: Mutex<()>,
}

impl SearcherManager {
    /// Open a manager over the writer's current state.
    pub fn new(writer: Arc<SegmentWriter>) -> Result<Self> {
        let segments = writer.segments_snapshot();
        let view = Arc::new(SearcherView::build(writer.change_stamp(), &segments));
        Ok(SearcherManager {
            writer,
            current: RwLock::new(view),
            listeners: Mutex::new(Vec::new()),
            refresh_lock: Mutex::new(()),
        })
    }

    /// Register a refresh listener.
    pub fn add_listener(&self, listener: Arc<dyn RefreshListener>) {
        self.listeners.lock().push(listener);
    }

    /// Acquire the current point-in-time searcher.
    pub fn acquire(&self, source: &str) -> Searcher {
        Searcher {
            source: source.to_string(),
            view: self.current.read().clone(),
        }
    }

    /// Refresh the view if the segment state moved on. Buffered documents
    /// are flushed into a segment first, so everything indexed before this
    /// call is visible to searchers acquired afterwards.
    pub fn maybe_refresh_blocking(&self) -> Result<bool> {
        let _refresh_guard = self.refresh_lock.lock();
        if !self.writer.is_open() {
            if let Some(msg) = self.writer.tragic_exception() {
                return Err(TsurugiError::tragic(msg.to_string()));
            }
            return Err(TsurugiError::already_closed("segment writer is closed"));
        }

        let listeners: Vec<Arc<dyn RefreshListener>> = self.listeners.lock().clone();
        for listener in &listeners {
            listener.before_refresh();
        }

        let result = (|| -> Result<bool> {
            self.writer.flush()?;
            let stamp = self.writer.change_stamp();
            let did_refresh = self.current.read().stamp != stamp;
            if did_refresh {
                let segments = self.writer.segments_snapshot();
                let view = Arc::new(SearcherView::build(stamp, &segments));
                *self.current.write() = view;
                trace!("refreshed searcher to stamp [{stamp}]");
            }
            Ok(did_refresh)
        })();

        match result {
            Ok(did_refresh) => {
                for listener in &listeners {
                    listener.after_refresh(did_refresh);
                }
                Ok(did_refresh)
            }
            Err(e) => {
                for listener in &listeners {
                    listener.after_refresh(false);
                }
                Err(e)
            }
        }
    }
}
