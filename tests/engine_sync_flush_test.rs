use std::sync::Arc;

use serde_json::json;
use tsurugi::engine::{
    EngineConfig, EngineSettings, Index, InternalEngine, ManualClock, OpenMode, ParsedDocument,
    SyncedFlushResult, Term,
};
use tsurugi::error::Result;
use tsurugi::segment::CommitId;
use tsurugi::storage::MemoryStorage;

fn uid(id: &str) -> Term {
    Term::new("_uid", id)
}

fn doc(id: &str) -> ParsedDocument {
    ParsedDocument::new(uid(id), json!({"id": id}))
}

fn open_engine(max_segment_count: usize) -> Result<Arc<InternalEngine>> {
    let settings = EngineSettings {
        max_segment_count,
        ..EngineSettings::default()
    };
    let config = EngineConfig::new(
        Arc::new(MemoryStorage::new_default()),
        OpenMode::CreateIndexAndTranslog,
    )
    .with_clock(Arc::new(ManualClock::new()))
    .with_settings(settings);
    InternalEngine::open(config)
}

fn committed_sync_id(engine: &InternalEngine) -> Option<String> {
    let commit = engine.acquire_index_commit(false).unwrap();
    commit.user_data.get("sync_commit_id").cloned()
}

#[test]
fn test_sync_flush_marks_a_quiescent_shard() -> Result<()> {
    let engine = open_engine(10)?;
    engine.index(Index::primary(doc("a"), 0))?;
    let commit_id = engine.flush(false, true)?;

    let outcome = engine.sync_flush("sync-1", &commit_id)?;
    assert_eq!(outcome, SyncedFlushResult::Success);
    assert_eq!(committed_sync_id(&engine).as_deref(), Some("sync-1"));
    Ok(())
}

#[test]
fn test_sync_flush_rejects_a_stale_commit_id() -> Result<()> {
    let engine = open_engine(10)?;
    engine.index(Index::primary(doc("a"), 0))?;
    engine.flush(false, true)?;

    let bogus = CommitId("not-the-current-commit".to_string());
    let outcome = engine.sync_flush("sync-1", &bogus)?;
    assert_eq!(outcome, SyncedFlushResult::CommitMismatch);
    assert_eq!(committed_sync_id(&engine), None, "no commit may be written");
    Ok(())
}

#[test]
fn test_sync_flush_rejects_pending_operations() -> Result<()> {
    let engine = open_engine(10)?;
    engine.index(Index::primary(doc("a"), 0))?;
    let commit_id = engine.flush(false, true)?;
    engine.index(Index::primary(doc("b"), 0))?;

    let outcome = engine.sync_flush("sync-1", &commit_id)?;
    assert_eq!(outcome, SyncedFlushResult::PendingOperations);
    assert_eq!(committed_sync_id(&engine), None);
    Ok(())
}

#[test]
fn test_flush_drops_the_sync_marker() -> Result<()> {
    let engine = open_engine(10)?;
    engine.index(Index::primary(doc("a"), 0))?;
    let commit_id = engine.flush(false, true)?;
    engine.sync_flush("sync-1", &commit_id)?;

    engine.index(Index::primary(doc("b"), 0))?;
    engine.flush(false, true)?;
    assert_eq!(
        committed_sync_id(&engine),
        None,
        "a real flush must not carry the sync id forward"
    );
    Ok(())
}

#[test]
fn test_renew_sync_commit_after_segment_bookkeeping() -> Result<()> {
    // two committed segments, then a merge dirties the writer without any
    // translog traffic
    let engine = open_engine(10)?;
    engine.index(Index::primary(doc("a"), 0))?;
    engine.flush(false, true)?;
    engine.index(Index::primary(doc("b"), 0))?;
    let commit_id = engine.flush(false, true)?;
    assert_eq!(engine.sync_flush("sync-1", &commit_id)?, SyncedFlushResult::Success);

    engine.force_merge(false, 1, false, false, false)?;
    assert!(engine.merge_stats().total >= 1, "the merge must have run");

    let renewed = engine.try_renew_sync_commit()?;
    assert!(renewed, "segment-only changes keep the sync id renewable");
    assert_eq!(committed_sync_id(&engine).as_deref(), Some("sync-1"));

    // nothing left to renew on a second attempt
    assert!(!engine.try_renew_sync_commit()?);
    Ok(())
}

#[test]
fn test_renew_is_refused_with_translog_operations() -> Result<()> {
    let engine = open_engine(10)?;
    engine.index(Index::primary(doc("a"), 0))?;
    let commit_id = engine.flush(false, true)?;
    engine.sync_flush("sync-1", &commit_id)?;

    engine.index(Index::primary(doc("b"), 0))?;
    assert!(
        !engine.try_renew_sync_commit()?,
        "uncommitted translog ops require a full flush"
    );
    Ok(())
}

#[test]
fn test_force_merge_with_flush_renews_the_sync_marker() -> Result<()> {
    let engine = open_engine(10)?;
    engine.index(Index::primary(doc("a"), 0))?;
    engine.flush(false, true)?;
    engine.index(Index::primary(doc("b"), 0))?;
    let commit_id = engine.flush(false, true)?;
    engine.sync_flush("sync-1", &commit_id)?;

    engine.force_merge(true, 1, false, false, false)?;
    assert_eq!(
        committed_sync_id(&engine).as_deref(),
        Some("sync-1"),
        "the post-merge flush path must renew instead of dropping the marker"
    );

    let segments = engine.segments(false);
    let committed: Vec<_> = segments.iter().filter(|s| s.committed).collect();
    assert_eq!(committed.len(), 1, "force merge down to one segment");
    Ok(())
}

#[test]
fn test_force_merge_expunge_deletes_rewrites_segments() -> Result<()> {
    let engine = open_engine(100)?;
    engine.index(Index::primary(doc("a"), 0))?;
    engine.index(Index::primary(doc("b"), 0))?;
    engine.flush(false, true)?;
    engine.delete(tsurugi::engine::Delete::primary(uid("b"), 0))?;
    engine.flush(false, true)?;
    assert!(engine.writer_has_deletions());

    engine.force_merge(true, 0, true, false, false)?;
    assert!(
        !engine.writer_has_deletions(),
        "expunge must fold deletes away"
    );
    let searcher = engine.acquire_searcher("test")?;
    assert_eq!(searcher.count(&uid("a")), 1);
    assert_eq!(searcher.count(&uid("b")), 0);
    Ok(())
}

#[test]
fn test_segments_report_flags() -> Result<()> {
    let engine = open_engine(10)?;
    engine.index(Index::primary(doc("a"), 0))?;
    engine.flush(false, true)?;
    engine.index(Index::primary(doc("b"), 0))?;
    engine.refresh("test")?;

    let segments = engine.segments(true);
    assert_eq!(segments.len(), 2);
    assert!(segments.iter().all(|s| s.search), "both are searchable");
    assert_eq!(
        segments.iter().filter(|s| s.committed).count(),
        1,
        "only the flushed segment is committed"
    );
    assert!(segments.iter().all(|s| s.attributes.is_some()));
    Ok(())
}
