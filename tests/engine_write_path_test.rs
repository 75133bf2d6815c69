use std::sync::Arc;

use serde_json::json;
use tsurugi::engine::{
    Delete, EngineConfig, EngineSettings, Get, Index, InternalEngine, ManualClock, OpenMode,
    Origin, ParsedDocument, Term, VersionType,
};
use tsurugi::error::Result;
use tsurugi::storage::MemoryStorage;

fn create_engine(
    storage: Arc<MemoryStorage>,
    clock: Arc<ManualClock>,
) -> Result<Arc<InternalEngine>> {
    let config = EngineConfig::new(storage, OpenMode::CreateIndexAndTranslog).with_clock(clock);
    InternalEngine::open(config)
}

fn uid(id: &str) -> Term {
    Term::new("_uid", id)
}

fn doc(id: &str) -> ParsedDocument {
    ParsedDocument::new(uid(id), json!({"id": id}))
}

#[test]
fn test_fresh_create_indexes_at_version_one() -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let engine = create_engine(Arc::new(MemoryStorage::new_default()), clock)?;

    let op = Index::primary(doc("a"), 0).with_auto_generated_id(1000, false);
    let result = engine.index(op)?;

    assert_eq!(result.version(), 1);
    assert!(result.created());
    assert!(!result.has_failure());
    assert!(result.translog_location().is_some(), "op must be logged");
    // the optimized append must not raise the de-optimization floor
    assert_eq!(engine.max_unsafe_auto_id_timestamp(), -1);

    let value = engine.version_map().get(&uid("a").bytes()).unwrap();
    assert_eq!(value.version, 1);
    assert!(!value.is_delete);
    Ok(())
}

#[test]
fn test_retry_deoptimizes_and_reports_an_update() -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let engine = create_engine(Arc::new(MemoryStorage::new_default()), clock)?;

    engine.index(Index::primary(doc("a"), 0).with_auto_generated_id(1000, false))?;
    let retry = engine.index(Index::primary(doc("a"), 0).with_auto_generated_id(1000, true))?;

    assert!(engine.max_unsafe_auto_id_timestamp() >= 1000);
    assert_eq!(retry.version(), 1);
    assert!(!retry.created(), "a retried delivery is not a create");

    // the doc must exist exactly once despite the double delivery
    engine.refresh("test")?;
    let searcher = engine.acquire_searcher("test")?;
    assert_eq!(searcher.count(&uid("a")), 1);

    // later appends with smaller timestamps stay de-optimized but correct
    let late = engine.index(Index::primary(doc("b"), 0).with_auto_generated_id(900, false))?;
    assert_eq!(late.version(), 1);
    engine.refresh("test")?;
    let searcher = engine.acquire_searcher("test")?;
    assert_eq!(searcher.count(&uid("b")), 1);
    Ok(())
}

#[test]
fn test_internal_versioning_increments_per_uid() -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let engine = create_engine(Arc::new(MemoryStorage::new_default()), clock)?;

    let mut last_version = 0;
    for round in 0..5 {
        let result = engine.index(Index::primary(doc("a"), round))?;
        assert!(
            result.version() > last_version,
            "internal versions must increase"
        );
        last_version = result.version();
        assert_eq!(result.created(), round == 0);
    }
    assert_eq!(last_version, 5);
    Ok(())
}

#[test]
fn test_version_conflict_is_captured_not_raised() -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let engine = create_engine(Arc::new(MemoryStorage::new_default()), clock)?;

    engine.index(Index::primary(doc("a"), 0))?;
    let conflicting =
        engine.index(Index::primary(doc("a"), 0).with_version(7, VersionType::Internal))?;

    let failure = conflicting.failure().expect("conflict must be captured");
    assert!(failure.is_version_conflict());
    assert_eq!(failure.current_version(), Some(1));
    assert!(
        conflicting.translog_location().is_none(),
        "failed ops are not logged"
    );

    // the engine keeps serving writes
    let next = engine.index(Index::primary(doc("a"), 0))?;
    assert_eq!(next.version(), 2);
    Ok(())
}

#[test]
fn test_external_versions_are_applied_verbatim() -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let engine = create_engine(Arc::new(MemoryStorage::new_default()), clock)?;

    let result =
        engine.index(Index::primary(doc("a"), 0).with_version(42, VersionType::External))?;
    assert_eq!(result.version(), 42);

    let stale = engine.index(Index::primary(doc("a"), 0).with_version(41, VersionType::External))?;
    assert!(stale.failure().is_some_and(|e| e.is_version_conflict()));
    Ok(())
}

#[test]
fn test_out_of_order_replica_delete_keeps_newest_tombstone() -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let engine = create_engine(Arc::new(MemoryStorage::new_default()), clock)?;

    let first = engine.delete(
        Delete::primary(uid("b"), 0)
            .with_version(3, VersionType::External)
            .with_origin(Origin::Replica),
    )?;
    assert!(!first.has_failure());
    assert_eq!(first.version(), 3);

    // the older delete arrives late; replicas never raise conflicts
    let stale = engine.delete(
        Delete::primary(uid("b"), 0)
            .with_version(2, VersionType::External)
            .with_origin(Origin::Replica),
    )?;
    assert!(!stale.has_failure());
    assert_eq!(stale.version(), 2);

    let tombstone = engine.version_map().get_tombstone(&uid("b").bytes()).unwrap();
    assert_eq!(tombstone.version, 3, "the newest deletion must win");
    Ok(())
}

#[test]
fn test_replica_ops_are_idempotent() -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let engine = create_engine(Arc::new(MemoryStorage::new_default()), clock)?;

    for _ in 0..2 {
        let result = engine.index(
            Index::primary(doc("a"), 0)
                .with_version(5, VersionType::External)
                .with_origin(Origin::Replica),
        )?;
        assert!(!result.has_failure());
        assert_eq!(result.version(), 5);
    }
    engine.refresh("test")?;
    let searcher = engine.acquire_searcher("test")?;
    assert_eq!(searcher.count(&uid("a")), 1);
    assert_eq!(searcher.load_version(&uid("a")), Some(5));

    for _ in 0..2 {
        let result = engine.delete(
            Delete::primary(uid("a"), 0)
                .with_version(6, VersionType::External)
                .with_origin(Origin::Replica),
        )?;
        assert!(!result.has_failure());
    }
    engine.refresh("test")?;
    let searcher = engine.acquire_searcher("test")?;
    assert_eq!(searcher.count(&uid("a")), 0);
    let tombstone = engine.version_map().get_tombstone(&uid("a").bytes()).unwrap();
    assert_eq!(tombstone.version, 6);
    Ok(())
}

#[test]
fn test_document_failure_keeps_engine_open() -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let engine = create_engine(Arc::new(MemoryStorage::new_default()), clock)?;

    let bad = ParsedDocument::new(Term::new("_uid", ""), json!({}));
    let result = engine.index(Index::primary(bad, 0))?;
    let failure = result.failure().expect("document failure must be captured");
    assert!(matches!(
        failure,
        tsurugi::TsurugiError::DocumentFailure(_)
    ));
    assert!(result.translog_location().is_none());

    assert!(!engine.is_closed(), "a document failure is not tragic");
    engine.index(Index::primary(doc("a"), 0))?;
    Ok(())
}

#[test]
fn test_realtime_get_sees_unrefreshed_writes() -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let engine = create_engine(Arc::new(MemoryStorage::new_default()), clock)?;

    engine.index(Index::primary(doc("a"), 0))?;

    // a non-realtime get skips the version map and misses the doc
    let stale = engine.get(&Get::new(uid("a")).realtime(false), |source| {
        engine.acquire_searcher(source)
    })?;
    assert!(!stale.exists);

    // the realtime get forces a refresh and finds it
    let result = engine.get(&Get::new(uid("a")), |source| {
        engine.acquire_searcher(source)
    })?;
    assert!(result.exists);
    assert_eq!(result.version, 1);
    assert_eq!(result.source.unwrap()["id"], "a");
    Ok(())
}

#[test]
fn test_realtime_get_of_deleted_doc_is_not_exists() -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let engine = create_engine(Arc::new(MemoryStorage::new_default()), clock)?;

    engine.index(Index::primary(doc("a"), 0))?;
    engine.delete(Delete::primary(uid("a"), 0))?;

    let result = engine.get(&Get::new(uid("a")), |source| {
        engine.acquire_searcher(source)
    })?;
    assert!(!result.exists);
    Ok(())
}

#[test]
fn test_realtime_get_checks_the_expected_version() -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let engine = create_engine(Arc::new(MemoryStorage::new_default()), clock)?;

    engine.index(Index::primary(doc("a"), 0))?;
    engine.index(Index::primary(doc("a"), 0))?;

    let err = engine
        .get(
            &Get::new(uid("a")).with_version(1, VersionType::Internal),
            |source| engine.acquire_searcher(source),
        )
        .unwrap_err();
    assert!(err.is_version_conflict());
    assert_eq!(err.current_version(), Some(2));
    Ok(())
}

#[test]
fn test_tombstones_are_pruned_only_after_the_gc_horizon() -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let settings = EngineSettings {
        gc_deletes_millis: 60_000,
        ..EngineSettings::default()
    };
    let config = EngineConfig::new(
        Arc::new(MemoryStorage::new_default()),
        OpenMode::CreateIndexAndTranslog,
    )
    .with_clock(clock.clone())
    .with_settings(settings);
    let engine = InternalEngine::open(config)?;

    engine.index(Index::primary(doc("a"), 0))?;
    engine.delete(Delete::primary(uid("a"), 0))?;
    assert!(engine.version_map().get_tombstone(&uid("a").bytes()).is_some());

    // inside the horizon the tombstone must survive any prune attempt
    clock.advance_millis(59_000);
    engine.refresh("prune_check")?;
    assert!(
        engine.version_map().get_tombstone(&uid("a").bytes()).is_some(),
        "tombstone pruned before its time"
    );

    // past the horizon (and past the prune rate limit) it is collected
    clock.advance_millis(20_000);
    engine.refresh("prune_check")?;
    assert!(engine.version_map().get_tombstone(&uid("a").bytes()).is_none());
    Ok(())
}

#[test]
fn test_expired_tombstone_resolves_as_absent() -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let engine = create_engine(Arc::new(MemoryStorage::new_default()), clock.clone())?;

    engine.index(Index::primary(doc("a"), 0))?;
    engine.delete(Delete::primary(uid("a"), 0))?;

    // within the horizon, internal versioning resumes from the tombstone
    let result = engine.index(Index::primary(doc("a"), 0))?;
    assert_eq!(result.version(), 3);

    engine.delete(Delete::primary(uid("a"), 0))?;
    clock.advance_millis(120_000);
    // past the horizon the doc counts as never-seen again
    let result = engine.index(Index::primary(doc("a"), 0))?;
    assert_eq!(result.version(), 1);
    Ok(())
}

#[test]
fn test_throttle_requests_are_reference_counted() -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let engine = create_engine(Arc::new(MemoryStorage::new_default()), clock)?;

    assert!(!engine.is_throttled());
    engine.activate_throttling();
    engine.activate_throttling();
    assert!(engine.is_throttled());
    engine.deactivate_throttling();
    assert!(engine.is_throttled(), "one request is still outstanding");
    engine.deactivate_throttling();
    assert!(!engine.is_throttled());
    Ok(())
}

#[test]
fn test_concurrent_indexing_of_distinct_uids() -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let engine = create_engine(Arc::new(MemoryStorage::new_default()), clock)?;

    let mut handles = Vec::new();
    for thread in 0..4 {
        let engine = engine.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..25 {
                let id = format!("doc-{thread}-{i}");
                let result = engine
                    .index(Index::primary(doc(&id), 0))
                    .expect("index must succeed");
                assert_eq!(result.version(), 1);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    engine.refresh("test")?;
    let searcher = engine.acquire_searcher("test")?;
    assert_eq!(searcher.doc_count(), 100);
    Ok(())
}

#[test]
fn test_ops_after_close_fail_with_already_closed() -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let engine = create_engine(Arc::new(MemoryStorage::new_default()), clock)?;
    engine.close();

    let err = engine.index(Index::primary(doc("a"), 0)).unwrap_err();
    assert!(err.is_already_closed());
    Ok(())
}
