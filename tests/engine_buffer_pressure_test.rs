use std::sync::Arc;

use serde_json::json;
use tsurugi::engine::{
    EngineConfig, Index, InternalEngine, ManualClock, OpenMode, ParsedDocument, Term,
};
use tsurugi::error::Result;
use tsurugi::storage::MemoryStorage;

fn uid(id: &str) -> Term {
    Term::new("_uid", id)
}

fn open_engine() -> Result<Arc<InternalEngine>> {
    let config = EngineConfig::new(
        Arc::new(MemoryStorage::new_default()),
        OpenMode::CreateIndexAndTranslog,
    )
    .with_clock(Arc::new(ManualClock::new()));
    InternalEngine::open(config)
}

#[test]
fn test_version_map_pressure_forces_a_refresh() -> Result<()> {
    let engine = open_engine()?;

    // tiny documents: the version map outweighs a quarter of the buffer
    for i in 0..8 {
        let id = format!("tiny-{i}");
        let doc = ParsedDocument::new(uid(&id), json!({"v": i}));
        engine.index(Index::primary(doc, 0))?;
    }
    assert!(
        engine.version_map().ram_bytes_used_for_refresh() > engine.index_buffer_ram_bytes_used() / 8
    );

    engine.write_indexing_buffer()?;

    // the refresh variant clears the version map and opens a new reader
    assert!(
        engine.version_map().get(&uid("tiny-0").bytes()).is_none(),
        "refresh must clear the version map"
    );
    let searcher = engine.acquire_searcher("test")?;
    assert_eq!(searcher.doc_count(), 8, "docs are searchable without an explicit refresh");
    Ok(())
}

#[test]
fn test_large_buffer_takes_the_cheap_flush() -> Result<()> {
    let engine = open_engine()?;

    // one fat document: the buffer dwarfs the version map
    let filler = "x".repeat(4096);
    let doc = ParsedDocument::new(uid("fat"), json!({"filler": filler}));
    engine.index(Index::primary(doc, 0))?;

    engine.write_indexing_buffer()?;

    // the cheap path cut a segment but did not refresh
    assert!(
        engine.version_map().get(&uid("fat").bytes()).is_some(),
        "a segment flush must not touch the version map"
    );
    let searcher = engine.acquire_searcher("test")?;
    assert_eq!(
        searcher.count(&uid("fat")),
        0,
        "no new reader was opened"
    );

    // memory was still released from the indexing buffer
    assert_eq!(
        engine.index_buffer_ram_bytes_used(),
        engine.version_map().ram_bytes_used_for_refresh()
    );
    Ok(())
}

#[test]
fn test_refresh_clears_old_version_map_tier() -> Result<()> {
    let engine = open_engine()?;
    let doc = ParsedDocument::new(uid("a"), json!({"v": 1}));
    engine.index(Index::primary(doc, 0))?;

    assert!(engine.version_map().ram_bytes_used() > 0);
    engine.refresh("test")?;
    assert_eq!(
        engine.version_map().ram_bytes_used(),
        0,
        "both tiers are empty after a full refresh"
    );
    Ok(())
}
