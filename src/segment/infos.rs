//! Commit-level segment metadata.
//!
//! Every commit of the segment store writes a `segments-{generation}.json`
//! file naming the live segments and carrying the commit user data, which is
//! where the translog binding lives. The newest generation on disk is the
//! authoritative commit.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TsurugiError};
use crate::storage::Storage;

/// Opaque identity of a single commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitId(pub String);

impl CommitId {
    pub(crate) fn random() -> Self {
        CommitId(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for CommitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata of one committed segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMeta {
    /// Segment id, unique within the store.
    pub id: u64,
    /// Number of live documents the segment holds.
    pub doc_count: u64,
    /// Serialized size estimate in bytes.
    pub size_bytes: u64,
    /// On-disk format version of the segment.
    pub format: u32,
}

/// The committed state of the segment store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfos {
    /// Commit generation, increasing by one per commit.
    pub generation: u64,
    /// Identity of this commit.
    pub commit_id: CommitId,
    /// Segments live at this commit, oldest first.
    pub segments: Vec<SegmentMeta>,
    /// Commit user data (translog binding, sync id, ...).
    pub user_data: BTreeMap<String, String>,
}

impl SegmentInfos {
    /// An empty, never-committed state.
    pub fn empty() -> Self {
        SegmentInfos {
            generation: 0,
            commit_id: CommitId::random(),
            segments: Vec::new(),
            user_data: BTreeMap::new(),
        }
    }

    /// The file name this state is stored under.
    pub fn file_name(&self) -> String {
        infos_file_name(self.generation)
    }

    /// Read the newest committed state, if any commit exists.
    pub fn read_latest(storage: &dyn Storage) -> Result<Option<SegmentInfos>> {
        let mut latest: Option<u64> = None;
        for name in storage.list_files()? {
            if let Some(gen) = parse_infos_generation(&name) {
                latest = Some(latest.map_or(gen, |cur: u64| cur.max(gen)));
            }
        }
        let Some(gen) = latest else {
            return Ok(None);
        };
        let mut input = storage.open_input(&infos_file_name(gen))?;
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;
        let infos: SegmentInfos = serde_json::from_slice(&bytes).map_err(|e| {
            TsurugiError::storage(format!("undecodable segment infos [{gen}]: {e}"))
        })?;
        Ok(Some(infos))
    }

    /// Durably write this state to storage.
    pub fn write(&self, storage: &dyn Storage) -> Result<()> {
        let mut output = storage.create_output(&self.file_name())?;
        let bytes = serde_json::to_vec(self)?;
        output.write_all(&bytes)?;
        output.flush_and_sync()?;
        storage.sync()?;
        Ok(())
    }
}

pub(crate) fn infos_file_name(generation: u64) -> String {
    format!("segments-{generation}.json")
}

pub(crate) fn parse_infos_generation(name: &str) -> Option<u64> {
    name.strip_prefix("segments-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

pub(crate) fn segment_file_name(id: u64) -> String {
    format!("segment-{id}.json")
}

pub(crate) fn parse_segment_id(name: &str) -> Option<u64> {
    name.strip_prefix("segment-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_read_latest_picks_highest_generation() {
        let storage = MemoryStorage::new_default();
        for gen in [1u64, 3, 2] {
            let infos = SegmentInfos {
                generation: gen,
                commit_id: CommitId::random(),
                segments: Vec::new(),
                user_data: BTreeMap::new(),
            };
            infos.write(&storage).unwrap();
        }
        let latest = SegmentInfos::read_latest(&storage).unwrap().unwrap();
        assert_eq!(latest.generation, 3);
    }

    #[test]
    fn test_read_latest_on_empty_storage() {
        let storage = MemoryStorage::new_default();
        assert!(SegmentInfos::read_latest(&storage).unwrap().is_none());
    }
}
