//! The live version map.
//!
//! Maps uid bytes to the version of the most recent in-memory mutation.
//! Entries live in two tiers: `current` receives writes, `old` is the
//! snapshot taken when a refresh starts and is dropped once the new searcher
//! makes those documents visible. Deletions additionally park a tombstone
//! that survives refreshes until garbage collection decides it is old
//! enough to forget.
//!
//! Callers hold the per-uid lock for any uid they read or write here; the
//! map's own locks only protect the tier swap.

use std::sync::atomic::{AtomicI64, Ordering};

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::segment::searcher::RefreshListener;

/// Fixed overhead charged per map entry on top of the uid bytes.
const BASE_BYTES_PER_ENTRY: i64 = 64;

/// The version of one uid as last mutated in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionValue {
    /// The version of the mutation.
    pub version: i64,
    /// Whether the mutation was a delete.
    pub is_delete: bool,
    /// Wall-clock millisecond the tombstone was recorded; 0 for live entries.
    pub time_millis: i64,
}

impl VersionValue {
    /// A live (indexed) entry.
    pub fn live(version: i64) -> Self {
        VersionValue {
            version,
            is_delete: false,
            time_millis: 0,
        }
    }

    /// A deletion tombstone recorded at `time_millis`.
    pub fn tombstone(version: i64, time_millis: i64) -> Self {
        VersionValue {
            version,
            is_delete: true,
            time_millis,
        }
    }

    fn ram_bytes(&self, uid_len: usize) -> i64 {
        uid_len as i64 + BASE_BYTES_PER_ENTRY
    }
}

#[derive(Debug, Default)]
struct Maps {
    /// Writes go here.
    current: AHashMap<Vec<u8>, VersionValue>,
    /// Snapshot from the last refresh start; read-only.
    old: AHashMap<Vec<u8>, VersionValue>,
}

/// Two-tier version map plus tombstones.
#[derive(Debug, Default)]
pub struct LiveVersionMap {
    maps: RwLock<Maps>,
    tombstones: RwLock<AHashMap<Vec<u8>, VersionValue>>,
    ram_bytes_current: AtomicI64,
    ram_bytes_old: AtomicI64,
    ram_bytes_tombstones: AtomicI64,
}

impl LiveVersionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a uid: `current` wins, then `old`, then tombstones.
    pub fn get(&self, uid: &[u8]) -> Option<VersionValue> {
        {
            let maps = self.maps.read();
            if let Some(value) = maps.current.get(uid) {
                return Some(value.clone());
            }
            if let Some(value) = maps.old.get(uid) {
                return Some(value.clone());
            }
        }
        self.tombstones.read().get(uid).cloned()
    }

    /// Record a mutation for a uid. A live put removes any matching
    /// tombstone; a delete parks one.
    pub fn put(&self, uid: Vec<u8>, value: VersionValue) {
        let entry_bytes = value.ram_bytes(uid.len());
        if value.is_delete {
            let mut tombstones = self.tombstones.write();
            if let Some(previous) = tombstones.insert(uid.clone(), value.clone()) {
                self.ram_bytes_tombstones
                    .fetch_sub(previous.ram_bytes(uid.len()), Ordering::Relaxed);
            }
            self.ram_bytes_tombstones
                .fetch_add(entry_bytes, Ordering::Relaxed);
        } else if let Some(previous) = self.tombstones.write().remove(&uid) {
            self.ram_bytes_tombstones
                .fetch_sub(previous.ram_bytes(uid.len()), Ordering::Relaxed);
        }

        let mut maps = self.maps.write();
        if let Some(previous) = maps.current.insert(uid.clone(), value) {
            self.ram_bytes_current
                .fetch_sub(previous.ram_bytes(uid.len()), Ordering::Relaxed);
        }
        self.ram_bytes_current
            .fetch_add(entry_bytes, Ordering::Relaxed);
    }

    /// The tombstone for a uid, if any.
    pub fn get_tombstone(&self, uid: &[u8]) -> Option<VersionValue> {
        self.tombstones.read().get(uid).cloned()
    }

    /// Drop a tombstone.
    pub fn remove_tombstone(&self, uid: &[u8]) {
        let mut tombstones = self.tombstones.write();
        if let Some(previous) = tombstones.remove(uid) {
            self.ram_bytes_tombstones
                .fetch_sub(previous.ram_bytes(uid.len()), Ordering::Relaxed);
        }
    }

    /// Snapshot of every tombstone. Callers re-check each uid under its
    /// lock before acting on an entry.
    pub fn all_tombstones(&self) -> Vec<(Vec<u8>, VersionValue)> {
        self.tombstones
            .read()
            .iter()
            .map(|(uid, value)| (uid.clone(), value.clone()))
            .collect()
    }

    /// Bytes held by all tiers.
    pub fn ram_bytes_used(&self) -> u64 {
        (self.ram_bytes_current.load(Ordering::Relaxed)
            + self.ram_bytes_old.load(Ordering::Relaxed)
            + self.ram_bytes_tombstones.load(Ordering::Relaxed))
        .max(0) as u64
    }

    /// Bytes a refresh would reclaim: `current` plus tombstones. The `old`
    /// tier is excluded, it is about to be freed anyway.
    pub fn ram_bytes_used_for_refresh(&self) -> u64 {
        (self.ram_bytes_current.load(Ordering::Relaxed)
            + self.ram_bytes_tombstones.load(Ordering::Relaxed))
        .max(0) as u64
    }

    /// Drop everything. Only valid while the engine is closing.
    pub fn clear(&self) {
        let mut maps = self.maps.write();
        maps.current.clear();
        maps.old.clear();
        self.tombstones.write().clear();
        self.ram_bytes_current.store(0, Ordering::Relaxed);
        self.ram_bytes_old.store(0, Ordering::Relaxed);
        self.ram_bytes_tombstones.store(0, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn current_len(&self) -> usize {
        self.maps.read().current.len()
    }

    #[cfg(test)]
    fn old_len(&self) -> usize {
        self.maps.read().old.len()
    }
}

impl RefreshListener for LiveVersionMap {
    /// Redirect writes to a fresh `current`; the outgoing tier stays
    /// readable as `old` until the refresh completes.
    fn before_refresh(&self) {
        let mut maps = self.maps.write();
        maps.old = std::mem::take(&mut maps.current);
        self.ram_bytes_old.store(
            self.ram_bytes_current.swap(0, Ordering::Relaxed),
            Ordering::Relaxed,
        );
    }

    /// The new searcher is live; whatever `old` held is now visible in the
    /// index and can be dropped.
    fn after_refresh(&self, _did_refresh: bool) {
        let mut maps = self.maps.write();
        maps.old = AHashMap::new();
        self.ram_bytes_old.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_precedence_current_then_old_then_tombstones() {
        let map = LiveVersionMap::new();
        map.put(b"a".to_vec(), VersionValue::live(1));
        map.before_refresh();
        // "a" moved to old, still visible
        assert_eq!(map.get(b"a").unwrap().version, 1);

        map.put(b"a".to_vec(), VersionValue::live(2));
        assert_eq!(map.get(b"a").unwrap().version, 2);

        map.after_refresh(true);
        assert_eq!(map.get(b"a").unwrap().version, 2);
    }

    #[test]
    fn test_refresh_cycle_drops_old_entries() {
        let map = LiveVersionMap::new();
        map.put(b"a".to_vec(), VersionValue::live(1));
        assert_eq!(map.current_len(), 1);

        map.before_refresh();
        assert_eq!(map.current_len(), 0);
        assert_eq!(map.old_len(), 1);

        map.after_refresh(true);
        assert_eq!(map.old_len(), 0);
        assert!(map.get(b"a").is_none());
    }

    #[test]
    fn test_tombstones_survive_refresh() {
        let map = LiveVersionMap::new();
        map.put(b"a".to_vec(), VersionValue::tombstone(3, 1000));
        map.before_refresh();
        map.after_refresh(true);

        let value = map.get(b"a").unwrap();
        assert!(value.is_delete);
        assert_eq!(value.version, 3);
        assert_eq!(value.time_millis, 1000);
    }

    #[test]
    fn test_live_put_removes_matching_tombstone() {
        let map = LiveVersionMap::new();
        map.put(b"a".to_vec(), VersionValue::tombstone(3, 1000));
        map.put(b"a".to_vec(), VersionValue::live(4));
        map.before_refresh();
        map.after_refresh(true);
        // the tombstone must not resurface after the live entry is evicted
        assert!(map.get(b"a").is_none());
    }

    #[test]
    fn test_ram_accounting_for_refresh_excludes_old() {
        let map = LiveVersionMap::new();
        map.put(b"aaaa".to_vec(), VersionValue::live(1));
        let before = map.ram_bytes_used_for_refresh();
        assert!(before > 0);

        map.before_refresh();
        assert_eq!(map.ram_bytes_used_for_refresh(), 0);
        assert!(map.ram_bytes_used() >= before);

        map.after_refresh(true);
        assert_eq!(map.ram_bytes_used(), 0);
    }

    #[test]
    fn test_remove_tombstone() {
        let map = LiveVersionMap::new();
        map.put(b"a".to_vec(), VersionValue::tombstone(1, 5));
        assert_eq!(map.all_tombstones().len(), 1);
        map.remove_tombstone(b"a");
        assert!(map.get_tombstone(b"a").is_none());
        assert_eq!(map.ram_bytes_used_for_refresh(), 0);
    }
}
