//! Durable append log of mutations, replayed on crash recovery.
//!
//! The translog is a sequence of generation files (`translog-{gen}.tlog`).
//! Every record is framed `[u32 len][u32 crc32][json payload]` and synced on
//! append, so a successful [`Translog::add`] survives power loss. On open the
//! log always rolls to a fresh generation; replay covers every generation at
//! or after the one recorded by the last segment commit.
//!
//! Recovery posture: a truncated record at the tail of the **final**
//! generation is tolerated (torn write) and replay stops there. A checksum
//! mismatch, or truncation in any earlier generation, is corruption and
//! errors loudly.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, OnceLock};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::operation::Term;
use crate::engine::version::VersionType;
use crate::error::{Result, TsurugiError};
use crate::storage::{Storage, StorageOutput};

/// Commit user-data key holding the translog UUID.
pub const TRANSLOG_UUID_KEY: &str = "translog_uuid";

/// Commit user-data key holding the translog file generation.
pub const TRANSLOG_GENERATION_KEY: &str = "translog_generation";

/// Pre-UUID commit key. Accepted on read only; never written.
pub const LEGACY_TRANSLOG_ID_KEY: &str = "translog_id";

const TRANSLOG_MAGIC: u32 = 0x544c_4f47; // "TLOG"

/// Descriptor binding a translog instance and file generation to a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslogGeneration {
    /// Identity of the translog instance; `None` only when synthesized from
    /// a legacy `translog_id` commit.
    pub uuid: Option<String>,
    /// File generation replay starts from.
    pub file_gen: u64,
}

/// Position of an appended record, totally ordered by (generation, offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location {
    /// Generation file the record was appended to.
    pub generation: u64,
    /// Byte offset of the record frame within the file.
    pub offset: u64,
    /// Size of the record frame in bytes.
    pub size: u64,
}

/// A single translog operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TranslogOp {
    /// An indexed document.
    Index {
        uid: Term,
        version: i64,
        version_type: VersionType,
        docs: Vec<Value>,
        auto_generated_id_timestamp: i64,
    },
    /// A deleted document.
    Delete {
        uid: Term,
        version: i64,
        version_type: VersionType,
    },
}

impl TranslogOp {
    /// The uid this op applies to.
    pub fn uid(&self) -> &Term {
        match self {
            TranslogOp::Index { uid, .. } => uid,
            TranslogOp::Delete { uid, .. } => uid,
        }
    }
}

/// One framed record: a sequence number plus the operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TranslogRecord {
    seq: u64,
    op: TranslogOp,
}

/// A finite, ordered view of the uncommitted operations.
#[derive(Debug)]
pub struct TranslogSnapshot {
    ops: Vec<TranslogOp>,
}

impl TranslogSnapshot {
    /// Number of operations in the snapshot.
    pub fn total_operations(&self) -> usize {
        self.ops.len()
    }

    /// Iterate the operations in append order.
    pub fn iter(&self) -> impl Iterator<Item = &TranslogOp> {
        self.ops.iter()
    }

    /// Consume the snapshot, yielding the operations in append order.
    pub fn into_ops(self) -> Vec<TranslogOp> {
        self.ops
    }
}

/// Configuration for the translog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslogConfig {
    /// Whether every append is fsynced before the location is returned.
    pub sync_on_append: bool,
}

impl Default for TranslogConfig {
    fn default() -> Self {
        TranslogConfig {
            sync_on_append: true,
        }
    }
}

struct TranslogState {
    current_gen: u64,
    writer: Option<Box<dyn StorageOutput>>,
    /// Ops per retained generation; retained = at or after `replay_start_gen`.
    op_counts: BTreeMap<u64, u64>,
    /// Lowest generation replay covers (the last committed generation).
    replay_start_gen: u64,
    prepared: bool,
    next_seq: u64,
    closed: bool,
}

impl std::fmt::Debug for TranslogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslogState")
            .field("current_gen", &self.current_gen)
            .field("replay_start_gen", &self.replay_start_gen)
            .field("prepared", &self.prepared)
            .field("next_seq", &self.next_seq)
            .field("closed", &self.closed)
            .finish()
    }
}

/// The write-ahead log for a single shard.
#[derive(Debug)]
pub struct Translog {
    storage: Arc<dyn Storage>,
    config: TranslogConfig,
    uuid: String,
    state: Mutex<TranslogState>,
    tragic: OnceLock<String>,
}

impl Translog {
    /// Create a fresh translog, removing any generation files left behind by
    /// a previous instance.
    pub fn create(storage: Arc<dyn Storage>, config: TranslogConfig) -> Result<Self> {
        for name in storage.list_files()? {
            if parse_generation(&name).is_some() {
                storage.delete_file(&name)?;
            }
        }
        let uuid = Uuid::new_v4().to_string();
        let writer = open_generation_writer(storage.as_ref(), &uuid, 1)?;
        storage.sync()?;
        debug!("created translog [{uuid}] at generation [1]");
        Ok(Translog {
            storage,
            config,
            uuid,
            state: Mutex::new(TranslogState {
                current_gen: 1,
                writer: Some(writer),
                op_counts: BTreeMap::from([(1, 0)]),
                replay_start_gen: 1,
                prepared: false,
                next_seq: 0,
                closed: false,
            }),
            tragic: OnceLock::new(),
        })
    }

    /// Open an existing translog from the generation recorded in the last
    /// commit. Generations before it are reclaimed; replay covers the rest.
    /// The log rolls to a new generation so appends never touch a possibly
    /// torn tail.
    pub fn open(
        storage: Arc<dyn Storage>,
        config: TranslogConfig,
        generation: &TranslogGeneration,
    ) -> Result<Self> {
        let uuid = generation.uuid.clone().ok_or_else(|| {
            TsurugiError::translog_corrupted("cannot open a translog without a UUID")
        })?;

        let mut gens: Vec<u64> = Vec::new();
        for name in storage.list_files()? {
            if let Some(gen) = parse_generation(&name) {
                gens.push(gen);
            }
        }
        gens.sort_unstable();

        if !gens.contains(&generation.file_gen) {
            return Err(TsurugiError::translog_corrupted(format!(
                "translog generation [{}] is missing (found {gens:?})",
                generation.file_gen
            )));
        }

        // Reclaim generations the last commit no longer references.
        for &gen in gens.iter().filter(|&&g| g < generation.file_gen) {
            storage.delete_file(&generation_file_name(gen))?;
        }
        gens.retain(|&g| g >= generation.file_gen);
        for (offset, &gen) in gens.iter().enumerate() {
            if gen != generation.file_gen + offset as u64 {
                return Err(TsurugiError::translog_corrupted(format!(
                    "translog generation [{gen}] breaks the contiguous sequence starting at [{}]",
                    generation.file_gen
                )));
            }
        }

        // Validate retained files and count their operations.
        let max_gen = *gens.last().expect("at least the committed generation");
        let mut op_counts = BTreeMap::new();
        let mut next_seq = 0u64;
        for &gen in &gens {
            let records =
                read_generation(storage.as_ref(), &uuid, gen, gen == max_gen)?;
            next_seq = records
                .iter()
                .map(|r| r.seq + 1)
                .max()
                .unwrap_or(next_seq)
                .max(next_seq);
            op_counts.insert(gen, records.len() as u64);
        }

        let current_gen = max_gen + 1;
        let writer = open_generation_writer(storage.as_ref(), &uuid, current_gen)?;
        op_counts.insert(current_gen, 0);
        storage.sync()?;
        debug!(
            "opened translog [{uuid}], replaying from generation [{}], current generation [{current_gen}]",
            generation.file_gen
        );

        Ok(Translog {
            storage,
            config,
            uuid,
            state: Mutex::new(TranslogState {
                current_gen,
                writer: Some(writer),
                op_counts,
                replay_start_gen: generation.file_gen,
                prepared: false,
                next_seq,
                closed: false,
            }),
            tragic: OnceLock::new(),
        })
    }

    /// Durably append an operation and return its location.
    pub fn add(&self, op: TranslogOp) -> Result<Location> {
        self.ensure_no_tragic()?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(TsurugiError::already_closed("translog is closed"));
        }

        let seq = state.next_seq;
        let record = TranslogRecord { seq, op };
        let payload = serde_json::to_vec(&record)?;
        let crc = crc32fast::hash(&payload);
        let generation = state.current_gen;

        let result = (|| -> Result<Location> {
            let writer = state
                .writer
                .as_mut()
                .ok_or_else(|| TsurugiError::translog("translog writer is gone"))?;
            let offset = writer.position()?;
            writer.write_u32::<LittleEndian>(payload.len() as u32)?;
            writer.write_u32::<LittleEndian>(crc)?;
            writer.write_all(&payload)?;
            if self.config.sync_on_append {
                writer.flush_and_sync()?;
            } else {
                writer.flush()?;
            }
            Ok(Location {
                generation,
                offset,
                size: 8 + payload.len() as u64,
            })
        })();

        match result {
            Ok(location) => {
                state.next_seq = seq + 1;
                *state.op_counts.entry(generation).or_insert(0) += 1;
                Ok(location)
            }
            Err(e) => {
                drop(state);
                Err(self.record_tragic(format!("translog append failed: {e}")))
            }
        }
    }

    /// Snapshot every uncommitted operation, in append order.
    pub fn new_snapshot(&self) -> Result<TranslogSnapshot> {
        self.ensure_no_tragic()?;
        let (replay_start, current_gen) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TsurugiError::already_closed("translog is closed"));
            }
            if let Some(writer) = state.writer.as_mut() {
                writer.flush()?;
            }
            (state.replay_start_gen, state.current_gen)
        };

        let mut ops = Vec::new();
        let mut last_seq: Option<u64> = None;
        for gen in replay_start..=current_gen {
            if !self.storage.file_exists(&generation_file_name(gen)) {
                continue;
            }
            let records =
                read_generation(self.storage.as_ref(), &self.uuid, gen, gen == current_gen)?;
            for record in records {
                if let Some(prev) = last_seq {
                    if record.seq <= prev {
                        return Err(TsurugiError::translog_corrupted(format!(
                            "out-of-order sequence number [{}] after [{prev}]",
                            record.seq
                        )));
                    }
                }
                last_seq = Some(record.seq);
                ops.push(record.op);
            }
        }
        Ok(TranslogSnapshot { ops })
    }

    /// Roll to a new generation. Everything before the new generation becomes
    /// eligible for reclamation by the next [`Translog::commit`].
    pub fn prepare_commit(&self) -> Result<()> {
        self.ensure_no_tragic()?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(TsurugiError::already_closed("translog is closed"));
        }
        if state.prepared {
            return Err(TsurugiError::illegal_state(
                "translog is already prepared for commit",
            ));
        }
        let result = self.roll_generation_locked(&mut state);
        match result {
            Ok(()) => {
                state.prepared = true;
                trace!("translog rolled to generation [{}]", state.current_gen);
                Ok(())
            }
            Err(e) => {
                drop(state);
                Err(self.record_tragic(format!("translog prepare commit failed: {e}")))
            }
        }
    }

    /// Reclaim every generation before the current one. The caller guarantees
    /// those operations are covered by a durable segment commit.
    pub fn commit(&self) -> Result<()> {
        self.ensure_no_tragic()?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(TsurugiError::already_closed("translog is closed"));
        }
        if !state.prepared {
            if let Err(e) = self.roll_generation_locked(&mut state) {
                drop(state);
                return Err(self.record_tragic(format!("translog commit failed: {e}")));
            }
        }

        let current = state.current_gen;
        let stale: Vec<u64> = state
            .op_counts
            .keys()
            .copied()
            .filter(|&g| g < current)
            .collect();
        for gen in stale {
            let name = generation_file_name(gen);
            if self.storage.file_exists(&name) {
                self.storage.delete_file(&name)?;
            }
            state.op_counts.remove(&gen);
        }
        self.storage.sync()?;
        state.replay_start_gen = current;
        state.prepared = false;
        trace!("translog committed through generation [{current}]");
        Ok(())
    }

    /// The descriptor for the current generation.
    pub fn generation(&self) -> TranslogGeneration {
        let state = self.state.lock();
        TranslogGeneration {
            uuid: Some(self.uuid.clone()),
            file_gen: state.current_gen,
        }
    }

    /// The current file generation number.
    pub fn current_file_generation(&self) -> u64 {
        self.state.lock().current_gen
    }

    /// Whether the given descriptor points at the current generation of this
    /// translog instance.
    pub fn is_current(&self, generation: &TranslogGeneration) -> bool {
        let state = self.state.lock();
        generation.uuid.as_deref() == Some(self.uuid.as_str())
            && generation.file_gen == state.current_gen
    }

    /// Number of uncommitted operations.
    pub fn total_operations(&self) -> usize {
        let state = self.state.lock();
        state.op_counts.values().sum::<u64>() as usize
    }

    /// The identity of this translog instance.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The sticky tragic failure, if one was recorded.
    pub fn tragic_exception(&self) -> Option<&str> {
        self.tragic.get().map(|s| s.as_str())
    }

    /// Whether the translog is usable.
    pub fn is_open(&self) -> bool {
        self.tragic.get().is_none() && !self.state.lock().closed
    }

    /// Close the translog. Appends fail afterwards; files stay on disk.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if let Some(mut writer) = state.writer.take() {
            if let Err(e) = writer.flush_and_sync() {
                warn!("failed to sync translog on close: {e}");
            }
        }
        state.closed = true;
    }

    fn roll_generation_locked(&self, state: &mut TranslogState) -> Result<()> {
        if let Some(mut writer) = state.writer.take() {
            writer.flush_and_sync()?;
        }
        let next = state.current_gen + 1;
        let writer = open_generation_writer(self.storage.as_ref(), &self.uuid, next)?;
        self.storage.sync()?;
        state.current_gen = next;
        state.writer = Some(writer);
        state.op_counts.insert(next, 0);
        Ok(())
    }

    fn ensure_no_tragic(&self) -> Result<()> {
        match self.tragic.get() {
            Some(msg) => Err(TsurugiError::tragic(msg.clone())),
            None => Ok(()),
        }
    }

    fn record_tragic(&self, msg: String) -> TsurugiError {
        let _ = self.tragic.set(msg.clone());
        self.state.lock().closed = true;
        TsurugiError::tragic(msg)
    }
}

/// Parse a translog generation out of a commit's user data.
///
/// Modern commits carry `translog_uuid` + `translog_generation`. A legacy
/// `translog_id`-only commit yields a descriptor with no UUID; whether that
/// is acceptable is the caller's policy.
pub fn generation_from_user_data(
    user_data: &std::collections::BTreeMap<String, String>,
) -> Result<Option<TranslogGeneration>> {
    if let Some(id) = user_data.get(LEGACY_TRANSLOG_ID_KEY) {
        debug_assert!(
            !user_data.contains_key(TRANSLOG_UUID_KEY),
            "legacy commit contains a translog UUID"
        );
        let file_gen = id.parse::<u64>().map_err(|_| {
            TsurugiError::translog_corrupted(format!("invalid legacy translog id [{id}]"))
        })?;
        return Ok(Some(TranslogGeneration {
            uuid: None,
            file_gen,
        }));
    }
    if let Some(gen) = user_data.get(TRANSLOG_GENERATION_KEY) {
        let uuid = user_data.get(TRANSLOG_UUID_KEY).ok_or_else(|| {
            TsurugiError::illegal_state("commit doesn't contain a translog UUID")
        })?;
        let file_gen = gen.parse::<u64>().map_err(|_| {
            TsurugiError::translog_corrupted(format!("invalid translog generation [{gen}]"))
        })?;
        return Ok(Some(TranslogGeneration {
            uuid: Some(uuid.clone()),
            file_gen,
        }));
    }
    Ok(None)
}

fn generation_file_name(gen: u64) -> String {
    format!("translog-{gen}.tlog")
}

fn parse_generation(name: &str) -> Option<u64> {
    name.strip_prefix("translog-")?
        .strip_suffix(".tlog")?
        .parse()
        .ok()
}

fn open_generation_writer(
    storage: &dyn Storage,
    uuid: &str,
    gen: u64,
) -> Result<Box<dyn StorageOutput>> {
    let mut writer = storage.create_output(&generation_file_name(gen))?;
    writer.write_u32::<LittleEndian>(TRANSLOG_MAGIC)?;
    writer.write_u16::<LittleEndian>(uuid.len() as u16)?;
    writer.write_all(uuid.as_bytes())?;
    writer.write_u64::<LittleEndian>(gen)?;
    writer.flush_and_sync()?;
    Ok(writer)
}

/// Read and validate one generation file. A torn tail is tolerated only when
/// `is_final` is set; checksum mismatches are always corruption.
fn read_generation(
    storage: &dyn Storage,
    uuid: &str,
    gen: u64,
    is_final: bool,
) -> Result<Vec<TranslogRecord>> {
    let name = generation_file_name(gen);
    let mut input = storage.open_input(&name)?;

    let magic = input.read_u32::<LittleEndian>().map_err(|_| {
        TsurugiError::translog_corrupted(format!("{name}: missing header"))
    })?;
    if magic != TRANSLOG_MAGIC {
        return Err(TsurugiError::translog_corrupted(format!(
            "{name}: bad magic [{magic:#x}]"
        )));
    }
    let uuid_len = input
        .read_u16::<LittleEndian>()
        .map_err(|_| TsurugiError::translog_corrupted(format!("{name}: truncated header")))?;
    let mut uuid_bytes = vec![0u8; uuid_len as usize];
    input
        .read_exact(&mut uuid_bytes)
        .map_err(|_| TsurugiError::translog_corrupted(format!("{name}: truncated header")))?;
    if uuid_bytes != uuid.as_bytes() {
        return Err(TsurugiError::translog_corrupted(format!(
            "{name}: translog UUID mismatch, expected [{uuid}]"
        )));
    }
    let header_gen = input
        .read_u64::<LittleEndian>()
        .map_err(|_| TsurugiError::translog_corrupted(format!("{name}: truncated header")))?;
    if header_gen != gen {
        return Err(TsurugiError::translog_corrupted(format!(
            "{name}: header generation [{header_gen}] does not match file name"
        )));
    }

    let mut records = Vec::new();
    loop {
        let len = match input.read_u32::<LittleEndian>() {
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        let frame = (|| -> std::io::Result<(u32, Vec<u8>)> {
            let crc = input.read_u32::<LittleEndian>()?;
            let mut payload = vec![0u8; len as usize];
            input.read_exact(&mut payload)?;
            Ok((crc, payload))
        })();
        let (crc, payload) = match frame {
            Ok(frame) => frame,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                if is_final {
                    warn!("{name}: torn record at tail, stopping replay");
                    break;
                }
                return Err(TsurugiError::translog_corrupted(format!(
                    "{name}: truncated record in a non-final generation"
                )));
            }
            Err(e) => return Err(e.into()),
        };
        if crc32fast::hash(&payload) != crc {
            return Err(TsurugiError::translog_corrupted(format!(
                "{name}: checksum mismatch"
            )));
        }
        let record: TranslogRecord = serde_json::from_slice(&payload).map_err(|e| {
            TsurugiError::translog_corrupted(format!("{name}: undecodable record: {e}"))
        })?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn index_op(id: &str, version: i64) -> TranslogOp {
        TranslogOp::Index {
            uid: Term::new("_uid", id),
            version,
            version_type: VersionType::External,
            docs: vec![json!({"id": id})],
            auto_generated_id_timestamp: -1,
        }
    }

    #[test]
    fn test_add_returns_ordered_locations() {
        let storage = Arc::new(MemoryStorage::new_default());
        let translog = Translog::create(storage, TranslogConfig::default()).unwrap();

        let a = translog.add(index_op("a", 1)).unwrap();
        let b = translog.add(index_op("b", 1)).unwrap();
        assert!(a < b);
        assert_eq!(a.generation, b.generation);
        assert_eq!(translog.total_operations(), 2);
    }

    #[test]
    fn test_snapshot_covers_uncommitted_generations() {
        let storage = Arc::new(MemoryStorage::new_default());
        let translog = Translog::create(storage, TranslogConfig::default()).unwrap();

        translog.add(index_op("a", 1)).unwrap();
        translog.prepare_commit().unwrap();
        translog.add(index_op("b", 1)).unwrap();

        // nothing has been committed yet, both generations replay
        let snapshot = translog.new_snapshot().unwrap();
        assert_eq!(snapshot.total_operations(), 2);

        translog.commit().unwrap();
        let snapshot = translog.new_snapshot().unwrap();
        assert_eq!(snapshot.total_operations(), 1);
        assert_eq!(translog.total_operations(), 1);
    }

    #[test]
    fn test_commit_reclaims_old_generations() {
        let storage = Arc::new(MemoryStorage::new_default());
        let translog = Translog::create(storage.clone(), TranslogConfig::default()).unwrap();

        translog.add(index_op("a", 1)).unwrap();
        translog.prepare_commit().unwrap();
        translog.commit().unwrap();

        assert_eq!(translog.total_operations(), 0);
        assert!(!storage.file_exists("translog-1.tlog"));
        assert!(storage.file_exists(&generation_file_name(
            translog.current_file_generation()
        )));
    }

    #[test]
    fn test_reopen_replays_from_committed_generation() {
        let storage = Arc::new(MemoryStorage::new_default());
        let generation;
        {
            let translog =
                Translog::create(storage.clone(), TranslogConfig::default()).unwrap();
            translog.add(index_op("a", 1)).unwrap();
            translog.add(index_op("b", 2)).unwrap();
            generation = translog.generation();
            translog.close();
        }

        let translog =
            Translog::open(storage, TranslogConfig::default(), &generation).unwrap();
        let snapshot = translog.new_snapshot().unwrap();
        assert_eq!(snapshot.total_operations(), 2);
        let uids: Vec<&str> = snapshot.iter().map(|op| op.uid().text.as_str()).collect();
        assert_eq!(uids, vec!["a", "b"]);
        // reopen rolled to a fresh generation
        assert!(translog.current_file_generation() > generation.file_gen);
    }

    #[test]
    fn test_open_rejects_uuid_mismatch() {
        let storage = Arc::new(MemoryStorage::new_default());
        let generation;
        {
            let translog =
                Translog::create(storage.clone(), TranslogConfig::default()).unwrap();
            generation = TranslogGeneration {
                uuid: Some("not-the-right-uuid".to_string()),
                file_gen: translog.generation().file_gen,
            };
            translog.close();
        }
        let err = Translog::open(storage, TranslogConfig::default(), &generation).unwrap_err();
        assert!(err.is_corruption(), "expected corruption, got: {err}");
    }

    #[test]
    fn test_torn_tail_in_final_generation_is_tolerated() {
        let storage = Arc::new(MemoryStorage::new_default());
        let generation;
        {
            let translog =
                Translog::create(storage.clone(), TranslogConfig::default()).unwrap();
            translog.add(index_op("a", 1)).unwrap();
            generation = translog.generation();
            translog.close();
        }

        // append a torn frame: a length prefix with no payload behind it
        {
            let mut out = storage
                .create_output_append(&generation_file_name(generation.file_gen))
                .unwrap();
            out.write_u32::<LittleEndian>(1024).unwrap();
            out.flush_and_sync().unwrap();
        }

        let translog =
            Translog::open(storage, TranslogConfig::default(), &generation).unwrap();
        let snapshot = translog.new_snapshot().unwrap();
        assert_eq!(snapshot.total_operations(), 1);
    }

    #[test]
    fn test_corrupted_record_is_an_error() {
        let storage = Arc::new(MemoryStorage::new_default());
        let generation;
        {
            let translog =
                Translog::create(storage.clone(), TranslogConfig::default()).unwrap();
            translog.add(index_op("a", 1)).unwrap();
            generation = translog.generation();
            translog.close();
        }

        // a full frame whose checksum does not match its payload
        {
            let mut out = storage
                .create_output_append(&generation_file_name(generation.file_gen))
                .unwrap();
            let payload = b"garbage payload";
            out.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
            out.write_u32::<LittleEndian>(0xdead_beef).unwrap();
            out.write_all(payload).unwrap();
            out.flush_and_sync().unwrap();
        }

        let err =
            Translog::open(storage, TranslogConfig::default(), &generation).unwrap_err();
        assert!(err.is_corruption(), "expected corruption, got: {err}");
    }

    #[test]
    fn test_missing_generation_is_corruption() {
        let storage = Arc::new(MemoryStorage::new_default());
        let err = Translog::open(
            storage,
            TranslogConfig::default(),
            &TranslogGeneration {
                uuid: Some(Uuid::new_v4().to_string()),
                file_gen: 3,
            },
        )
        .unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_generation_from_user_data_modern_and_legacy() {
        let mut user_data = std::collections::BTreeMap::new();
        assert!(generation_from_user_data(&user_data).unwrap().is_none());

        user_data.insert(TRANSLOG_UUID_KEY.to_string(), "abc".to_string());
        user_data.insert(TRANSLOG_GENERATION_KEY.to_string(), "7".to_string());
        let generation = generation_from_user_data(&user_data).unwrap().unwrap();
        assert_eq!(generation.uuid.as_deref(), Some("abc"));
        assert_eq!(generation.file_gen, 7);

        let mut legacy = std::collections::BTreeMap::new();
        legacy.insert(LEGACY_TRANSLOG_ID_KEY.to_string(), "4".to_string());
        let generation = generation_from_user_data(&legacy).unwrap().unwrap();
        assert_eq!(generation.uuid, None);
        assert_eq!(generation.file_gen, 4);
    }

    #[test]
    fn test_is_current_tracks_generation_and_uuid() {
        let storage = Arc::new(MemoryStorage::new_default());
        let translog = Translog::create(storage, TranslogConfig::default()).unwrap();
        let generation = translog.generation();
        assert!(translog.is_current(&generation));

        translog.prepare_commit().unwrap();
        assert!(!translog.is_current(&generation));
        assert!(translog.is_current(&translog.generation()));
    }
}
