//! Engine operations and their results.
//!
//! Documents arrive here already parsed: a field mapper upstream produces a
//! [`ParsedDocument`] and the uid [`Term`] identifying it within the shard.
//! The engine only plans versioning, applies the op to the segment store,
//! and appends it to the translog.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::version::{VersionType, MATCH_ANY};
use crate::error::TsurugiError;
use crate::translog::Location;

/// A term uniquely identifying a document within the shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Term {
    /// Field the term indexes (conventionally `_uid`).
    pub field: String,
    /// Term text.
    pub text: String,
}

impl Term {
    /// Create a new term.
    pub fn new<F: Into<String>, T: Into<String>>(field: F, text: T) -> Self {
        Term {
            field: field.into(),
            text: text.into(),
        }
    }

    /// Byte form of the term, used to key the striped lock table and the
    /// live version map.
    pub fn bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.field.len() + 1 + self.text.len());
        bytes.extend_from_slice(self.field.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(self.text.as_bytes());
        bytes
    }
}

/// A document parsed by the upstream mappers, ready for the segment store.
///
/// Nested-object mapping may expand a single source into multiple store
/// documents; the root document is last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDocument {
    /// The uid term shared by all expanded documents.
    pub uid: Term,
    /// The store documents, root last.
    pub docs: Vec<Value>,
}

impl ParsedDocument {
    /// Create a parsed document with a single store document.
    pub fn new(uid: Term, source: Value) -> Self {
        ParsedDocument {
            uid,
            docs: vec![source],
        }
    }

    /// The root store document, when the mapper produced one.
    pub fn root(&self) -> Option<&Value> {
        self.docs.last()
    }
}

/// Where an operation originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// The shard is acting as primary for this op.
    Primary,
    /// The op was replicated from a primary.
    Replica,
    /// The op is replayed from a peer during file-based recovery.
    PeerRecovery,
    /// The op is replayed from the local translog at startup.
    LocalTranslogRecovery,
}

impl Origin {
    /// True for the recovery origins.
    pub fn is_recovery(&self) -> bool {
        matches!(self, Origin::PeerRecovery | Origin::LocalTranslogRecovery)
    }
}

/// Marker for an unassigned auto-generated-id timestamp.
pub const UNSET_AUTO_GENERATED_TIMESTAMP: i64 = -1;

/// An index (create or update) operation.
#[derive(Debug, Clone)]
pub struct Index {
    /// The uid term for the document.
    pub uid: Term,
    /// The parsed document to index.
    pub doc: ParsedDocument,
    /// Expected/assigned version, depending on the version type.
    pub version: i64,
    /// How `version` is interpreted.
    pub version_type: VersionType,
    /// Where the op originated.
    pub origin: Origin,
    /// Monotonic start time of the op, in nanoseconds.
    pub start_time_nanos: i64,
    /// Timestamp assigned when the document id was auto-generated, or
    /// [`UNSET_AUTO_GENERATED_TIMESTAMP`].
    pub auto_generated_id_timestamp: i64,
    /// Whether this delivery is a retry of a possibly-delivered op.
    pub is_retry: bool,
}

impl Index {
    /// Create an index op as a primary with engine-assigned versioning.
    pub fn primary(doc: ParsedDocument, start_time_nanos: i64) -> Self {
        Index {
            uid: doc.uid.clone(),
            doc,
            version: MATCH_ANY,
            version_type: VersionType::Internal,
            origin: Origin::Primary,
            start_time_nanos,
            auto_generated_id_timestamp: UNSET_AUTO_GENERATED_TIMESTAMP,
            is_retry: false,
        }
    }

    /// Set the auto-generated-id timestamp and retry flag.
    pub fn with_auto_generated_id(mut self, timestamp: i64, is_retry: bool) -> Self {
        self.auto_generated_id_timestamp = timestamp;
        self.is_retry = is_retry;
        self
    }

    /// Set an explicit version and version type.
    pub fn with_version(mut self, version: i64, version_type: VersionType) -> Self {
        self.version = version;
        self.version_type = version_type;
        self
    }

    /// Set the origin.
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }
}

/// A delete operation.
#[derive(Debug, Clone)]
pub struct Delete {
    /// The uid term for the document.
    pub uid: Term,
    /// Expected/assigned version, depending on the version type.
    pub version: i64,
    /// How `version` is interpreted.
    pub version_type: VersionType,
    /// Where the op originated.
    pub origin: Origin,
    /// Monotonic start time of the op, in nanoseconds.
    pub start_time_nanos: i64,
}

impl Delete {
    /// Create a delete op as a primary with engine-assigned versioning.
    pub fn primary(uid: Term, start_time_nanos: i64) -> Self {
        Delete {
            uid,
            version: MATCH_ANY,
            version_type: VersionType::Internal,
            origin: Origin::Primary,
            start_time_nanos,
        }
    }

    /// Set an explicit version and version type.
    pub fn with_version(mut self, version: i64, version_type: VersionType) -> Self {
        self.version = version;
        self.version_type = version_type;
        self
    }

    /// Set the origin.
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }
}

/// A single-document read.
#[derive(Debug, Clone)]
pub struct Get {
    /// The uid term for the document.
    pub uid: Term,
    /// Whether uncommitted writes must be visible to this read.
    pub realtime: bool,
    /// Expected version, or [`MATCH_ANY`].
    pub version: i64,
    /// How `version` is interpreted.
    pub version_type: VersionType,
}

impl Get {
    /// Create a realtime get with no version expectation.
    pub fn new(uid: Term) -> Self {
        Get {
            uid,
            realtime: true,
            version: MATCH_ANY,
            version_type: VersionType::Internal,
        }
    }

    /// Set whether the read is realtime.
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Set an expected version.
    pub fn with_version(mut self, version: i64, version_type: VersionType) -> Self {
        self.version = version;
        self.version_type = version_type;
        self
    }
}

/// Result of an [`Index`] operation.
///
/// Results are frozen before they are returned: `took_nanos` is final and
/// no field changes afterwards.
#[derive(Debug)]
pub struct IndexResult {
    version: i64,
    created: bool,
    failure: Option<TsurugiError>,
    translog_location: Option<Location>,
    took_nanos: i64,
    frozen: bool,
}

impl IndexResult {
    pub(crate) fn new(version: i64, created: bool) -> Self {
        IndexResult {
            version,
            created,
            failure: None,
            translog_location: None,
            took_nanos: 0,
            frozen: false,
        }
    }

    pub(crate) fn from_failure(failure: TsurugiError, version: i64) -> Self {
        IndexResult {
            version,
            created: false,
            failure: Some(failure),
            translog_location: None,
            took_nanos: 0,
            frozen: false,
        }
    }

    pub(crate) fn set_translog_location(&mut self, location: Location) {
        debug_assert!(!self.frozen, "result is frozen");
        self.translog_location = Some(location);
    }

    pub(crate) fn freeze(&mut self, took_nanos: i64) {
        debug_assert!(!self.frozen, "result is already frozen");
        self.took_nanos = took_nanos;
        self.frozen = true;
    }

    /// The version the document was indexed under.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Whether the op created the document rather than updating it.
    pub fn created(&self) -> bool {
        self.created
    }

    /// The captured failure, if the op did not succeed.
    pub fn failure(&self) -> Option<&TsurugiError> {
        self.failure.as_ref()
    }

    /// True when a failure was captured.
    pub fn has_failure(&self) -> bool {
        self.failure.is_some()
    }

    /// Translog location of the appended record, when one was written.
    pub fn translog_location(&self) -> Option<Location> {
        self.translog_location
    }

    /// Wall time the op took, in nanoseconds.
    pub fn took_nanos(&self) -> i64 {
        self.took_nanos
    }
}

/// Result of a [`Delete`] operation.
#[derive(Debug)]
pub struct DeleteResult {
    version: i64,
    found: bool,
    failure: Option<TsurugiError>,
    translog_location: Option<Location>,
    took_nanos: i64,
    frozen: bool,
}

impl DeleteResult {
    pub(crate) fn new(version: i64, found: bool) -> Self {
        DeleteResult {
            version,
            found,
            failure: None,
            translog_location: None,
            took_nanos: 0,
            frozen: false,
        }
    }

    pub(crate) fn from_failure(failure: TsurugiError, version: i64, found: bool) -> Self {
        DeleteResult {
            version,
            found,
            failure: Some(failure),
            translog_location: None,
            took_nanos: 0,
            frozen: false,
        }
    }

    pub(crate) fn set_translog_location(&mut self, location: Location) {
        debug_assert!(!self.frozen, "result is frozen");
        self.translog_location = Some(location);
    }

    pub(crate) fn freeze(&mut self, took_nanos: i64) {
        debug_assert!(!self.frozen, "result is already frozen");
        self.took_nanos = took_nanos;
        self.frozen = true;
    }

    /// The version of the deletion.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Whether a live document was found and deleted.
    pub fn found(&self) -> bool {
        self.found
    }

    /// The captured failure, if the op did not succeed.
    pub fn failure(&self) -> Option<&TsurugiError> {
        self.failure.as_ref()
    }

    /// True when a failure was captured.
    pub fn has_failure(&self) -> bool {
        self.failure.is_some()
    }

    /// Translog location of the appended record, when one was written.
    pub fn translog_location(&self) -> Option<Location> {
        self.translog_location
    }

    /// Wall time the op took, in nanoseconds.
    pub fn took_nanos(&self) -> i64 {
        self.took_nanos
    }
}

/// Result of a [`Get`] operation.
#[derive(Debug, Clone)]
pub struct GetResult {
    /// Whether a live document exists under the uid.
    pub exists: bool,
    /// The current version, or [`crate::engine::version::NOT_FOUND`].
    pub version: i64,
    /// The root source document, when it exists.
    pub source: Option<Value>,
}

impl GetResult {
    /// The canonical not-found result.
    pub fn not_exists() -> Self {
        GetResult {
            exists: false,
            version: crate::engine::version::NOT_FOUND,
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_bytes_are_prefix_free() {
        let a = Term::new("_uid", "doc:1");
        let b = Term::new("_uid", "doc:12");
        assert_ne!(a.bytes(), b.bytes());
        assert_eq!(a.bytes(), Term::new("_uid", "doc:1").bytes());
    }

    #[test]
    fn test_index_result_freeze_finalizes_took() {
        let mut result = IndexResult::new(1, true);
        result.freeze(42);
        assert_eq!(result.took_nanos(), 42);
        assert!(!result.has_failure());
    }
}
