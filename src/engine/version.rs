//! Document version semantics.
//!
//! Version numbers are positive `i64` values; the sentinels below mark the
//! "no version" cases. [`VersionType`] decides when an incoming operation
//! conflicts with the current document version and how the new version is
//! derived.

use serde::{Deserialize, Serialize};

/// Sentinel: accept whatever the current version is.
pub const MATCH_ANY: i64 = -3;

/// Sentinel: no document with this uid currently exists.
pub const NOT_FOUND: i64 = -1;

/// How an operation's version is checked against the current document version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionType {
    /// Versions are assigned by the engine; explicit versions act as
    /// compare-and-set against the current version.
    Internal,
    /// Versions are assigned by the caller and must strictly increase.
    External,
    /// Like `External`, but an equal version is accepted.
    ExternalGte,
    /// The operation's version is applied unconditionally.
    Force,
}

impl VersionType {
    /// Decide whether a write conflicts with the current version.
    ///
    /// `current_not_found_or_deleted` is true when no live document exists
    /// under the uid (absent, or resolved to a tombstone).
    pub fn is_version_conflict_for_writes(
        &self,
        current_version: i64,
        expected_version: i64,
        current_not_found_or_deleted: bool,
    ) -> bool {
        match self {
            VersionType::Internal => {
                if expected_version == MATCH_ANY {
                    false
                } else if current_not_found_or_deleted {
                    true
                } else {
                    current_version != expected_version
                }
            }
            // External comparisons run against the current version even when it
            // is a tombstone; only a truly absent doc accepts any version.
            VersionType::External => {
                if current_version == NOT_FOUND {
                    false
                } else if expected_version == MATCH_ANY {
                    true
                } else {
                    current_version >= expected_version
                }
            }
            VersionType::ExternalGte => {
                if current_version == NOT_FOUND {
                    false
                } else if expected_version == MATCH_ANY {
                    true
                } else {
                    current_version > expected_version
                }
            }
            VersionType::Force => {
                debug_assert!(
                    expected_version != MATCH_ANY,
                    "force versioning requires an explicit version"
                );
                false
            }
        }
    }

    /// Decide whether a read conflicts with the current version.
    pub fn is_version_conflict_for_reads(&self, current_version: i64, expected_version: i64) -> bool {
        match self {
            VersionType::Internal | VersionType::External | VersionType::ExternalGte => {
                if expected_version == MATCH_ANY {
                    false
                } else if current_version == NOT_FOUND {
                    true
                } else {
                    current_version != expected_version
                }
            }
            VersionType::Force => {
                debug_assert!(false, "force versioning is not usable for reads");
                false
            }
        }
    }

    /// Derive the version a non-conflicting write will be indexed under.
    pub fn update_version(&self, current_version: i64, expected_version: i64) -> i64 {
        match self {
            VersionType::Internal => {
                if current_version == NOT_FOUND {
                    1
                } else {
                    current_version + 1
                }
            }
            VersionType::External | VersionType::ExternalGte | VersionType::Force => {
                expected_version
            }
        }
    }

    /// The version type an op carries once it is replicated or replayed.
    ///
    /// Internal versions were already resolved on the primary, so replicas
    /// and recovery apply them as exact external versions. The mapping is
    /// idempotent.
    pub fn version_type_for_replication_and_recovery(&self) -> VersionType {
        match self {
            VersionType::Internal => VersionType::External,
            other => *other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_match_any_never_conflicts() {
        let vt = VersionType::Internal;
        assert!(!vt.is_version_conflict_for_writes(NOT_FOUND, MATCH_ANY, true));
        assert!(!vt.is_version_conflict_for_writes(7, MATCH_ANY, false));
    }

    #[test]
    fn test_internal_explicit_version_is_compare_and_set() {
        let vt = VersionType::Internal;
        assert!(!vt.is_version_conflict_for_writes(3, 3, false));
        assert!(vt.is_version_conflict_for_writes(3, 2, false));
        // an explicit expectation against a missing/deleted doc conflicts
        assert!(vt.is_version_conflict_for_writes(NOT_FOUND, 1, true));
        assert!(vt.is_version_conflict_for_writes(3, 3, true));
    }

    #[test]
    fn test_internal_update_version_increments() {
        let vt = VersionType::Internal;
        assert_eq!(vt.update_version(NOT_FOUND, MATCH_ANY), 1);
        assert_eq!(vt.update_version(5, MATCH_ANY), 6);
    }

    #[test]
    fn test_external_requires_strictly_newer_version() {
        let vt = VersionType::External;
        assert!(!vt.is_version_conflict_for_writes(NOT_FOUND, 5, true));
        assert!(!vt.is_version_conflict_for_writes(2, 3, false));
        assert!(vt.is_version_conflict_for_writes(3, 3, false));
        assert!(vt.is_version_conflict_for_writes(4, 3, false));
        assert_eq!(vt.update_version(2, 9), 9);
    }

    #[test]
    fn test_external_gte_accepts_equal_version() {
        let vt = VersionType::ExternalGte;
        assert!(!vt.is_version_conflict_for_writes(3, 3, false));
        assert!(!vt.is_version_conflict_for_writes(2, 3, false));
        assert!(vt.is_version_conflict_for_writes(4, 3, false));
    }

    #[test]
    fn test_force_never_conflicts() {
        let vt = VersionType::Force;
        assert!(!vt.is_version_conflict_for_writes(9, 2, false));
        assert_eq!(vt.update_version(9, 2), 2);
    }

    #[test]
    fn test_replication_version_type_is_idempotent() {
        for vt in [
            VersionType::Internal,
            VersionType::External,
            VersionType::ExternalGte,
            VersionType::Force,
        ] {
            let once = vt.version_type_for_replication_and_recovery();
            assert_eq!(once, once.version_type_for_replication_and_recovery());
        }
        assert_eq!(
            VersionType::Internal.version_type_for_replication_and_recovery(),
            VersionType::External
        );
    }

    #[test]
    fn test_read_conflicts() {
        let vt = VersionType::Internal;
        assert!(!vt.is_version_conflict_for_reads(4, MATCH_ANY));
        assert!(!vt.is_version_conflict_for_reads(4, 4));
        assert!(vt.is_version_conflict_for_reads(4, 3));
        assert!(vt.is_version_conflict_for_reads(NOT_FOUND, 1));
    }
}
