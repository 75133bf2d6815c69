//! The segmented document store the engine writes against.
//!
//! Mirrors the contract of an immutable-segment inverted index: a buffered
//! [`writer::SegmentWriter`], commit-level metadata in [`infos::SegmentInfos`],
//! refreshable point-in-time readers from [`searcher::SearcherManager`], and a
//! reference-counted [`store::Store`] owning the directory.

pub mod infos;
pub mod searcher;
pub mod store;
pub mod writer;

pub use infos::{CommitId, SegmentInfos, SegmentMeta};
pub use searcher::{RefreshListener, Searcher, SearcherManager};
pub use store::Store;
pub use writer::{
    IndexCommit, MergeListener, MergePolicy, OnGoingMerge, Segment, SegmentAction, SegmentWriter,
    SEGMENT_FORMAT_CURRENT,
};
