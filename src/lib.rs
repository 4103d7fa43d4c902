//! histree: disk-backed history tree for time-stamped state intervals
//!
//! This crate indexes a large, append-only stream of intervals so that the
//! node(s) covering any timestamp can be reached in logarithmic time while
//! only the rightmost root-to-leaf path (the "latest branch") stays in memory.
//! Every other node lives in a fixed-size block of the tree file and is read
//! back by its sequence number.

#![warn(missing_docs)]

/// Interval contract and the interval types shipped with the crate
pub mod interval;

/// Node model and block-oriented persistence
pub mod storage;

/// History tree orchestration
pub mod tree;

/// Stress and property tests spanning the whole tree
#[cfg(test)]
mod tree_stress_tests;

// Re-exports
pub use config::HistoryTreeConfig;
pub use error::{Error, ErrorKind, Result};
pub use interval::{HtInterval, StateInterval, StateValue, TimeRange, Timestamp};
pub use storage::{BlockStore, ChildLink, Node, NodeKind, NodeType, TreeHeader};
pub use tree::{HistoryTree, TreeStats};

/// Error types for history tree operations
pub mod error {
    use std::io;

    use thiserror::Error;

    use crate::interval::Timestamp;

    /// Result alias used throughout the crate
    pub type Result<T> = std::result::Result<T, Error>;

    /// Broad classes of failure, so callers can decide between rebuilding,
    /// retrying or aborting without matching every variant
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ErrorKind {
        /// A node was asked to hold more than it can, or to mutate after closing
        Capacity,
        /// Times arrived or were requested out of order
        Ordering,
        /// The backing file could not be read or written
        Io,
        /// A sequence number beyond the known node count
        NotFound,
        /// The file was built by an incompatible writer
        Version,
        /// The file content does not describe a valid tree
        Corrupted,
        /// The tree is closed and read-only
        State,
        /// The configuration is unusable
        Config,
    }

    /// Error types that can occur in history tree operations
    #[derive(Debug, Error)]
    pub enum Error {
        /// An I/O error occurred
        #[error("I/O error: {0}")]
        Io(#[from] io::Error),

        /// The interval does not fit in the node's remaining space
        #[error("node {seq} is full: {needed} bytes needed, {free} free")]
        NodeFull {
            /// Sequence number of the node
            seq: u32,
            /// Serialized size of the rejected interval
            needed: usize,
            /// Free space left in the node
            free: usize,
        },

        /// The node has already been closed
        #[error("node {seq} is closed")]
        NodeClosed {
            /// Sequence number of the node
            seq: u32,
        },

        /// Child operations were requested on a leaf
        #[error("node {seq} is a leaf and cannot hold children")]
        NotABranch {
            /// Sequence number of the node
            seq: u32,
        },

        /// The branch node already references `max` children
        #[error("node {seq} already has the maximum of {max} children")]
        ChildrenFull {
            /// Sequence number of the node
            seq: u32,
            /// Configured maximum number of children
            max: usize,
        },

        /// The interval is larger than an empty leaf
        #[error("interval of {size} bytes can never fit in a block with {capacity} usable bytes")]
        IntervalTooLarge {
            /// Serialized size of the interval
            size: usize,
            /// Usable bytes of an empty leaf
            capacity: usize,
        },

        /// The interval wrote a different number of bytes than it declared
        #[error("interval declared {declared} bytes but wrote {written}")]
        IntervalSizeMismatch {
            /// Size reported by `size_on_disk`
            declared: usize,
            /// Bytes actually produced by `write_to`
            written: usize,
        },

        /// Only closed nodes can be persisted
        #[error("node {seq} is still open and cannot be written")]
        NodeNotClosed {
            /// Sequence number of the node
            seq: u32,
        },

        /// The node already links back to a parent
        #[error("node {seq} already has parent {parent}")]
        ParentAlreadySet {
            /// Sequence number of the node
            seq: u32,
            /// Existing parent sequence number
            parent: i32,
        },

        /// Sequence numbers must stay addressable as parent references
        #[error("sequence number {seq} exceeds the maximum of {max}")]
        SequenceExhausted {
            /// Sequence number that was requested
            seq: u32,
            /// Largest usable sequence number
            max: u32,
        },

        /// The branch does not reference the given child
        #[error("node {parent} has no child {child}")]
        UnknownChild {
            /// Sequence number of the branch
            parent: u32,
            /// Sequence number that was looked up
            child: u32,
        },

        /// An interval with its start after its end
        #[error("interval start {start} is after its end {end}")]
        InvalidInterval {
            /// Interval start
            start: Timestamp,
            /// Interval end
            end: Timestamp,
        },

        /// The interval starts before the tree does
        #[error("interval start {start} precedes tree start {tree_start}")]
        IntervalBeforeTreeStart {
            /// Interval start
            start: Timestamp,
            /// Tree start
            tree_start: Timestamp,
        },

        /// An interval or child starts before the node that should hold it
        #[error("time {start} precedes the start {node_start} of node {seq}")]
        BeforeNodeStart {
            /// Sequence number of the node
            seq: u32,
            /// Offending start time
            start: Timestamp,
            /// Start of the node
            node_start: Timestamp,
        },

        /// A node was closed before the end of something it contains
        #[error("cannot close node {seq} at {end}: content reaches {required}")]
        CloseBeforeContent {
            /// Sequence number of the node
            seq: u32,
            /// Requested end time
            end: Timestamp,
            /// Minimum acceptable end time
            required: Timestamp,
        },

        /// The tree has been closed and accepts no more mutation
        #[error("history tree is closed")]
        TreeClosed,

        /// No node with this sequence number exists
        #[error("node {seq} not found (tree has {count} nodes)")]
        NodeNotFound {
            /// Requested sequence number
            seq: u32,
            /// Number of nodes in the tree
            count: u32,
        },

        /// The file was built with a different provider version
        #[error("provider version mismatch: expected {expected}, file has {found}")]
        VersionMismatch {
            /// Version the caller expects
            expected: u32,
            /// Version recorded in the file
            found: u32,
        },

        /// The file uses another revision of the on-disk format
        #[error("file format version mismatch: expected {expected}, file has {found}")]
        FormatVersion {
            /// Format revision understood by this crate
            expected: u32,
            /// Format revision recorded in the file
            found: u32,
        },

        /// The file content is not a valid tree
        #[error("corrupted history file: {0}")]
        Corrupted(String),

        /// Configuration error
        #[error("configuration error: {0}")]
        Config(String),
    }

    impl Error {
        /// Classify this error
        pub fn kind(&self) -> ErrorKind {
            match self {
                Error::Io(_) => ErrorKind::Io,
                Error::NodeFull { .. }
                | Error::NodeClosed { .. }
                | Error::NotABranch { .. }
                | Error::ChildrenFull { .. }
                | Error::IntervalTooLarge { .. }
                | Error::IntervalSizeMismatch { .. }
                | Error::NodeNotClosed { .. }
                | Error::ParentAlreadySet { .. }
                | Error::SequenceExhausted { .. }
                | Error::UnknownChild { .. } => ErrorKind::Capacity,
                Error::InvalidInterval { .. }
                | Error::IntervalBeforeTreeStart { .. }
                | Error::BeforeNodeStart { .. }
                | Error::CloseBeforeContent { .. } => ErrorKind::Ordering,
                Error::TreeClosed => ErrorKind::State,
                Error::NodeNotFound { .. } => ErrorKind::NotFound,
                Error::VersionMismatch { .. } | Error::FormatVersion { .. } => ErrorKind::Version,
                Error::Corrupted(_) => ErrorKind::Corrupted,
                Error::Config(_) => ErrorKind::Config,
            }
        }
    }
}

/// Configuration options for a history tree
pub mod config {
    use std::path::PathBuf;

    #[cfg(feature = "serialization")]
    use serde::{Deserialize, Serialize};

    use crate::error::{Error, Result};
    use crate::interval::Timestamp;
    use crate::storage::node::{branch_header_size, COMMON_HEADER_SIZE};

    /// Default block size (64KB)
    pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

    /// Default maximum number of children per branch node
    pub const DEFAULT_MAX_CHILDREN: usize = 50;

    /// Default number of slots in the closed-node cache
    pub const DEFAULT_CACHE_SLOTS: usize = 256;

    /// Configuration for a history tree
    #[derive(Debug, Clone, PartialEq)]
    #[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
    pub struct HistoryTreeConfig {
        /// Path to the tree file
        pub path: PathBuf,
        /// Size of every node block in bytes
        pub block_size: usize,
        /// Maximum number of children per branch node
        pub max_children: usize,
        /// Caller-supplied version tag, checked when the file is reopened
        pub provider_version: u32,
        /// Earliest timestamp the tree accepts
        pub tree_start: Timestamp,
        /// Number of slots in the closed-node cache (power of two)
        pub cache_slots: usize,
    }

    impl Default for HistoryTreeConfig {
        fn default() -> Self {
            Self {
                path: PathBuf::from("./history.ht"),
                block_size: DEFAULT_BLOCK_SIZE,
                max_children: DEFAULT_MAX_CHILDREN,
                provider_version: 0,
                tree_start: 0,
                cache_slots: DEFAULT_CACHE_SLOTS,
            }
        }
    }

    impl HistoryTreeConfig {
        /// Create config with custom file path
        pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
            Self {
                path: path.into(),
                ..Self::default()
            }
        }

        /// Set block size
        pub fn with_block_size(mut self, block_size: usize) -> Self {
            self.block_size = block_size;
            self
        }

        /// Set the maximum number of children per branch node
        pub fn with_max_children(mut self, max_children: usize) -> Self {
            self.max_children = max_children;
            self
        }

        /// Set the provider version tag
        pub fn with_provider_version(mut self, version: u32) -> Self {
            self.provider_version = version;
            self
        }

        /// Set the tree start time
        pub fn with_tree_start(mut self, start: Timestamp) -> Self {
            self.tree_start = start;
            self
        }

        /// Set the number of cache slots
        pub fn with_cache_slots(mut self, slots: usize) -> Self {
            self.cache_slots = slots;
            self
        }

        /// Bytes available to intervals in an empty leaf
        pub fn leaf_capacity(&self) -> usize {
            self.block_size.saturating_sub(COMMON_HEADER_SIZE)
        }

        /// Check that the configuration describes a usable tree
        pub fn validate(&self) -> Result<()> {
            if self.max_children < 2 {
                return Err(Error::Config(format!(
                    "max_children must be at least 2, got {}",
                    self.max_children
                )));
            }
            if self.max_children > u32::MAX as usize {
                return Err(Error::Config(format!(
                    "max_children {} does not fit the file header",
                    self.max_children
                )));
            }
            let header = branch_header_size(self.max_children);
            if self.block_size <= header {
                return Err(Error::Config(format!(
                    "block_size {} leaves no room after a {}-byte branch header",
                    self.block_size, header
                )));
            }
            if self.block_size > u32::MAX as usize {
                return Err(Error::Config(format!(
                    "block_size {} does not fit the file header",
                    self.block_size
                )));
            }
            if self.cache_slots == 0 || !self.cache_slots.is_power_of_two() {
                return Err(Error::Config(format!(
                    "cache_slots must be a non-zero power of two, got {}",
                    self.cache_slots
                )));
            }
            Ok(())
        }
    }
}
