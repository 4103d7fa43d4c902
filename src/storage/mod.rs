//! Storage layer for history trees
//!
//! Nodes are encoded into fixed-size blocks and kept in a single file after
//! a small header, so a node's position on disk follows from its sequence
//! number alone.

/// Node model and block encoding
pub mod node;
/// Tree file and block store
pub mod file;

// Re-export key types and functions
pub use node::{
    branch_header_size,
    parent_ref,
    ChildLink,
    Node,
    NodeHeader,
    NodeKind,
    NodeType,
    CHILD_LINK_SIZE,
    COMMON_HEADER_SIZE,
    MAX_SEQUENCE_NUMBER,
    NO_PARENT,
    OPEN_END,
};

pub use file::{
    BlockStore,
    TreeHeader,
    FILE_FORMAT_VERSION,
    HISTORY_FILE_MAGIC,
    TREE_HEADER_SIZE,
};
