//! History tree nodes and their block encoding
//!
//! A node is a fixed-size block holding intervals (leaf) or intervals plus
//! links to its children (branch). Every block starts with a common header:
//!
//! ```text
//! seq (u32) | parent (i32) | type (u8) | start (i64) | end (i64) | interval count (u32)
//! ```
//!
//! Branch nodes follow it with a child count (u32) and a child table sized for
//! `max_children` entries of `seq (u32) | start (i64) | end (i64)`, so the
//! header size of a branch does not change as children are linked. Intervals
//! are packed after the headers; the rest of the block is zero padding.

use std::fmt;

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::interval::{HtInterval, Timestamp};

/// End time reported by nodes that have not been closed yet
pub const OPEN_END: Timestamp = Timestamp::MAX;

/// Parent sequence number of the root node
pub const NO_PARENT: i32 = -1;

/// Largest sequence number, bounded by the signed parent field
pub const MAX_SEQUENCE_NUMBER: u32 = i32::MAX as u32;

/// Parent field value referring to node `seq`
pub fn parent_ref(seq: u32) -> Result<i32> {
    i32::try_from(seq).map_err(|_| Error::SequenceExhausted {
        seq,
        max: MAX_SEQUENCE_NUMBER,
    })
}

/// Size of the header shared by all node types
pub const COMMON_HEADER_SIZE: usize = 4 + 4 + 1 + 8 + 8 + 4;

/// Size of one entry in a branch node's child table
pub const CHILD_LINK_SIZE: usize = 4 + 8 + 8;

/// Total header size of a branch node holding up to `max_children` links
pub const fn branch_header_size(max_children: usize) -> usize {
    COMMON_HEADER_SIZE + 4 + CHILD_LINK_SIZE * max_children
}

/// Node type determines the block layout after the common header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeType {
    /// Holds intervals only
    Leaf = 1,
    /// Holds child links and, possibly, intervals
    Branch = 2,
}

impl TryFrom<u8> for NodeType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(NodeType::Leaf),
            2 => Ok(NodeType::Branch),
            other => Err(Error::Corrupted(format!("unknown node type tag {}", other))),
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Leaf => write!(f, "Leaf"),
            NodeType::Branch => write!(f, "Branch"),
        }
    }
}

/// Fixed-layout header found at the start of every block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    /// Sequence number of the node
    pub seq: u32,
    /// Sequence number of the parent, or [`NO_PARENT`]
    pub parent: i32,
    /// Leaf or branch
    pub node_type: NodeType,
    /// Node start time
    pub start: Timestamp,
    /// Node end time
    pub end: Timestamp,
    /// Number of intervals stored after the headers
    pub interval_count: u32,
}

impl NodeHeader {
    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; COMMON_HEADER_SIZE] {
        let mut bytes = [0u8; COMMON_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.seq.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.parent.to_le_bytes());
        bytes[8] = self.node_type as u8;
        bytes[9..17].copy_from_slice(&self.start.to_le_bytes());
        bytes[17..25].copy_from_slice(&self.end.to_le_bytes());
        bytes[25..29].copy_from_slice(&self.interval_count.to_le_bytes());
        bytes
    }

    /// Deserialize header from the first bytes of a block
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < COMMON_HEADER_SIZE {
            return Err(Error::Corrupted(format!(
                "block of {} bytes is shorter than a node header",
                bytes.len()
            )));
        }
        Ok(Self {
            seq: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            parent: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            node_type: NodeType::try_from(bytes[8])?,
            start: i64::from_le_bytes([
                bytes[9], bytes[10], bytes[11], bytes[12],
                bytes[13], bytes[14], bytes[15], bytes[16],
            ]),
            end: i64::from_le_bytes([
                bytes[17], bytes[18], bytes[19], bytes[20],
                bytes[21], bytes[22], bytes[23], bytes[24],
            ]),
            interval_count: u32::from_le_bytes([bytes[25], bytes[26], bytes[27], bytes[28]]),
        })
    }
}

/// A branch node's view of one child: its handle and cached time bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildLink {
    /// Sequence number of the child
    pub seq: u32,
    /// Start of the child
    pub start: Timestamp,
    /// End of the child, [`OPEN_END`] while it is still being filled
    pub end: Timestamp,
}

impl ChildLink {
    /// Whether the child has been closed
    pub fn is_closed(&self) -> bool {
        self.end != OPEN_END
    }

    /// Whether `t` falls inside the cached bounds
    pub fn contains(&self, t: Timestamp) -> bool {
        self.start <= t && t <= self.end
    }

    fn to_bytes(&self) -> [u8; CHILD_LINK_SIZE] {
        let mut bytes = [0u8; CHILD_LINK_SIZE];
        bytes[0..4].copy_from_slice(&self.seq.to_le_bytes());
        bytes[4..12].copy_from_slice(&self.start.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.end.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            seq: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            start: i64::from_le_bytes([
                bytes[4], bytes[5], bytes[6], bytes[7],
                bytes[8], bytes[9], bytes[10], bytes[11],
            ]),
            end: i64::from_le_bytes([
                bytes[12], bytes[13], bytes[14], bytes[15],
                bytes[16], bytes[17], bytes[18], bytes[19],
            ]),
        }
    }
}

/// Child links live inline for the usual small fan-outs
pub type ChildLinks = SmallVec<[ChildLink; 8]>;

/// Type-specific part of a node
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Leaf node
    Leaf,
    /// Branch node with its children, oldest first
    Branch {
        /// Links to the children
        children: ChildLinks,
    },
}

impl NodeKind {
    /// Tag written in the block header
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Leaf => NodeType::Leaf,
            NodeKind::Branch { .. } => NodeType::Branch,
        }
    }
}

/// A node of the history tree
#[derive(Debug, Clone, PartialEq)]
pub struct Node<E> {
    seq: u32,
    parent: i32,
    start: Timestamp,
    end: Timestamp,
    closed: bool,
    kind: NodeKind,
    intervals: Vec<E>,
    /// Sum of `size_on_disk` over `intervals`
    content_size: usize,
    block_size: usize,
    max_children: usize,
}

impl<E: HtInterval> Node<E> {
    /// Create a new, open node
    pub fn new(
        node_type: NodeType,
        block_size: usize,
        max_children: usize,
        seq: u32,
        parent: i32,
        start: Timestamp,
    ) -> Self {
        let kind = match node_type {
            NodeType::Leaf => NodeKind::Leaf,
            NodeType::Branch => NodeKind::Branch {
                children: SmallVec::new(),
            },
        };
        Self {
            seq,
            parent,
            start,
            end: OPEN_END,
            closed: false,
            kind,
            intervals: Vec::new(),
            content_size: 0,
            block_size,
            max_children,
        }
    }

    /// Create a new, open leaf node
    pub fn new_leaf(block_size: usize, max_children: usize, seq: u32, parent: i32, start: Timestamp) -> Self {
        Self::new(NodeType::Leaf, block_size, max_children, seq, parent, start)
    }

    /// Create a new, open branch node
    pub fn new_branch(block_size: usize, max_children: usize, seq: u32, parent: i32, start: Timestamp) -> Self {
        Self::new(NodeType::Branch, block_size, max_children, seq, parent, start)
    }

    /// Sequence number
    pub fn sequence_number(&self) -> u32 {
        self.seq
    }

    /// Parent sequence number, [`NO_PARENT`] for the root
    pub fn parent_sequence_number(&self) -> i32 {
        self.parent
    }

    /// Leaf or branch
    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    /// Type-specific payload
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Start time
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// End time, or [`OPEN_END`] while the node is open
    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Whether the node has been closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the node has no parent
    pub fn is_root(&self) -> bool {
        self.parent == NO_PARENT
    }

    /// Block size
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Child table capacity
    pub fn max_children(&self) -> usize {
        self.max_children
    }

    /// Intervals in insertion order
    pub fn intervals(&self) -> &[E] {
        &self.intervals
    }

    /// Whether the node holds no intervals
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Child links in creation order; empty for leaves
    pub fn children(&self) -> &[ChildLink] {
        match &self.kind {
            NodeKind::Leaf => &[],
            NodeKind::Branch { children } => children,
        }
    }

    /// Number of linked children
    pub fn child_count(&self) -> usize {
        self.children().len()
    }

    /// Sequence number of the most recently linked child
    pub fn latest_child(&self) -> Option<u32> {
        self.children().last().map(|link| link.seq)
    }

    /// Header size for this node's type
    pub fn header_size(&self) -> usize {
        match self.kind {
            NodeKind::Leaf => COMMON_HEADER_SIZE,
            NodeKind::Branch { .. } => branch_header_size(self.max_children),
        }
    }

    /// Bytes still available for intervals
    pub fn free_space(&self) -> usize {
        self.block_size
            .saturating_sub(self.header_size())
            .saturating_sub(self.content_size)
    }

    /// Share of the usable space taken by intervals, as a percentage
    pub fn usage_percent(&self) -> u64 {
        let usable = self.block_size.saturating_sub(self.header_size());
        if usable == 0 {
            return 100;
        }
        (self.content_size as u64 * 100) / usable as u64
    }

    /// Largest end time among the stored intervals
    pub fn max_interval_end(&self) -> Option<Timestamp> {
        self.intervals.iter().map(|i| i.end()).max()
    }

    /// Append an interval; it must fit and must not start before the node
    pub fn add(&mut self, interval: E) -> Result<()> {
        if self.closed {
            return Err(Error::NodeClosed { seq: self.seq });
        }
        let size = interval.size_on_disk();
        let free = self.free_space();
        if size > free {
            return Err(Error::NodeFull {
                seq: self.seq,
                needed: size,
                free,
            });
        }
        if interval.start() < self.start {
            return Err(Error::BeforeNodeStart {
                seq: self.seq,
                start: interval.start(),
                node_start: self.start,
            });
        }
        self.intervals.push(interval);
        self.content_size += size;
        Ok(())
    }

    /// Record this node's parent. Only nodes created without one (roots) may
    /// be given a parent, and only once.
    pub fn set_parent(&mut self, parent: u32) -> Result<()> {
        if self.parent != NO_PARENT {
            return Err(Error::ParentAlreadySet {
                seq: self.seq,
                parent: self.parent,
            });
        }
        if self.closed {
            return Err(Error::NodeClosed { seq: self.seq });
        }
        self.parent = parent_ref(parent)?;
        Ok(())
    }

    /// Link `child` as the newest child of this branch, caching its bounds
    pub fn link_new_child(&mut self, child: &Node<E>) -> Result<()> {
        let seq = self.seq;
        let start = self.start;
        let max_children = self.max_children;
        if self.closed {
            return Err(Error::NodeClosed { seq });
        }
        let NodeKind::Branch { children } = &mut self.kind else {
            return Err(Error::NotABranch { seq });
        };
        if children.len() >= max_children {
            return Err(Error::ChildrenFull {
                seq,
                max: max_children,
            });
        }
        if child.start < start {
            return Err(Error::BeforeNodeStart {
                seq,
                start: child.start,
                node_start: start,
            });
        }
        children.push(ChildLink {
            seq: child.seq,
            start: child.start,
            end: child.end,
        });
        Ok(())
    }

    /// Refresh the cached end time of a child that has just been closed
    pub fn close_child(&mut self, child: &Node<E>) -> Result<()> {
        let seq = self.seq;
        let NodeKind::Branch { children } = &mut self.kind else {
            return Err(Error::NotABranch { seq });
        };
        let link = children
            .iter_mut()
            .rev()
            .find(|link| link.seq == child.seq)
            .ok_or(Error::UnknownChild {
                parent: seq,
                child: child.seq,
            })?;
        link.end = child.end;
        Ok(())
    }

    /// Check that the node could be closed at `end` without changing it
    pub fn check_close(&self, end: Timestamp) -> Result<()> {
        if self.closed {
            return Err(Error::NodeClosed { seq: self.seq });
        }
        let mut required = self.start;
        if let Some(max_end) = self.max_interval_end() {
            required = required.max(max_end);
        }
        if let Some(last) = self.children().iter().filter(|c| c.is_closed()).map(|c| c.end).max() {
            required = required.max(last);
        }
        if end < required {
            return Err(Error::CloseBeforeContent {
                seq: self.seq,
                end,
                required,
            });
        }
        Ok(())
    }

    /// Fix the node's end time; no mutation is accepted afterwards
    pub fn close(&mut self, end: Timestamp) -> Result<()> {
        self.check_close(end)?;
        self.end = end;
        self.closed = true;
        Ok(())
    }

    /// Children whose cached range contains `t`
    pub fn select_next_children(&self, t: Timestamp) -> Vec<u32> {
        self.children()
            .iter()
            .filter(|link| link.contains(t))
            .map(|link| link.seq)
            .collect()
    }

    fn header(&self) -> NodeHeader {
        NodeHeader {
            seq: self.seq,
            parent: self.parent,
            node_type: self.node_type(),
            start: self.start,
            end: self.end,
            interval_count: self.intervals.len() as u32,
        }
    }

    /// Encode the node into exactly one block of `block_size` bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.block_size);
        buf.extend_from_slice(&self.header().to_bytes());

        if let NodeKind::Branch { children } = &self.kind {
            buf.extend_from_slice(&(children.len() as u32).to_le_bytes());
            for link in children.iter() {
                buf.extend_from_slice(&link.to_bytes());
            }
            let unused = (self.max_children - children.len()) * CHILD_LINK_SIZE;
            buf.resize(buf.len() + unused, 0);
        }

        for interval in &self.intervals {
            let before = buf.len();
            interval.write_to(&mut buf)?;
            let written = buf.len() - before;
            if written != interval.size_on_disk() {
                return Err(Error::IntervalSizeMismatch {
                    declared: interval.size_on_disk(),
                    written,
                });
            }
        }

        let expected = self.header_size() + self.content_size;
        if buf.len() != expected || buf.len() > self.block_size {
            return Err(Error::Corrupted(format!(
                "node {} encoded to {} bytes, expected {} within a {}-byte block",
                self.seq,
                buf.len(),
                expected,
                self.block_size
            )));
        }

        buf.resize(self.block_size, 0);
        Ok(buf)
    }

    /// Decode a node from one block. Nodes read back from a block are closed.
    pub fn deserialize(bytes: &[u8], block_size: usize, max_children: usize) -> Result<Self> {
        if bytes.len() != block_size {
            return Err(Error::Corrupted(format!(
                "expected a {}-byte block, got {} bytes",
                block_size,
                bytes.len()
            )));
        }
        let header = NodeHeader::from_bytes(bytes)?;
        let mut node = Self::new(
            header.node_type,
            block_size,
            max_children,
            header.seq,
            header.parent,
            header.start,
        );

        let mut offset = COMMON_HEADER_SIZE;
        if let NodeKind::Branch { children } = &mut node.kind {
            if bytes.len() < branch_header_size(max_children) {
                return Err(Error::Corrupted(format!(
                    "block of node {} too small for its child table",
                    header.seq
                )));
            }
            let count = u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ]) as usize;
            offset += 4;
            if count > max_children {
                return Err(Error::Corrupted(format!(
                    "node {} claims {} children, maximum is {}",
                    header.seq, count, max_children
                )));
            }
            for i in 0..count {
                let at = offset + i * CHILD_LINK_SIZE;
                children.push(ChildLink::from_bytes(&bytes[at..at + CHILD_LINK_SIZE]));
            }
            offset += max_children * CHILD_LINK_SIZE;
        }

        let mut cursor = &bytes[offset..];
        for _ in 0..header.interval_count {
            let interval = E::read_from(&mut cursor).map_err(|e| {
                Error::Corrupted(format!("bad interval in node {}: {}", header.seq, e))
            })?;
            node.content_size += interval.size_on_disk();
            node.intervals.push(interval);
        }
        if node.header_size() + node.content_size > block_size {
            return Err(Error::Corrupted(format!(
                "intervals of node {} overflow the block",
                header.seq
            )));
        }

        node.end = header.end;
        node.closed = true;
        Ok(node)
    }
}

impl<E: HtInterval> fmt::Display for Node<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node #{}, ", self.seq)?;
        if self.is_root() {
            write!(f, "Root, ")?;
        } else {
            write!(f, "Parent #{}, ", self.parent)?;
        }
        match &self.kind {
            NodeKind::Leaf => write!(f, "Leaf, ")?,
            NodeKind::Branch { children } => {
                let seqs: Vec<u32> = children.iter().map(|c| c.seq).collect();
                write!(f, "Branch, {} children {:?}, ", children.len(), seqs)?;
            }
        }
        write!(
            f,
            "{} intervals ({}% used), [{} - ",
            self.intervals.len(),
            self.usage_percent(),
            self.start
        )?;
        if self.closed {
            write!(f, "{}]", self.end)
        } else {
            write!(f, "...]")
        }
    }
}
