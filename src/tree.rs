//! History tree orchestration
//!
//! The tree keeps the rightmost root-to-leaf path (the latest branch) open in
//! memory and everything to its left closed on disk. Intervals go into the
//! latest leaf, or into the deepest ancestor that started early enough to
//! hold them. When a node runs out of space the branch below its parent is
//! closed at the split time (the largest end time inserted so far) and a
//! fresh branch is grown next to it, starting at the new interval's start.
//! When no ancestor can take another child, a new root is added on top.

use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::config::{HistoryTreeConfig, DEFAULT_CACHE_SLOTS};
use crate::error::{Error, Result};
use crate::interval::{HtInterval, Timestamp};
use crate::storage::{parent_ref, BlockStore, Node, NodeType, TreeHeader, NO_PARENT, OPEN_END};

/// Snapshot of a tree's shape and storage footprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeStats {
    /// Size of every node block
    pub block_size: usize,
    /// Maximum number of children per branch node
    pub max_children: usize,
    /// Nodes created so far, open ones included
    pub node_count: u32,
    /// Length of the latest branch
    pub depth: usize,
    /// Size of the tree file in bytes
    pub file_size: u64,
    /// Sequence number of the root
    pub root_seq: u32,
    /// Sequence number of the latest leaf
    pub latest_leaf_seq: u32,
    /// Start of the tree
    pub tree_start: Timestamp,
    /// Largest end time seen, or the close time once closed
    pub tree_end: Timestamp,
    /// Whether the tree still accepts intervals
    pub closed: bool,
}

/// Disk-backed interval tree built from intervals arriving in start order
#[derive(Debug)]
pub struct HistoryTree<E> {
    config: HistoryTreeConfig,
    store: BlockStore<E>,
    /// Root first, latest leaf last
    latest_branch: Vec<Node<E>>,
    tree_end: Timestamp,
    closed: bool,
}

impl<E: HtInterval> HistoryTree<E> {
    /// Create a new tree, truncating any file at `config.path`
    pub fn create(config: HistoryTreeConfig) -> Result<Self> {
        config.validate()?;
        let store = BlockStore::create(
            &config.path,
            config.block_size,
            config.max_children,
            config.cache_slots,
        )?;

        let mut tree = Self {
            tree_end: config.tree_start,
            config,
            store,
            latest_branch: Vec::new(),
            closed: false,
        };
        let first_leaf = tree.init_node(NodeType::Leaf, NO_PARENT, tree.config.tree_start)?;
        tree.latest_branch.push(first_leaf);

        info!(
            path = %tree.config.path.display(),
            block_size = tree.config.block_size,
            max_children = tree.config.max_children,
            tree_start = tree.config.tree_start,
            "created history tree"
        );
        Ok(tree)
    }

    /// Reopen a closed tree file for reading
    ///
    /// The provider version recorded in the file must equal
    /// `expected_provider_version`. The reopened tree is closed: it serves
    /// nodes but rejects inserts.
    pub fn open<P: AsRef<Path>>(path: P, expected_provider_version: u32) -> Result<Self> {
        Self::open_with_cache(path, expected_provider_version, DEFAULT_CACHE_SLOTS)
    }

    /// Same as [`HistoryTree::open`] with a custom number of node cache slots
    pub fn open_with_cache<P: AsRef<Path>>(
        path: P,
        expected_provider_version: u32,
        cache_slots: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        if cache_slots == 0 || !cache_slots.is_power_of_two() {
            return Err(Error::Config(format!(
                "cache_slots must be a non-zero power of two, got {}",
                cache_slots
            )));
        }
        let (store, header) = BlockStore::open(path, expected_provider_version, cache_slots)?;

        let config = HistoryTreeConfig::with_path(path)
            .with_block_size(header.block_size as usize)
            .with_max_children(header.max_children as usize)
            .with_provider_version(header.provider_version)
            .with_tree_start(header.tree_start)
            .with_cache_slots(cache_slots);
        config.validate()?;

        let root = store.read_node(header.root_seq)?;
        if !root.is_root() {
            return Err(Error::Corrupted(format!(
                "node {} recorded as root has parent {}",
                root.sequence_number(),
                root.parent_sequence_number()
            )));
        }
        if root.start() != header.tree_start {
            return Err(Error::Corrupted(format!(
                "root starts at {} but the header records {}",
                root.start(),
                header.tree_start
            )));
        }

        let tree_end = root.end();
        let mut latest_branch = vec![(*root).clone()];
        while let Some(child) = latest_branch.last().and_then(|node| node.latest_child()) {
            if latest_branch.len() > header.node_count as usize {
                return Err(Error::Corrupted("cycle in the latest branch".to_string()));
            }
            let node = store.read_node(child)?;
            latest_branch.push((*node).clone());
        }

        info!(
            path = %path.display(),
            nodes = header.node_count,
            depth = latest_branch.len(),
            "opened history tree"
        );

        Ok(Self {
            config,
            store,
            latest_branch,
            tree_end,
            closed: true,
        })
    }

    /// Configuration the tree was created or reopened with
    pub fn config(&self) -> &HistoryTreeConfig {
        &self.config
    }

    /// Earliest timestamp the tree accepts
    pub fn tree_start(&self) -> Timestamp {
        self.config.tree_start
    }

    /// Largest end time inserted so far, or the close time once closed
    pub fn tree_end(&self) -> Timestamp {
        self.tree_end
    }

    /// Total number of nodes ever created
    pub fn node_count(&self) -> u32 {
        self.store.node_count()
    }

    /// Number of levels, i.e. the length of the latest branch
    pub fn depth(&self) -> usize {
        self.latest_branch.len()
    }

    /// Whether the tree has been closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Root to latest leaf
    pub fn latest_branch(&self) -> &[Node<E>] {
        &self.latest_branch
    }

    /// Root node (always in memory)
    pub fn root(&self) -> &Node<E> {
        &self.latest_branch[0]
    }

    /// Current rightmost leaf
    pub fn latest_leaf(&self) -> &Node<E> {
        &self.latest_branch[self.latest_branch.len() - 1]
    }

    /// Insert an interval. Intervals must not start before the tree does;
    /// beyond that, the latest branch decides where they land.
    pub fn insert(&mut self, interval: E) -> Result<()> {
        if self.closed {
            return Err(Error::TreeClosed);
        }
        let start = interval.start();
        let end = interval.end();
        if start > end {
            return Err(Error::InvalidInterval { start, end });
        }
        if start < self.config.tree_start {
            return Err(Error::IntervalBeforeTreeStart {
                start,
                tree_start: self.config.tree_start,
            });
        }
        let size = interval.size_on_disk();
        let capacity = self.config.leaf_capacity();
        if size > capacity {
            return Err(Error::IntervalTooLarge { size, capacity });
        }

        let mut index = self.latest_branch.len() - 1;
        loop {
            let target = &self.latest_branch[index];
            if size > target.free_space() {
                self.add_sibling(index, start)?;
                index = self.latest_branch.len() - 1;
                continue;
            }
            if start < target.start() {
                // the root starts at the tree start, so this can only fail on a broken branch
                index = index.checked_sub(1).ok_or(Error::BeforeNodeStart {
                    seq: target.sequence_number(),
                    start,
                    node_start: target.start(),
                })?;
                continue;
            }
            break;
        }

        trace!(seq = self.latest_branch[index].sequence_number(), start, end, "insert");
        self.latest_branch[index].add(interval)?;
        self.tree_end = self.tree_end.max(end);
        Ok(())
    }

    /// Grow a sibling of the node at `index` in the latest branch, plus the
    /// nodes below it, all starting at `new_start`
    fn add_sibling(&mut self, index: usize, new_start: Timestamp) -> Result<()> {
        let mut index = index;
        loop {
            if index == 0 {
                return self.add_new_root(new_start);
            }
            let parent = &self.latest_branch[index - 1];
            if parent.child_count() >= self.config.max_children || parent.start() > new_start {
                index -= 1;
                continue;
            }
            break;
        }

        let split_time = self.tree_end;
        self.store.ensure_available((self.latest_branch.len() - index) as u32)?;
        self.close_branch(index, split_time, None)?;

        for i in index..self.latest_branch.len() {
            let parent = parent_ref(self.latest_branch[i - 1].sequence_number())?;
            let node_type = self.latest_branch[i].node_type();
            let node = self.init_node(node_type, parent, new_start)?;
            self.latest_branch[i - 1].link_new_child(&node)?;
            self.latest_branch[i] = node;
        }
        Ok(())
    }

    /// Put a new root above the current one and rebuild the latest branch
    /// one level deeper
    fn add_new_root(&mut self, new_start: Timestamp) -> Result<()> {
        let split_time = self.tree_end;
        let depth = self.latest_branch.len();
        self.store.ensure_available(depth as u32 + 1)?;

        // the new root takes the next sequence number once the old branch is on disk
        let root_seq = self.store.node_count();
        self.close_branch(0, split_time, Some(root_seq))?;
        let mut new_root = self.init_node(NodeType::Branch, NO_PARENT, self.config.tree_start)?;
        if new_root.sequence_number() != root_seq {
            return Err(Error::Corrupted(format!(
                "new root took sequence number {} instead of {}",
                new_root.sequence_number(),
                root_seq
            )));
        }
        new_root.link_new_child(&self.latest_branch[0])?;

        debug!(
            root = new_root.sequence_number(),
            old_root = self.latest_branch[0].sequence_number(),
            depth = depth + 1,
            "added new root"
        );

        self.latest_branch.clear();
        self.latest_branch.push(new_root);
        for level in 1..=depth {
            let node_type = if level == depth {
                NodeType::Leaf
            } else {
                NodeType::Branch
            };
            let parent = parent_ref(self.latest_branch[level - 1].sequence_number())?;
            let node = self.init_node(node_type, parent, new_start)?;
            self.latest_branch[level - 1].link_new_child(&node)?;
            self.latest_branch.push(node);
        }
        Ok(())
    }

    /// Close and persist the latest branch from the leaf up to `shallowest`,
    /// giving the node at `shallowest` the parent `new_parent` first
    ///
    /// Nodes are closed and encoded on copies and only replace the in-memory
    /// branch once every block has been written, so a failed encode or write
    /// leaves the branch open and the tree usable.
    fn close_branch(
        &mut self,
        shallowest: usize,
        split_time: Timestamp,
        new_parent: Option<u32>,
    ) -> Result<()> {
        let mut staged: Vec<Node<E>> = self.latest_branch[shallowest..].to_vec();
        let mut parent = match shallowest {
            0 => None,
            _ => Some(self.latest_branch[shallowest - 1].clone()),
        };
        if let Some(seq) = new_parent {
            staged[0].set_parent(seq)?;
        }

        for i in (0..staged.len()).rev() {
            staged[i].close(split_time)?;
            if i > 0 {
                let (upper, lower) = staged.split_at_mut(i);
                upper[i - 1].close_child(&lower[0])?;
            } else if let Some(parent) = parent.as_mut() {
                parent.close_child(&staged[0])?;
            }
        }

        let blocks = staged
            .iter()
            .rev()
            .map(|node| node.serialize())
            .collect::<Result<Vec<_>>>()?;
        for (node, block) in staged.iter().rev().zip(&blocks) {
            self.store.write_block(node, block)?;
            debug!(
                seq = node.sequence_number(),
                start = node.start(),
                end = split_time,
                usage = node.usage_percent(),
                "closed node"
            );
        }

        self.latest_branch.truncate(shallowest);
        if let Some(parent) = parent {
            self.latest_branch[shallowest - 1] = parent;
        }
        self.latest_branch.extend(staged);
        Ok(())
    }

    fn init_node(&self, node_type: NodeType, parent: i32, start: Timestamp) -> Result<Node<E>> {
        let seq = self.store.allocate()?;
        Ok(Node::new(
            node_type,
            self.config.block_size,
            self.config.max_children,
            seq,
            parent,
            start,
        ))
    }

    /// Close every node of the latest branch at `end`, write the file header
    /// and stop accepting intervals
    pub fn close_tree(&mut self, end: Timestamp) -> Result<()> {
        if self.closed {
            return Err(Error::TreeClosed);
        }
        // validate the whole branch first so a bad end leaves the tree usable
        for node in &self.latest_branch {
            node.check_close(end)?;
        }

        self.close_branch(0, end, None)?;
        self.tree_end = end;

        let root = &self.latest_branch[0];
        let header = TreeHeader::new(
            self.config.provider_version,
            self.config.block_size as u32,
            self.config.max_children as u32,
            self.store.node_count(),
            root.sequence_number(),
            root.start(),
        );
        self.store.write_header(&header)?;
        self.store.flush()?;
        self.closed = true;

        info!(
            nodes = header.node_count,
            depth = self.latest_branch.len(),
            end,
            "closed history tree"
        );
        Ok(())
    }

    /// Fetch a node by sequence number
    ///
    /// Nodes on the latest branch are copied from memory; closed nodes come
    /// from the block store.
    pub fn get_node(&self, seq: u32) -> Result<Arc<Node<E>>> {
        let count = self.node_count();
        if seq >= count {
            return Err(Error::NodeNotFound { seq, count });
        }
        if let Some(node) = self.latest_branch.iter().find(|n| n.sequence_number() == seq) {
            return Ok(Arc::new(node.clone()));
        }
        self.store.read_node(seq)
    }

    /// Walk every node and verify the structural invariants
    pub fn check_integrity(&self) -> Result<()> {
        for seq in 0..self.node_count() {
            let node = self.get_node(seq)?;
            self.check_node(&node)?;
        }
        Ok(())
    }

    fn check_node(&self, node: &Node<E>) -> Result<()> {
        let seq = node.sequence_number();
        let corrupted = |what: String| Err(Error::Corrupted(format!("node {}: {}", seq, what)));

        if node.start() < self.config.tree_start {
            return corrupted(format!("starts at {} before the tree start", node.start()));
        }
        if node.is_closed() && node.end() < node.start() {
            return corrupted(format!("ends at {} before its start {}", node.end(), node.start()));
        }
        if !node.is_closed() && node.end() != OPEN_END {
            return corrupted("open node has an end time".to_string());
        }
        for interval in node.intervals() {
            if interval.start() < node.start() {
                return corrupted(format!("holds an interval starting at {}", interval.start()));
            }
            if node.is_closed() && interval.end() > node.end() {
                return corrupted(format!("holds an interval ending at {}", interval.end()));
            }
        }

        let children = node.children();
        if let Some(first) = children.first() {
            if first.start != node.start() {
                return corrupted(format!(
                    "starts at {} but its first child {} starts at {}",
                    node.start(),
                    first.seq,
                    first.start
                ));
            }
        }
        if let (true, Some(last)) = (node.is_closed(), children.last()) {
            if last.end != node.end() {
                return corrupted(format!(
                    "ends at {} but its last child {} ends at {}",
                    node.end(),
                    last.seq,
                    last.end
                ));
            }
        }
        for link in children {
            let child = self.get_node(link.seq)?;
            if i32::try_from(seq).ok() != Some(child.parent_sequence_number()) {
                return corrupted(format!(
                    "child {} points to parent {}",
                    link.seq,
                    child.parent_sequence_number()
                ));
            }
            if child.start() != link.start || child.end() != link.end {
                return corrupted(format!(
                    "cached bounds [{}, {}] of child {} differ from [{}, {}]",
                    link.start,
                    link.end,
                    link.seq,
                    child.start(),
                    child.end()
                ));
            }
            if child.start() < node.start() {
                return corrupted(format!("child {} starts before its parent", link.seq));
            }
            if node.is_closed() && child.is_closed() && child.end() > node.end() {
                return corrupted(format!("child {} ends after its parent", link.seq));
            }
        }
        Ok(())
    }

    /// Current shape and size of the tree
    pub fn stats(&self) -> Result<TreeStats> {
        Ok(TreeStats {
            block_size: self.config.block_size,
            max_children: self.config.max_children,
            node_count: self.node_count(),
            depth: self.depth(),
            file_size: self.store.file_size()?,
            root_seq: self.root().sequence_number(),
            latest_leaf_seq: self.latest_leaf().sequence_number(),
            tree_start: self.tree_start(),
            tree_end: self.tree_end,
            closed: self.closed,
        })
    }

    /// Size of the backing file in bytes
    pub fn file_size(&self) -> Result<u64> {
        self.store.file_size()
    }

    /// Print the tree in pre-order, one node per line, indented by depth
    pub fn debug_dump<W: Write>(&self, writer: &mut W, with_intervals: bool) -> Result<()> {
        writeln!(writer, "{}", self)?;
        writeln!(writer)?;
        let root = self.get_node(self.root().sequence_number())?;
        self.dump_node(writer, &root, 0, with_intervals)
    }

    fn dump_node<W: Write>(&self, writer: &mut W, node: &Node<E>, level: usize, with_intervals: bool) -> Result<()> {
        let indent = "  ".repeat(level);
        writeln!(writer, "{}{}", indent, node)?;
        if with_intervals {
            for interval in node.intervals() {
                writeln!(writer, "{}  - {:?}", indent, interval)?;
            }
        }
        for link in node.children() {
            let child = self.get_node(link.seq)?;
            self.dump_node(writer, &child, level + 1, with_intervals)?;
        }
        Ok(())
    }

    /// Flush and release the backing file
    pub fn close_file(self) -> Result<()> {
        info!(path = %self.config.path.display(), "closing history file");
        self.store.close()
    }

    /// Release and remove the backing file
    pub fn delete_file(self) -> Result<()> {
        info!(path = %self.config.path.display(), "deleting history tree");
        self.store.delete()
    }
}

impl<E: HtInterval> fmt::Display for HistoryTree<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "History tree {}", self.config.path.display())?;
        writeln!(f, "  block size: {}", self.config.block_size)?;
        writeln!(f, "  max children: {}", self.config.max_children)?;
        writeln!(f, "  nodes: {}", self.node_count())?;
        writeln!(f, "  depth: {}", self.depth())?;
        match self.store.file_size() {
            Ok(size) => writeln!(f, "  file size: {} bytes", size)?,
            Err(_) => writeln!(f, "  file size: unavailable")?,
        }
        writeln!(f, "  root: #{}", self.root().sequence_number())?;
        writeln!(f, "  latest leaf: #{}", self.latest_leaf().sequence_number())?;
        write!(
            f,
            "  range: [{} - {}]{}",
            self.tree_start(),
            self.tree_end,
            if self.closed { ", closed" } else { "" }
        )
    }
}
