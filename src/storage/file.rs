//! Block file holding the closed nodes of a history tree
//!
//! File layout:
//!
//! ```text
//! [tree header, 4 KiB][block 0][block 1]...[block n-1]
//! ```
//!
//! Node `seq` lives at `TREE_HEADER_SIZE + seq * block_size`. The header is
//! only meaningful once the tree has been closed; while a tree is being built
//! the space is reserved and zeroed. Reopened files are memory-mapped and
//! read-only.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::interval::{HtInterval, Timestamp};
use crate::storage::node::{Node, MAX_SEQUENCE_NUMBER};

/// Size of the tree header (4KB)
pub const TREE_HEADER_SIZE: usize = 4096;

/// Magic number identifying history tree files
pub const HISTORY_FILE_MAGIC: u32 = 0x05FF_A900;

/// Revision of the block layout written by this crate
pub const FILE_FORMAT_VERSION: u32 = 1;

/// Bytes of the header covered by the checksum
const HEADER_CHECKED_LEN: usize = 36;

/// Metadata needed to reopen a closed tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHeader {
    /// Magic number for file format identification
    pub magic: u32,
    /// Revision of the block layout
    pub format_version: u32,
    /// Caller-supplied version tag
    pub provider_version: u32,
    /// Size of every node block
    pub block_size: u32,
    /// Maximum number of children per branch node
    pub max_children: u32,
    /// Number of nodes in the file
    pub node_count: u32,
    /// Sequence number of the root node
    pub root_seq: u32,
    /// Start time of the tree
    pub tree_start: Timestamp,
    /// CRC32 of the preceding fields
    pub checksum: u32,
}

impl TreeHeader {
    /// Create a header for a freshly closed tree
    pub fn new(
        provider_version: u32,
        block_size: u32,
        max_children: u32,
        node_count: u32,
        root_seq: u32,
        tree_start: Timestamp,
    ) -> Self {
        let mut header = Self {
            magic: HISTORY_FILE_MAGIC,
            format_version: FILE_FORMAT_VERSION,
            provider_version,
            block_size,
            max_children,
            node_count,
            root_seq,
            tree_start,
            checksum: 0,
        };
        header.update_checksum();
        header
    }

    fn checked_bytes(&self) -> [u8; HEADER_CHECKED_LEN] {
        let mut bytes = [0u8; HEADER_CHECKED_LEN];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.provider_version.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.block_size.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.max_children.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.node_count.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.root_seq.to_le_bytes());
        bytes[28..36].copy_from_slice(&self.tree_start.to_le_bytes());
        bytes
    }

    /// Recompute the checksum after editing fields
    pub fn update_checksum(&mut self) {
        self.checksum = crc32fast::hash(&self.checked_bytes());
    }

    /// Verify checksum
    pub fn verify_checksum(&self) -> bool {
        self.checksum == crc32fast::hash(&self.checked_bytes())
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; TREE_HEADER_SIZE] {
        let mut bytes = [0u8; TREE_HEADER_SIZE];
        bytes[..HEADER_CHECKED_LEN].copy_from_slice(&self.checked_bytes());
        bytes[36..40].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TREE_HEADER_SIZE {
            return Err(truncated(format!(
                "{} bytes is too small for the tree header",
                bytes.len()
            )));
        }
        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        Ok(Self {
            magic: u32_at(0),
            format_version: u32_at(4),
            provider_version: u32_at(8),
            block_size: u32_at(12),
            max_children: u32_at(16),
            node_count: u32_at(20),
            root_seq: u32_at(24),
            tree_start: i64::from_le_bytes([
                bytes[28], bytes[29], bytes[30], bytes[31],
                bytes[32], bytes[33], bytes[34], bytes[35],
            ]),
            checksum: u32_at(36),
        })
    }

    /// Check magic, checksum, format revision and provider version, in that order
    pub fn validate(&self, expected_provider_version: u32) -> Result<()> {
        if self.magic != HISTORY_FILE_MAGIC {
            return Err(Error::Corrupted(format!(
                "bad magic number {:#010x}, not a history tree file",
                self.magic
            )));
        }
        if !self.verify_checksum() {
            return Err(Error::Corrupted("tree header checksum mismatch".to_string()));
        }
        if self.format_version != FILE_FORMAT_VERSION {
            return Err(Error::FormatVersion {
                expected: FILE_FORMAT_VERSION,
                found: self.format_version,
            });
        }
        if self.provider_version != expected_provider_version {
            return Err(Error::VersionMismatch {
                expected: expected_provider_version,
                found: self.provider_version,
            });
        }
        if self.node_count == 0 || self.root_seq >= self.node_count {
            return Err(Error::Corrupted(format!(
                "root {} is outside the {} stored nodes",
                self.root_seq, self.node_count
            )));
        }
        Ok(())
    }
}

/// A file shorter than its header says it should be
fn truncated(what: String) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, what))
}

enum Backing {
    /// Tree under construction
    Writer(Mutex<File>),
    /// Closed tree reopened for reading
    Mapped(Mmap),
}

/// Fixed-size block storage addressed by node sequence number
pub struct BlockStore<E> {
    path: PathBuf,
    block_size: usize,
    max_children: usize,
    backing: Backing,
    node_count: AtomicU32,
    /// Direct-mapped cache of decoded closed nodes
    cache: Mutex<Vec<Option<Arc<Node<E>>>>>,
    cache_mask: usize,
}

impl<E> fmt::Debug for BlockStore<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockStore")
            .field("path", &self.path)
            .field("block_size", &self.block_size)
            .field("max_children", &self.max_children)
            .field("read_only", &matches!(self.backing, Backing::Mapped(_)))
            .field("node_count", &self.node_count.load(Ordering::SeqCst))
            .finish()
    }
}

impl<E: HtInterval> BlockStore<E> {
    /// Create (or truncate) the file at `path` for a new tree
    pub fn create(path: &Path, block_size: usize, max_children: usize, cache_slots: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(TREE_HEADER_SIZE as u64)?;

        debug!(path = %path.display(), block_size, max_children, "created history file");

        Ok(Self {
            path: path.to_path_buf(),
            block_size,
            max_children,
            backing: Backing::Writer(Mutex::new(file)),
            node_count: AtomicU32::new(0),
            cache: Mutex::new(vec![None; cache_slots]),
            cache_mask: cache_slots - 1,
        })
    }

    /// Map an existing, closed tree file and validate its header
    pub fn open(path: &Path, expected_provider_version: u32, cache_slots: usize) -> Result<(Self, TreeHeader)> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < TREE_HEADER_SIZE as u64 {
            return Err(truncated(format!(
                "file of {} bytes is too small for the tree header",
                len
            )));
        }

        // Safety: the file is opened read-only and this crate never writes to
        // a tree file after it has been closed
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let header = TreeHeader::from_bytes(&mmap[..TREE_HEADER_SIZE])?;
        header.validate(expected_provider_version)?;

        let block_size = header.block_size as usize;
        let max_children = header.max_children as usize;
        let required = TREE_HEADER_SIZE as u64 + header.node_count as u64 * block_size as u64;
        if len < required {
            return Err(truncated(format!(
                "file holds {} bytes but {} nodes need {}",
                len, header.node_count, required
            )));
        }

        debug!(
            path = %path.display(),
            nodes = header.node_count,
            root = header.root_seq,
            "opened history file"
        );

        let store = Self {
            path: path.to_path_buf(),
            block_size,
            max_children,
            backing: Backing::Mapped(mmap),
            node_count: AtomicU32::new(header.node_count),
            cache: Mutex::new(vec![None; cache_slots]),
            cache_mask: cache_slots - 1,
        };
        Ok((store, header))
    }

    /// Reserve the next sequence number
    pub fn allocate(&self) -> Result<u32> {
        self.node_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count <= MAX_SEQUENCE_NUMBER).then_some(count + 1)
            })
            .map_err(|count| Error::SequenceExhausted {
                seq: count,
                max: MAX_SEQUENCE_NUMBER,
            })
    }

    /// Fail unless `needed` more sequence numbers can be allocated
    pub fn ensure_available(&self, needed: u32) -> Result<()> {
        let count = self.node_count();
        let last = count as u64 + needed as u64;
        if needed > 0 && last - 1 > MAX_SEQUENCE_NUMBER as u64 {
            return Err(Error::SequenceExhausted {
                seq: u32::try_from(last - 1).unwrap_or(u32::MAX),
                max: MAX_SEQUENCE_NUMBER,
            });
        }
        Ok(())
    }

    /// Number of sequence numbers handed out so far
    pub fn node_count(&self) -> u32 {
        self.node_count.load(Ordering::SeqCst)
    }

    /// Size of every block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Maximum number of children per branch node
    pub fn max_children(&self) -> usize {
        self.max_children
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file was reopened through a read-only mapping
    pub fn is_read_only(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    /// Byte offset of the block for `seq`
    pub fn block_offset(&self, seq: u32) -> u64 {
        TREE_HEADER_SIZE as u64 + seq as u64 * self.block_size as u64
    }

    fn check_seq(&self, seq: u32) -> Result<()> {
        let count = self.node_count();
        if seq >= count {
            return Err(Error::NodeNotFound { seq, count });
        }
        Ok(())
    }

    fn read_only_error() -> Error {
        Error::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "history file was opened read-only",
        ))
    }

    /// Persist a closed node into its block
    pub fn write(&self, node: &Node<E>) -> Result<()> {
        let bytes = node.serialize()?;
        self.write_block(node, &bytes)
    }

    /// Persist a closed node whose block was already encoded
    pub fn write_block(&self, node: &Node<E>, bytes: &[u8]) -> Result<()> {
        let seq = node.sequence_number();
        if !node.is_closed() {
            return Err(Error::NodeNotClosed { seq });
        }
        if bytes.len() != self.block_size {
            return Err(Error::Corrupted(format!(
                "block of node {} is {} bytes, expected {}",
                seq,
                bytes.len(),
                self.block_size
            )));
        }
        self.check_seq(seq)?;
        let Backing::Writer(file) = &self.backing else {
            return Err(Self::read_only_error());
        };

        {
            let mut file = file.lock();
            file.seek(SeekFrom::Start(self.block_offset(seq)))?;
            file.write_all(bytes)?;
        }
        debug!(seq, start = node.start(), end = node.end(), "wrote node");

        let mut cache = self.cache.lock();
        cache[seq as usize & self.cache_mask] = Some(Arc::new(node.clone()));
        Ok(())
    }

    /// Raw block of a stored node
    pub fn read(&self, seq: u32) -> Result<Vec<u8>> {
        self.check_seq(seq)?;
        let offset = self.block_offset(seq);
        match &self.backing {
            Backing::Writer(file) => {
                let mut buf = vec![0u8; self.block_size];
                let mut file = file.lock();
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut buf)?;
                Ok(buf)
            }
            Backing::Mapped(mmap) => {
                let start = offset as usize;
                let end = start + self.block_size;
                mmap.get(start..end)
                    .map(|block| block.to_vec())
                    .ok_or_else(|| truncated(format!("block of node {} is past the end of the file", seq)))
            }
        }
    }

    /// Decoded node, served from the cache when possible
    pub fn read_node(&self, seq: u32) -> Result<Arc<Node<E>>> {
        self.check_seq(seq)?;
        let slot = seq as usize & self.cache_mask;
        {
            let cache = self.cache.lock();
            if let Some(node) = &cache[slot] {
                if node.sequence_number() == seq {
                    trace!(seq, "node cache hit");
                    return Ok(Arc::clone(node));
                }
            }
        }

        trace!(seq, "node cache miss");
        let bytes = self.read(seq)?;
        let node = Node::deserialize(&bytes, self.block_size, self.max_children)?;
        if node.sequence_number() != seq {
            return Err(Error::Corrupted(format!(
                "block {} holds node {}",
                seq,
                node.sequence_number()
            )));
        }
        let node = Arc::new(node);
        self.cache.lock()[slot] = Some(Arc::clone(&node));
        Ok(node)
    }

    /// Write the tree header at the start of the file
    pub fn write_header(&self, header: &TreeHeader) -> Result<()> {
        let Backing::Writer(file) = &self.backing else {
            return Err(Self::read_only_error());
        };
        let mut file = file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.to_bytes())?;
        debug!(nodes = header.node_count, root = header.root_seq, "wrote tree header");
        Ok(())
    }

    /// Flush written blocks to disk
    pub fn flush(&self) -> Result<()> {
        if let Backing::Writer(file) = &self.backing {
            let mut file = file.lock();
            file.flush()?;
            file.sync_data()?;
        }
        Ok(())
    }

    /// Current size of the file in bytes
    pub fn file_size(&self) -> Result<u64> {
        match &self.backing {
            Backing::Writer(file) => Ok(file.lock().metadata()?.len()),
            Backing::Mapped(mmap) => Ok(mmap.len() as u64),
        }
    }

    /// Flush and release the file
    pub fn close(self) -> Result<()> {
        self.flush()
    }

    /// Release the file and remove it from disk
    pub fn delete(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        fs::remove_file(&path)?;
        debug!(path = %path.display(), "deleted history file");
        Ok(())
    }
}
