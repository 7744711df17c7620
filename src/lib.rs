//! Non-blocking extent cache implementation
//!
//! This crate sits between a message-oriented network engine and an
//! asynchronous object-storage engine. File regions are cached in fixed-size
//! in-memory extents so the network side can stream cached bytes directly
//! to/from its buffers without copies, while the storage side fills or
//! drains those extents in the background. The cache coordinates write-back,
//! eviction, and pending-I/O tracking; it never blocks on storage and holds
//! no persistent state.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

use std::fmt;

#[cfg(feature = "serializable")]
use serde::Deserialize;
#[cfg(feature = "serializable")]
use serde::Serialize;

pub use crate::cache::Cache;
pub use crate::cache::Post;
pub use crate::error::CacheError;
pub use crate::extent::ExtentFlags;
pub use crate::flow::Flow;
pub use crate::flow::FlowDescriptor;
pub use crate::flow::FlowEndpoint;
pub use crate::flow::FlowState;
pub use crate::flow::ITEM_BYTES;
pub use crate::flow::MAX_REGIONS;
pub use crate::network::BufferKind;
pub use crate::network::MessageTag;
pub use crate::network::NetworkCallback;
pub use crate::network::NetworkEngine;
pub use crate::network::NetworkError;
pub use crate::network::NetworkOpId;
pub use crate::network::NetworkPost;
pub use crate::network::PeerAddr;
pub use crate::request::RequestHandle;
pub use crate::storage::IoStatus;
pub use crate::storage::MemRegion;
pub use crate::storage::OpId;
pub use crate::storage::StorageEngine;
pub use crate::storage::StorageError;
pub use crate::storage::StreamRegion;

mod aiovec;
mod cache;
mod error;
mod extent;
mod flow;
mod inode;
mod job;
mod lru;
mod network;
mod radix;
mod request;
mod slab;
mod stack;
mod state;
mod storage;

/// Collection an object belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct CollectionId(pub u32);

/// Opaque identifier of a storage object within a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct ObjectHandle(pub u64);

/// Caller context handed through to the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct ContextId(pub u64);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One contiguous file region of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct FileRegion {
    /// Byte offset within the object.
    pub offset: u64,
    /// Region length in bytes.
    pub len: u64,
}

/// A caller-supplied bounce buffer for the buffered operation modes. The
/// memory must stay valid until the request completes.
#[derive(Debug, Clone, Copy)]
pub struct UserBuffer {
    /// Buffer start.
    pub addr: *mut u8,
    /// Buffer length in bytes.
    pub len: u64,
}

// The buffered jobs are the only writers through this pointer, under the
// request slot lock.
unsafe impl Send for UserBuffer {}
unsafe impl Sync for UserBuffer {}

/// Cache replacement policy requested per descriptor. Only LRU is a real
/// policy; the remaining tags are placeholders that delegate to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum CachePolicy {
    /// Least-recently-used replacement.
    #[default]
    Lru,
    /// Most-recently-used; delegates to LRU.
    Mru,
    /// Uncached; delegates to LRU.
    None,
    /// Adaptive replacement; delegates to LRU.
    Arc,
}

/// Per-request cache hints.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct CacheHints {
    /// Replacement policy tag.
    pub policy: CachePolicy,
}

/// When dirty extents get written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum SyncPolicy {
    /// Write back an inode's dirty extents as soon as a write releases.
    Aggressive,
    /// Write back only when the cache-wide dirty count exceeds the
    /// threshold.
    Lazy {
        /// Dirty-extent count above which write-back starts.
        dirty_threshold: u64,
    },
}

/// Cache configuration fixed at init.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct CacheConfig {
    /// Size of the internal request pool.
    pub max_request_count: usize,
    /// Extent size in bytes; must be a power of two.
    pub extent_size: usize,
    /// Total buffer bytes; must be a non-zero multiple of `extent_size`.
    pub cache_size: usize,
    /// Inode table bucket count; must be a power of two.
    pub inode_buckets: usize,
    /// Key width of the per-object radix index.
    pub max_index_bits: u32,
    /// Write-back policy.
    pub sync_policy: SyncPolicy,
}

impl CacheConfig {
    /// Defaults matching the typical deployment: 32 KiB extents, a 10000
    /// entry request pool, 1024 inode buckets, 24 index bits, lazy
    /// write-back starting at half the pool.
    pub fn new(cache_size: usize) -> Self {
        CacheConfig {
            max_request_count: 10_000,
            extent_size: 32_768,
            cache_size,
            inode_buckets: 1_024,
            max_index_bits: 24,
            sync_policy: SyncPolicy::Lazy {
                dirty_threshold: (cache_size / 32_768 / 2) as u64,
            },
        }
    }
}

/// One entry of a reply's communication-buffer vector.
#[derive(Debug, Clone, Copy)]
pub struct CommBuffer {
    /// Buffer address; null until the slot's extent is resolved.
    pub addr: *mut u8,
    /// Piece length in bytes.
    pub len: u64,
    /// Whether the piece is ready for communication.
    pub ready: bool,
}

// Buffers point into the pool slab, which lives as long as the cache; the
// extent state machine serialises writers per extent.
unsafe impl Send for CommBuffer {}
unsafe impl Sync for CommBuffer {}

/// Communication-buffer vector describing where a request's bytes live.
#[derive(Debug, Clone, Default)]
pub struct CacheReply {
    /// One entry per communication slot, in file-region order.
    pub buffers: Vec<CommBuffer>,
}

impl CacheReply {
    /// Number of communication slots.
    pub fn count(&self) -> usize {
        self.buffers.len()
    }

    /// Whether every slot is ready.
    pub fn all_ready(&self) -> bool {
        self.buffers.iter().all(|b| b.ready)
    }

    /// Total bytes across all slots.
    pub fn total_len(&self) -> u64 {
        self.buffers.iter().map(|b| b.len).sum()
    }
}

/// Counter snapshot returned by a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheInfo {
    /// Total buffer bytes.
    pub total_size: u64,
    /// Bytes in the free pool.
    pub free_size: u64,
    /// Extent size in bytes.
    pub extent_size: u64,
    /// Free extents.
    pub nr_free: u64,
    /// Extents on the active list.
    pub nr_active: u64,
    /// Extents on the inactive list.
    pub nr_inactive: u64,
    /// Dirty extents awaiting write-back.
    pub nr_dirty: u64,
    /// Extents with write-back in flight.
    pub nr_writeback: u64,
}

/// A read, write or sync request descriptor.
#[derive(Debug, Clone)]
pub struct CacheDescriptor {
    /// Collection of the target object.
    pub collection: CollectionId,
    /// Target object.
    pub handle: ObjectHandle,
    /// Caller context handed to the storage engine.
    pub context: ContextId,
    /// File regions to read or write; possibly of length 1.
    pub regions: Vec<FileRegion>,
    /// Bounce buffer: when set, the cache copies bytes in or out and
    /// completes the request itself.
    pub buffer: Option<UserBuffer>,
    /// Cache hints.
    pub hints: CacheHints,
}

/// A sync request: a specific object, or everything.
#[derive(Debug, Clone, Copy)]
pub struct SyncDescriptor {
    /// Object to sync; `None` requests a global sync.
    pub target: Option<(CollectionId, ObjectHandle)>,
}
