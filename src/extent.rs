//! Extent slots.
//!
//! An extent is a fixed-size, power-of-two aligned slice of the cache slab
//! plus the metadata tracking its state: flag word, owning object, reference
//! and completion counts, and its membership in the pool lists. Slots are
//! created once at init and recycled; their buffer slices never move.

use std::sync::Arc;

use bitflags::bitflags;

use crate::inode::Inode;
use crate::storage::OpId;

bitflags! {
    /// Extent state bits.
    ///
    /// At most one of `BLANK`, `CLEAN`, `DIRTY` is set outside the narrow
    /// transition windows. A free-pool extent carries an empty flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExtentFlags: u32 {
        /// Freshly allocated; buffer content undefined for the new index.
        const BLANK = 1 << 0;
        /// Buffer matches storage.
        const CLEAN = 1 << 1;
        /// Buffer modified since last write-back.
        const DIRTY = 1 << 2;
        /// Reachable from one of the LRU lists.
        const LRU = 1 << 3;
        /// On the active LRU list (as opposed to inactive).
        const ACTIVE = 1 << 4;
        /// Touched since the last scan; aging hint.
        const REFERENCED = 1 << 5;
        /// A storage read into this extent is outstanding.
        const READ_PENDING = 1 << 6;
        /// A storage write-back of this extent is outstanding.
        const WRITE_PENDING = 1 << 7;
        /// The network is streaming out of this buffer.
        const READ_COMM = 1 << 8;
        /// The network is streaming into this buffer.
        const WRITE_COMM = 1 << 9;
        /// A read-modify-write preread is outstanding.
        const RMW = 1 << 10;
    }
}

/// Stable index of an extent slot within the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ExtentId(pub(crate) u32);

impl ExtentId {
    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}

/// One extent slot. All fields are guarded by the cache-stack lock.
#[derive(Debug)]
pub(crate) struct Extent {
    pub(crate) flags: ExtentFlags,
    /// File-extent index within the owning object.
    pub(crate) index: u64,
    /// Owning inode while cached; `None` in the free pool.
    pub(crate) owner: Option<Arc<Inode>>,

    pub(crate) read_refs: u32,
    pub(crate) read_acks: u32,
    pub(crate) write_refs: u32,
    pub(crate) write_acks: u32,

    /// Outstanding storage operation, if any.
    pub(crate) io_req: Option<OpId>,
    /// Cycle of all extents sharing one storage operation; points to itself
    /// for a solo extent.
    pub(crate) io_chain_next: ExtentId,

    pub(crate) lru_prev: Option<ExtentId>,
    pub(crate) lru_next: Option<ExtentId>,
}

impl Extent {
    pub(crate) fn free_slot(id: ExtentId) -> Self {
        Extent {
            flags: ExtentFlags::empty(),
            index: 0,
            owner: None,
            read_refs: 0,
            read_acks: 0,
            write_refs: 0,
            write_acks: 0,
            io_req: None,
            io_chain_next: id,
            lru_prev: None,
            lru_next: None,
        }
    }

    /// Reset a recycled slot for allocation. The buffer slice is untouched;
    /// the slot comes back blank.
    pub(crate) fn reset_blank(&mut self, id: ExtentId) {
        *self = Extent::free_slot(id);
        self.flags = ExtentFlags::BLANK;
    }

    /// Pending read or write references from live requests.
    pub(crate) fn referenced(&self) -> bool {
        self.read_refs != self.read_acks || self.write_refs != self.write_acks
    }

    pub(crate) fn io_pending(&self) -> bool {
        self.flags
            .intersects(ExtentFlags::READ_PENDING | ExtentFlags::WRITE_PENDING | ExtentFlags::RMW)
    }
}
