//! Per-object metadata.
//!
//! One inode exists per `(collection, handle)` pair ever touched. It owns
//! the radix index of that object's cached extents, the dirty list, and a
//! scratch aiovec for batching write-back submissions. Inodes are found
//! through a fixed-size bucketed table and are never freed; their cost is a
//! few list heads and a lock.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::aiovec::Aiovec;
use crate::extent::ExtentId;
use crate::radix::RadixIndex;
use crate::{CollectionId, ContextId, ObjectHandle};

/// Radix leaf: the cached extent's index plus its pool slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CachedExtent {
    pub(crate) index: u64,
    pub(crate) ext: ExtentId,
}

pub(crate) fn cached_extent_key(c: &CachedExtent) -> u64 {
    c.index
}

/// Mutable inode state, guarded by the inode lock.
#[derive(Debug)]
pub(crate) struct InodeState {
    /// Index of cached extents keyed by extent index.
    pub(crate) tree: RadixIndex<CachedExtent>,
    /// Extents dirtied by completed write communication, in completion
    /// order. Sorted by extent index before write-back.
    pub(crate) dirty: Vec<ExtentId>,
    pub(crate) nr_dirty: u32,
    /// Extents currently published in the tree.
    pub(crate) nrpages: u64,
    /// Scratch batch for list-I/O submission.
    pub(crate) aiovec: Aiovec,
}

/// Per-object metadata and lock.
#[derive(Debug)]
pub(crate) struct Inode {
    pub(crate) collection: CollectionId,
    pub(crate) handle: ObjectHandle,
    pub(crate) context: ContextId,
    pub(crate) state: Mutex<InodeState>,
}

impl Inode {
    fn new(
        collection: CollectionId,
        handle: ObjectHandle,
        context: ContextId,
        max_index_bits: u32,
    ) -> Self {
        Inode {
            collection,
            handle,
            context,
            state: Mutex::new(InodeState {
                tree: RadixIndex::new(cached_extent_key, max_index_bits),
                dirty: Vec::new(),
                nr_dirty: 0,
                nrpages: 0,
                aiovec: Aiovec::new(),
            }),
        }
    }
}

/// Fixed-size open-chained inode table, bucketed by `handle mod buckets`.
#[derive(Debug)]
pub(crate) struct InodeTable {
    buckets: Box<[Mutex<Vec<Arc<Inode>>>]>,
    mask: u64,
    max_index_bits: u32,
}

impl InodeTable {
    /// `buckets` must be a power of two.
    pub(crate) fn new(buckets: usize, max_index_bits: u32) -> Self {
        debug_assert!(buckets.is_power_of_two());
        let buckets = (0..buckets)
            .map(|_| Mutex::new(Vec::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        InodeTable {
            mask: buckets.len() as u64 - 1,
            buckets,
            max_index_bits,
        }
    }

    /// Find or create the inode for `(collection, handle)`. The context of
    /// the first toucher sticks.
    pub(crate) fn get(
        &self,
        collection: CollectionId,
        handle: ObjectHandle,
        context: ContextId,
    ) -> Arc<Inode> {
        let bucket = &self.buckets[(handle.0 & self.mask) as usize];
        let mut chain = bucket.lock();
        if let Some(found) = chain
            .iter()
            .find(|i| i.handle == handle && i.collection == collection)
        {
            return Arc::clone(found);
        }
        let inode = Arc::new(Inode::new(collection, handle, context, self.max_index_bits));
        chain.push(Arc::clone(&inode));
        log::debug!(
            "new inode for collection {} handle {}",
            collection.0,
            handle.0
        );
        inode
    }

    /// Look up without creating.
    pub(crate) fn find(&self, collection: CollectionId, handle: ObjectHandle) -> Option<Arc<Inode>> {
        let bucket = &self.buckets[(handle.0 & self.mask) as usize];
        let chain = bucket.lock();
        chain
            .iter()
            .find(|i| i.handle == handle && i.collection == collection)
            .map(Arc::clone)
    }

    /// Snapshot every inode, for global sync.
    pub(crate) fn all(&self) -> Vec<Arc<Inode>> {
        let mut out = Vec::new();
        for bucket in self.buckets.iter() {
            out.extend(bucket.lock().iter().map(Arc::clone));
        }
        out
    }
}
