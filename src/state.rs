//! Extent state transitions.
//!
//! The state machine is driven by three classes of events: access from a
//! request (with read or write intent), communication completion from the
//! network side, and I/O completion from the storage side. Storage
//! completion is only ever observed by probing; nothing here blocks.
//!
//! Callers hold the owning inode's lock and the cache-stack lock.

use log::{error, trace, warn};
use smallvec::SmallVec;

use crate::aiovec::AIOVEC_SIZE;
use crate::error::CacheError;
use crate::extent::{ExtentFlags, ExtentId};
use crate::inode::{Inode, InodeState};
use crate::lru;
use crate::slab::BufferSlab;
use crate::stack::CacheStack;
use crate::storage::{DEFAULT_TEST_TIMEOUT, IoStatus, MemRegion, StorageEngine, StreamRegion};

/// Outcome of an access-intent transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    /// The extent buffer may be used for communication now.
    Ready,
    /// The access is held; re-probe on the next engine entry.
    NotReady,
}

const PENDING_IO: ExtentFlags = ExtentFlags::READ_PENDING
    .union(ExtentFlags::WRITE_PENDING)
    .union(ExtentFlags::RMW);

/// Probe the storage op an extent is chained to. On completion, every extent
/// on the chain transitions per the fan-out rule. On an engine error the
/// chain's op handles are reset and the error is surfaced; flags stay as
/// they are.
pub(crate) fn probe_io(
    stack: &mut CacheStack,
    storage: &dyn StorageEngine,
    id: ExtentId,
) -> Result<bool, CacheError> {
    let Some(op) = stack.ext(id).io_req else {
        error!("probe on extent {:?} with no storage op", id);
        return Err(CacheError::InvalFlags);
    };
    match storage.test(op, DEFAULT_TEST_TIMEOUT) {
        IoStatus::Complete => {
            trace!("storage {} complete", op);
            io_complete_fanout(stack, id);
            Ok(true)
        }
        IoStatus::Pending => Ok(false),
        IoStatus::Error(code) => {
            warn!("storage {} failed with {}", op, code);
            let mut cur = id;
            loop {
                let next = stack.ext(cur).io_chain_next;
                let e = stack.ext_mut(cur);
                e.io_req = None;
                e.io_chain_next = cur;
                if next == id {
                    break;
                }
                cur = next;
            }
            Err(CacheError::Cache(code))
        }
    }
}

/// One storage completion resolves every extent batched into the op: walk
/// the io chain, mark each clean, and dissolve the cycle.
pub(crate) fn io_complete_fanout(stack: &mut CacheStack, start: ExtentId) {
    let mut cur = start;
    let mut cnt = 0u32;
    loop {
        let next = stack.ext(cur).io_chain_next;
        let e = stack.ext_mut(cur);
        let was_writeback = e.flags.contains(ExtentFlags::WRITE_PENDING);
        e.flags.remove(ExtentFlags::DIRTY | PENDING_IO);
        e.flags.insert(ExtentFlags::CLEAN);
        e.io_req = None;
        e.io_chain_next = cur;
        if was_writeback {
            stack.nr_writeback -= 1;
        }
        cnt += 1;
        if next == start {
            break;
        }
        cur = next;
    }
    trace!("io fan-out marked {} extent(s) clean", cnt);
}

/// Read-intent access to a cached extent.
pub(crate) fn read_access(
    stack: &mut CacheStack,
    storage: &dyn StorageEngine,
    id: ExtentId,
) -> Result<Access, CacheError> {
    let flags = stack.ext(id).flags;
    if flags.contains(ExtentFlags::LRU) && !flags.contains(ExtentFlags::ACTIVE) {
        lru::move_inactive_to_active(stack, id);
    }
    stack.ext_mut(id).flags.insert(ExtentFlags::REFERENCED);

    // A granted write ahead of this read; wait for its release.
    if stack.ext(id).write_refs > stack.ext(id).write_acks {
        return Ok(Access::NotReady);
    }

    let flags = stack.ext(id).flags;
    if flags.contains(ExtentFlags::WRITE_COMM) {
        return Ok(Access::NotReady);
    }
    // Two reads may stream from the same buffer concurrently.
    if flags.contains(ExtentFlags::READ_COMM) {
        return Ok(Access::Ready);
    }
    if flags.intersects(ExtentFlags::CLEAN | ExtentFlags::DIRTY) {
        stack.ext_mut(id).flags.insert(ExtentFlags::READ_COMM);
        return Ok(Access::Ready);
    }
    if flags.intersects(PENDING_IO) {
        if probe_io(stack, storage, id)? {
            stack.ext_mut(id).flags.insert(ExtentFlags::READ_COMM);
            return Ok(Access::Ready);
        }
        return Ok(Access::NotReady);
    }

    error!("read access: invalid flags {:?} on extent {:?}", flags, id);
    Err(CacheError::InvalFlags)
}

/// Write-intent access to a cached extent. Writes are serialised per extent
/// and held behind any outstanding read reference.
pub(crate) fn write_access(
    stack: &mut CacheStack,
    storage: &dyn StorageEngine,
    id: ExtentId,
) -> Result<Access, CacheError> {
    stack.ext_mut(id).flags.insert(ExtentFlags::REFERENCED);
    let e = stack.ext(id);
    if e.write_refs > e.write_acks {
        return Ok(Access::NotReady);
    }
    if e.read_refs > e.read_acks {
        return Ok(Access::NotReady);
    }

    let flags = e.flags;
    if flags.intersects(PENDING_IO) {
        if !probe_io(stack, storage, id)? {
            return Ok(Access::NotReady);
        }
        // fell through to the clean case below
    }

    let flags = stack.ext(id).flags;
    if flags.intersects(ExtentFlags::READ_COMM | ExtentFlags::WRITE_COMM) {
        return Ok(Access::NotReady);
    }
    if flags.intersects(ExtentFlags::CLEAN | ExtentFlags::DIRTY) {
        let e = stack.ext_mut(id);
        e.flags.remove(ExtentFlags::BLANK);
        e.flags.insert(ExtentFlags::WRITE_COMM);
        return Ok(Access::Ready);
    }

    error!("write access: invalid flags {:?} on extent {:?}", flags, id);
    Err(CacheError::InvalFlags)
}

/// First access to a freshly allocated read extent: the storage read has
/// been issued, the extent waits for it.
pub(crate) fn first_read_access(stack: &mut CacheStack, id: ExtentId) {
    let e = stack.ext_mut(id);
    e.flags.remove(ExtentFlags::BLANK);
    e.flags.insert(ExtentFlags::READ_PENDING);
}

/// First access to a freshly allocated full-extent write: the buffer is
/// handed straight to the network.
pub(crate) fn first_write_access(stack: &mut CacheStack, id: ExtentId) {
    let e = stack.ext_mut(id);
    e.flags.remove(ExtentFlags::BLANK);
    e.flags.insert(ExtentFlags::WRITE_COMM);
}

/// Mark a freshly allocated extent read-modify-write: the surrounding bytes
/// are being read before the partial write may proceed.
pub(crate) fn mark_rmw(stack: &mut CacheStack, id: ExtentId, op: crate::storage::OpId) {
    let e = stack.ext_mut(id);
    e.flags.remove(ExtentFlags::BLANK);
    e.flags.insert(ExtentFlags::RMW);
    e.io_req = Some(op);
    e.io_chain_next = id;
}

/// The network finished streaming out of this extent.
pub(crate) fn read_comm_done(stack: &mut CacheStack, id: ExtentId) {
    let e = stack.ext_mut(id);
    e.flags.remove(ExtentFlags::READ_COMM);
    e.read_acks += 1;
}

/// The network finished streaming into this extent: it is now dirty.
pub(crate) fn write_comm_done(stack: &mut CacheStack, id: ExtentId) {
    let e = stack.ext_mut(id);
    e.flags.remove(ExtentFlags::WRITE_COMM | ExtentFlags::CLEAN);
    e.flags.insert(ExtentFlags::DIRTY);
    e.write_acks += 1;
}

/// The write communication failed. The reference is acknowledged but the
/// extent does not dirty; returns whether the buffer still holds backed
/// content (clean or dirty from before the grant). An unbacked extent must
/// not stay cached.
pub(crate) fn write_comm_abort(stack: &mut CacheStack, id: ExtentId) -> bool {
    let e = stack.ext_mut(id);
    e.flags.remove(ExtentFlags::WRITE_COMM);
    e.write_acks += 1;
    e.flags
        .intersects(ExtentFlags::CLEAN | ExtentFlags::DIRTY)
}

/// Initiate write-back of every dirty extent of one inode, in ascending
/// file-offset order, batching through the inode's aiovec. Extents in one
/// batch join the submission's io chain and are flagged `WRITE_PENDING`.
///
/// The caller holds the inode lock and the cache-stack lock. Returns the
/// number of extents submitted.
pub(crate) fn data_sync(
    inode: &Inode,
    ino: &mut InodeState,
    stack: &mut CacheStack,
    storage: &dyn StorageEngine,
    slab: &BufferSlab,
    extent_size: u64,
) -> Result<u32, CacheError> {
    if ino.dirty.is_empty() {
        return Ok(0);
    }

    // An extent a later write is currently streaming into stays dirty for a
    // later round; everything else goes out in ascending file-offset order.
    let (mut dirty, keep): (Vec<ExtentId>, Vec<ExtentId>) = std::mem::take(&mut ino.dirty)
        .into_iter()
        .partition(|id| !stack.ext(*id).flags.contains(ExtentFlags::WRITE_COMM));
    ino.dirty = keep;
    ino.nr_dirty = ino.dirty.len() as u32;
    let nr_dirty = dirty.len();
    if nr_dirty == 0 {
        return Ok(0);
    }
    trace!(
        "data_sync: {} dirty extent(s) on handle {}",
        nr_dirty,
        inode.handle.0
    );
    dirty.sort_by_key(|id| stack.ext(*id).index);

    let mut submitted = 0usize;
    while submitted < dirty.len() {
        let batch = &dirty[submitted..(submitted + AIOVEC_SIZE).min(dirty.len())];
        ino.aiovec.reinit();
        for &id in batch {
            let e = stack.ext(id);
            debug_assert!(e.flags.contains(ExtentFlags::DIRTY));
            ino.aiovec.add(
                id,
                StreamRegion {
                    offset: e.index * extent_size,
                    len: extent_size,
                },
                MemRegion {
                    addr: slab.extent_addr(id.idx()),
                    len: extent_size,
                },
            );
        }
        debug_assert_eq!(ino.aiovec.count(), batch.len());
        let (mem, stream) = ino.aiovec.io_vectors();
        let op = match storage.submit_write_list(
            inode.collection,
            inode.handle,
            inode.context,
            &mem,
            &stream,
            0,
        ) {
            Ok(op) => op,
            Err(e) => {
                // keep the unsubmitted tail dirty
                let tail = dirty.split_off(submitted);
                ino.dirty.extend(tail);
                ino.nr_dirty = ino.dirty.len() as u32;
                stack.nr_dirty -= submitted as u64;
                error!("data_sync: list write failed ({})", e.0);
                return Err(CacheError::Cache(e.0));
            }
        };

        // Chain the batch to the one op so a single probe resolves it all.
        let ids: SmallVec<[ExtentId; AIOVEC_SIZE]> =
            ino.aiovec.entries().iter().map(|e| e.ext).collect();
        for (k, &id) in ids.iter().enumerate() {
            let next = ids[(k + 1) % ids.len()];
            let e = stack.ext_mut(id);
            e.flags.insert(ExtentFlags::WRITE_PENDING);
            e.io_req = Some(op);
            e.io_chain_next = next;
        }
        stack.nr_writeback += ids.len() as u64;
        submitted += ids.len();
    }

    stack.nr_dirty -= nr_dirty as u64;
    Ok(nr_dirty as u32)
}
