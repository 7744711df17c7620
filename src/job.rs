//! Per-optype job workers.
//!
//! Every request type has a worker that advances the request as far as the
//! current extent states allow, then settles the request status. Workers
//! never block on storage; a slot that is not ready is simply left for the
//! next engine entry to re-probe.
//!
//! Lock order inside a worker: request slot, then the inode lock, then the
//! cache-stack lock. The request-list lock is only ever taken on its own.

use std::sync::Arc;

use log::{error, trace};

use crate::cache::Cache;
use crate::error::CacheError;
use crate::extent::{ExtentFlags, ExtentId};
use crate::inode::{CachedExtent, Inode, InodeState};
use crate::request::{CacheRequest, OpKind, PipeList, ReqStatus};
use crate::stack::CacheStack;
use crate::state::{self, Access};
use crate::storage::MemRegion;
use crate::{CacheInfo, CachePolicy, SyncPolicy};

/// Eviction batch requested per shrink attempt.
pub(crate) const SHRINK_STEP: u32 = 5;

/// Advance one request and migrate it between pipeline lists according to
/// the status it reaches.
pub(crate) fn do_a_job(cache: &Cache, id: u32) -> Result<(), CacheError> {
    let mut req = cache.requests.slot(id).lock();
    let res = match req.optype {
        OpKind::Read => read_job(cache, &mut req),
        OpKind::Write => write_job(cache, &mut req),
        OpKind::BufRead => bufread_job(cache, &mut req),
        OpKind::BufWrite => bufwrite_job(cache, &mut req),
        OpKind::Query => query_job(cache, &mut req),
        OpKind::Demote => demote_job(cache, &mut req),
        OpKind::Sync => sync_job(cache, &mut req),
    };
    if let Err(e) = res {
        req.status = ReqStatus::Error;
        req.error = Some(e);
        error!("request {} failed: {}", req.id, e);
        return Err(e);
    }
    let target = match req.status {
        ReqStatus::BufferComplete => Some(PipeList::BufComp),
        ReqStatus::Complete => Some(PipeList::Comp),
        _ => None,
    };
    drop(req);
    if let Some(t) = target {
        let mut lists = cache.requests.lists.lock();
        if lists.on_list(id) != t {
            lists.remove(id);
            lists.push_tail(t, id);
        }
    }
    Ok(())
}

/// Claim one unprocessed request from the prepare list and advance it.
/// Returns the claimed request id, if any.
pub(crate) fn do_jobs(cache: &Cache) -> Result<Option<u32>, CacheError> {
    let claimed = cache.requests.lists.lock().claim_next_prepared();
    let Some(id) = claimed else {
        return Ok(None);
    };
    let res = do_a_job(cache, id);
    cache.requests.lists.lock().unclaim(id);
    res.map(|_| Some(id))
}

fn read_job(cache: &Cache, req: &mut CacheRequest) -> Result<(), CacheError> {
    let inode = req.inode.clone().ok_or(CacheError::JobDo)?;
    let mut ino = inode.state.lock();
    let mut stack = cache.stack.lock();
    trace!("read job {}: {} slot(s)", req.id, req.slots.len());

    for k in 0..req.slots.len() {
        if req.slots[k].ready {
            continue;
        }
        revalidate_slot(cache, req, k, &inode, &stack);
        let id = match req.slots[k].ext {
            Some(id) => id,
            None => {
                let index = req.slots[k].foff >> cache.ext_log2;
                match lookup_live(&inode, &mut ino, &stack, index) {
                    Some(id) => {
                        stack.hit_cache_item(req.policy, id);
                        req.slots[k].ext = Some(id);
                        id
                    }
                    None => {
                        let Some(id) =
                            allocate_extent(cache, &inode, &mut ino, &mut stack, req.policy)?
                        else {
                            // pool exhausted by live references; retry later
                            continue;
                        };
                        bind_extent(&mut stack, &inode, id, index);
                        let foff = req.slots[k].foff;
                        issue_extent_read(cache, req, &mut stack, id, foff)?;
                        state::first_read_access(&mut stack, id);
                        publish(&mut ino, &mut stack, req.policy, id, index);
                        req.slots[k].ext = Some(id);
                        // the freshly issued read is probed on the next entry
                        continue;
                    }
                }
            }
        };
        if duplicate_granted(req, k, id) {
            req.slots[k].ready = true;
            continue;
        }
        match state::read_access(&mut stack, &*cache.storage, id)? {
            Access::Ready => grant_read(&mut stack, req, k, id),
            Access::NotReady => {}
        }
    }

    drop(stack);
    drop(ino);
    finish_rw_status(req);
    Ok(())
}

fn write_job(cache: &Cache, req: &mut CacheRequest) -> Result<(), CacheError> {
    let inode = req.inode.clone().ok_or(CacheError::JobDo)?;
    let mut ino = inode.state.lock();
    let mut stack = cache.stack.lock();
    trace!("write job {}: {} slot(s)", req.id, req.slots.len());

    for k in 0..req.slots.len() {
        if req.slots[k].ready {
            continue;
        }
        revalidate_slot(cache, req, k, &inode, &stack);
        let id = match req.slots[k].ext {
            Some(id) => id,
            None => {
                let index = req.slots[k].foff >> cache.ext_log2;
                match lookup_live(&inode, &mut ino, &stack, index) {
                    Some(id) => {
                        stack.hit_cache_item(req.policy, id);
                        req.slots[k].ext = Some(id);
                        id
                    }
                    None => {
                        let Some(id) =
                            allocate_extent(cache, &inode, &mut ino, &mut stack, req.policy)?
                        else {
                            continue;
                        };
                        bind_extent(&mut stack, &inode, id, index);
                        let whole =
                            req.slots[k].buf_off == 0 && req.slots[k].len == cache.extent_size;
                        if whole {
                            state::first_write_access(&mut stack, id);
                            publish(&mut ino, &mut stack, req.policy, id, index);
                            req.slots[k].ext = Some(id);
                            grant_write(&mut stack, req, k, id);
                        } else {
                            // A partial write that creates the extent must
                            // read the surrounding bytes first.
                            let foff = req.slots[k].foff;
                            let op = issue_extent_read(cache, req, &mut stack, id, foff)?;
                            state::mark_rmw(&mut stack, id, op);
                            publish(&mut ino, &mut stack, req.policy, id, index);
                            req.slots[k].ext = Some(id);
                        }
                        continue;
                    }
                }
            }
        };
        if duplicate_granted(req, k, id) {
            req.slots[k].ready = true;
            continue;
        }
        match state::write_access(&mut stack, &*cache.storage, id)? {
            Access::Ready => grant_write(&mut stack, req, k, id),
            Access::NotReady => {}
        }
    }

    drop(stack);
    drop(ino);
    finish_rw_status(req);
    Ok(())
}

fn bufread_job(cache: &Cache, req: &mut CacheRequest) -> Result<(), CacheError> {
    read_job(cache, req)?;
    if req.status != ReqStatus::BufferComplete {
        return Ok(());
    }
    let usr = req.usrbuf.ok_or(CacheError::JobDo)?;

    // copy cache bytes out to the caller buffer, region order
    let mut copied: u64 = 0;
    for slot in &req.slots {
        if copied >= usr.len {
            break;
        }
        let id = slot.ext.ok_or(CacheError::JobDo)?;
        let n = slot.len.min(usr.len - copied);
        unsafe {
            std::ptr::copy_nonoverlapping(
                cache
                    .slab
                    .extent_addr(id.idx())
                    .as_ptr()
                    .add(slot.buf_off as usize),
                usr.addr.add(copied as usize),
                n as usize,
            );
        }
        copied += n;
    }
    req.written = copied;
    trace!("request {}: copied {} byte(s)", req.id, req.written);

    extent_done_access(cache, req, true)?;
    req.status = ReqStatus::Complete;
    Ok(())
}

fn bufwrite_job(cache: &Cache, req: &mut CacheRequest) -> Result<(), CacheError> {
    write_job(cache, req)?;
    if req.status != ReqStatus::BufferComplete {
        return Ok(());
    }
    let usr = req.usrbuf.ok_or(CacheError::JobDo)?;

    // copy caller bytes into the granted extent pieces
    let mut copied: u64 = 0;
    for slot in &req.slots {
        if copied >= usr.len {
            break;
        }
        let id = slot.ext.ok_or(CacheError::JobDo)?;
        let n = slot.len.min(usr.len - copied);
        unsafe {
            std::ptr::copy_nonoverlapping(
                usr.addr.add(copied as usize),
                cache
                    .slab
                    .extent_addr(id.idx())
                    .as_ptr()
                    .add(slot.buf_off as usize),
                n as usize,
            );
        }
        copied += n;
    }
    req.written = copied;
    trace!("request {}: copied {} byte(s)", req.id, req.written);

    extent_done_access(cache, req, true)?;
    req.status = ReqStatus::Complete;
    Ok(())
}

fn query_job(cache: &Cache, req: &mut CacheRequest) -> Result<(), CacheError> {
    let stack = cache.stack.lock();
    req.info = Some(CacheInfo {
        total_size: (stack.extent_count() as u64) * cache.extent_size,
        free_size: stack.nr_free() * cache.extent_size,
        extent_size: cache.extent_size,
        nr_free: stack.nr_free(),
        nr_active: stack.nr_active(),
        nr_inactive: stack.nr_inactive(),
        nr_dirty: stack.nr_dirty,
        nr_writeback: stack.nr_writeback,
    });
    req.status = ReqStatus::Complete;
    Ok(())
}

fn demote_job(cache: &Cache, req: &mut CacheRequest) -> Result<(), CacheError> {
    let Some(inode) = req.inode.clone() else {
        // object never cached; nothing to age
        req.status = ReqStatus::Complete;
        return Ok(());
    };
    let _ino = inode.state.lock();
    let mut stack = cache.stack.lock();

    // age this object's idle clean extents off the active list
    let mut victims = Vec::new();
    let mut cur = stack.active.head;
    while let Some(id) = cur {
        let e = stack.ext(id);
        cur = e.lru_next;
        if e.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, &inode))
            && e.flags.contains(ExtentFlags::CLEAN)
            && !e.referenced()
            && !e.io_pending()
        {
            victims.push(id);
        }
    }
    trace!("demote job {}: {} extent(s)", req.id, victims.len());
    for id in victims {
        stack.demote_cache_item(req.policy, id);
    }
    req.status = ReqStatus::Complete;
    Ok(())
}

fn sync_job(cache: &Cache, req: &mut CacheRequest) -> Result<(), CacheError> {
    if req.sync_all {
        for inode in cache.inodes.all() {
            let mut ino = inode.state.lock();
            let mut stack = cache.stack.lock();
            state::data_sync(
                &inode,
                &mut ino,
                &mut stack,
                &*cache.storage,
                &cache.slab,
                cache.extent_size,
            )?;
        }
    } else if let Some(inode) = req.inode.clone() {
        let mut ino = inode.state.lock();
        let mut stack = cache.stack.lock();
        state::data_sync(
            &inode,
            &mut ino,
            &mut stack,
            &*cache.storage,
            &cache.slab,
            cache.extent_size,
        )?;
    }
    req.status = ReqStatus::Complete;
    Ok(())
}

/// Release every reference a request holds, transitioning its extents per
/// the communication-completion rules. A successful write release dirties
/// its extents and may trigger write-back per the sync policy; an aborted
/// one acknowledges the references without the dirty transition and drops
/// extents whose buffers never received backed content.
pub(crate) fn extent_done_access(
    cache: &Cache,
    req: &mut CacheRequest,
    success: bool,
) -> Result<(), CacheError> {
    let Some(inode) = req.inode.clone() else {
        return Ok(());
    };
    let mut ino = inode.state.lock();
    let mut stack = cache.stack.lock();

    match req.optype {
        OpKind::Read | OpKind::BufRead => {
            for k in 0..req.slots.len() {
                if req.slots[k].ready && req.slots[k].rref > 0 {
                    if let Some(id) = req.slots[k].ext {
                        state::read_comm_done(&mut stack, id);
                    }
                    req.slots[k].rref = 0;
                }
            }
        }
        OpKind::Write | OpKind::BufWrite => {
            let mut newly_dirty = 0u32;
            for k in 0..req.slots.len() {
                if req.slots[k].ready && req.slots[k].wref > 0 {
                    if let Some(id) = req.slots[k].ext {
                        if success {
                            let was_dirty = stack.ext(id).flags.contains(ExtentFlags::DIRTY);
                            state::write_comm_done(&mut stack, id);
                            if !was_dirty {
                                ino.dirty.push(id);
                                newly_dirty += 1;
                            }
                        } else if !state::write_comm_abort(&mut stack, id)
                            && !stack.ext(id).referenced()
                        {
                            // never filled; drop it from the cache
                            stack.remove_cache_item(req.policy, id);
                            stack.release(id);
                        }
                    }
                    req.slots[k].wref = 0;
                }
            }
            ino.nr_dirty += newly_dirty;
            stack.nr_dirty += u64::from(newly_dirty);

            let flush = success
                && match cache.sync_policy {
                    SyncPolicy::Aggressive => true,
                    SyncPolicy::Lazy { dirty_threshold } => stack.nr_dirty > dirty_threshold,
                };
            if flush {
                state::data_sync(
                    &inode,
                    &mut ino,
                    &mut stack,
                    &*cache.storage,
                    &cache.slab,
                    cache.extent_size,
                )?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// An ungranted slot holds no reference, so eviction may have recycled its
/// extent between engine entries; drop the binding if it no longer matches.
fn revalidate_slot(
    cache: &Cache,
    req: &mut CacheRequest,
    k: usize,
    inode: &Arc<Inode>,
    stack: &CacheStack,
) {
    let Some(id) = req.slots[k].ext else { return };
    let index = req.slots[k].foff >> cache.ext_log2;
    let e = stack.ext(id);
    let live = e.index == index
        && e.flags.contains(ExtentFlags::LRU)
        && e.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, inode));
    if !live {
        trace!("request {} slot {}: extent recycled, rebinding", req.id, k);
        req.slots[k].ext = None;
    }
}

/// Look up a live cached extent; reap a stale radix entry left behind by
/// eviction.
fn lookup_live(
    inode: &Arc<Inode>,
    ino: &mut InodeState,
    stack: &CacheStack,
    index: u64,
) -> Option<ExtentId> {
    let cached = ino.tree.lookup(index).copied()?;
    let e = stack.ext(cached.ext);
    let live = e.index == index
        && e.flags.contains(ExtentFlags::LRU)
        && e.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, inode));
    if live {
        Some(cached.ext)
    } else {
        ino.tree.delete(index);
        ino.nrpages -= 1;
        None
    }
}

/// Pop a free extent, shrinking under pressure. A cache full of the caller's
/// own dirty data is written back (the caller holds that inode's lock) and
/// shrunk again. `Ok(None)` means the pool is exhausted by live references;
/// the slot stays unready and retries on the next engine entry.
fn allocate_extent(
    cache: &Cache,
    inode: &Arc<Inode>,
    ino: &mut InodeState,
    stack: &mut CacheStack,
    policy: CachePolicy,
) -> Result<Option<ExtentId>, CacheError> {
    if let Some(id) = stack.alloc() {
        return Ok(Some(id));
    }
    stack.shrink_cache(policy, &*cache.storage, SHRINK_STEP)?;
    if let Some(id) = stack.alloc() {
        return Ok(Some(id));
    }
    state::data_sync(
        inode,
        ino,
        stack,
        &*cache.storage,
        &cache.slab,
        cache.extent_size,
    )?;
    stack.shrink_cache(policy, &*cache.storage, SHRINK_STEP)?;
    Ok(stack.alloc())
}

fn bind_extent(stack: &mut CacheStack, inode: &Arc<Inode>, id: ExtentId, index: u64) {
    let e = stack.ext_mut(id);
    e.index = index;
    e.owner = Some(Arc::clone(inode));
}

/// Issue the storage read covering the whole extent at `foff`. On submit
/// failure the unbound extent goes straight back to the free pool.
fn issue_extent_read(
    cache: &Cache,
    req: &CacheRequest,
    stack: &mut CacheStack,
    id: ExtentId,
    foff: u64,
) -> Result<crate::storage::OpId, CacheError> {
    let mem = MemRegion {
        addr: cache.slab.extent_addr(id.idx()),
        len: cache.extent_size,
    };
    match cache
        .storage
        .submit_read_at(req.collection, req.handle, req.context, mem, foff, 0)
    {
        Ok(op) => {
            let e = stack.ext_mut(id);
            e.io_req = Some(op);
            e.io_chain_next = id;
            trace!("extent {:?}: read at {} as {}", id, foff, op);
            Ok(op)
        }
        Err(e) => {
            stack.release(id);
            error!("extent read submission failed ({})", e.0);
            Err(CacheError::Cache(e.0))
        }
    }
}

fn publish(
    ino: &mut InodeState,
    stack: &mut CacheStack,
    policy: CachePolicy,
    id: ExtentId,
    index: u64,
) {
    let clash = ino.tree.insert(index, CachedExtent { index, ext: id });
    debug_assert!(clash.is_none());
    ino.nrpages += 1;
    debug_assert_eq!(ino.tree.len() as u64, ino.nrpages);
    stack.add_cache_item(policy, id);
}

/// True when an earlier slot of this request already holds the grant on the
/// same extent; duplicates share it without another reference.
fn duplicate_granted(req: &CacheRequest, k: usize, id: ExtentId) -> bool {
    req.slots[..k].iter().any(|s| s.ext == Some(id) && s.ready)
}

fn grant_read(stack: &mut CacheStack, req: &mut CacheRequest, k: usize, id: ExtentId) {
    let holds = req
        .slots
        .iter()
        .any(|s| s.ext == Some(id) && (s.rref > 0 || s.wref > 0));
    if !holds {
        stack.ext_mut(id).read_refs += 1;
        req.slots[k].rref = 1;
    }
    req.slots[k].ready = true;
}

fn grant_write(stack: &mut CacheStack, req: &mut CacheRequest, k: usize, id: ExtentId) {
    let holds = req
        .slots
        .iter()
        .any(|s| s.ext == Some(id) && (s.rref > 0 || s.wref > 0));
    if !holds {
        stack.ext_mut(id).write_refs += 1;
        req.slots[k].wref = 1;
    }
    req.slots[k].ready = true;
}

/// Settle the request status from its slot flags: all ready is
/// buffer-complete, none is submitted, otherwise partial.
fn finish_rw_status(req: &mut CacheRequest) {
    let ready = req.ready_count();
    req.status = if ready == req.slots.len() {
        ReqStatus::BufferComplete
    } else if ready == 0 {
        ReqStatus::Submitted
    } else {
        ReqStatus::PartialProcess
    };
}
