//! Internal requests.
//!
//! One in-flight cache operation is an internal request: the bound object,
//! the submitted file regions, and one communication slot per touched extent
//! piece. Requests come from a fixed pool and migrate across three pipeline
//! lists (prepare, buffer-complete, complete) as the engine advances them.
//! A returned request keeps its slot array so repeated similar-sized
//! requests avoid allocation churn.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::CacheError;
use crate::extent::ExtentId;
use crate::inode::Inode;
use crate::{CachePolicy, CollectionId, ContextId, FileRegion, ObjectHandle, UserBuffer};

/// Opaque handle to a posted cache request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub(crate) u32);

/// Operation kind of an internal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Read,
    Write,
    BufRead,
    BufWrite,
    Query,
    Demote,
    Sync,
}

/// Lifecycle status of an internal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReqStatus {
    Unused,
    Submitted,
    PartialProcess,
    BufferComplete,
    Complete,
    Error,
}

/// One entry of the communication-buffer vector: a contiguous piece of one
/// extent.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CommSlot {
    /// Extent-aligned file offset of the extent this slot lives in.
    pub(crate) foff: u64,
    /// Intra-extent byte offset.
    pub(crate) buf_off: u64,
    /// Piece length in bytes.
    pub(crate) len: u64,
    /// Resolved extent, once looked up or allocated.
    pub(crate) ext: Option<ExtentId>,
    /// Communication-ready flag.
    pub(crate) ready: bool,
    /// Read-reference delta this slot holds on its extent.
    pub(crate) rref: u8,
    /// Write-reference delta this slot holds on its extent.
    pub(crate) wref: u8,
}

/// An internal request. Guarded by its pool slot lock.
#[derive(Debug)]
pub(crate) struct CacheRequest {
    pub(crate) id: u32,
    pub(crate) optype: OpKind,
    pub(crate) status: ReqStatus,
    pub(crate) error: Option<CacheError>,

    pub(crate) collection: CollectionId,
    pub(crate) handle: ObjectHandle,
    pub(crate) context: ContextId,
    pub(crate) inode: Option<Arc<Inode>>,
    pub(crate) policy: CachePolicy,

    /// Single-segment shape; `segments` is used instead when non-empty.
    pub(crate) pos: u64,
    pub(crate) size: u64,
    /// Multi-region shape, sorted by file offset at preparation.
    pub(crate) segments: Vec<FileRegion>,

    /// Caller buffer for the buffered operation kinds.
    pub(crate) usrbuf: Option<UserBuffer>,
    pub(crate) written: u64,

    /// Communication slots; capacity is retained across reuse.
    pub(crate) slots: Vec<CommSlot>,

    /// Global sync when set, object sync otherwise.
    pub(crate) sync_all: bool,

    /// Snapshot filled by a query job.
    pub(crate) info: Option<crate::CacheInfo>,
}

impl CacheRequest {
    fn unused(id: u32) -> Self {
        CacheRequest {
            id,
            optype: OpKind::Read,
            status: ReqStatus::Unused,
            error: None,
            collection: CollectionId(0),
            handle: ObjectHandle(0),
            context: ContextId(0),
            inode: None,
            policy: CachePolicy::Lru,
            pos: 0,
            size: 0,
            segments: Vec::new(),
            usrbuf: None,
            written: 0,
            slots: Vec::new(),
            sync_all: false,
            info: None,
        }
    }

    /// Scrub for return to the free pool, keeping the slot array capacity
    /// (lazy free).
    pub(crate) fn recycle(&mut self) {
        self.status = ReqStatus::Unused;
        self.error = None;
        self.inode = None;
        self.usrbuf = None;
        self.written = 0;
        self.pos = 0;
        self.size = 0;
        self.segments.clear();
        self.slots.clear();
        self.sync_all = false;
        self.info = None;
    }

    /// Expand the submitted regions into communication slots.
    ///
    /// Slot `k` covers the intersection of its region with one extent: for
    /// extent size 32768, a read of 32768 bytes from 1024 yields two slots,
    /// `(off 1024, len 31744)` on the first extent and `(off 0, len 1024)`
    /// on the second.
    pub(crate) fn prepare_slots(
        &mut self,
        extent_size: u64,
        max_index_bits: u32,
    ) -> Result<(), CacheError> {
        self.slots.clear();

        if self.segments.is_empty() {
            let (pos, size) = (self.pos, self.size);
            expand_region(&mut self.slots, pos, size, extent_size, max_index_bits)?;
        } else {
            // order regions by file offset for list-I/O friendliness
            self.segments.sort_by_key(|r| r.offset);
            let segments = std::mem::take(&mut self.segments);
            for r in &segments {
                expand_region(&mut self.slots, r.offset, r.len, extent_size, max_index_bits)?;
            }
            self.segments = segments;
        }
        log::trace!("request {}: {} comm slot(s)", self.id, self.slots.len());
        Ok(())
    }

    pub(crate) fn ready_count(&self) -> usize {
        self.slots.iter().filter(|s| s.ready).count()
    }
}

fn expand_region(
    slots: &mut Vec<CommSlot>,
    pos: u64,
    size: u64,
    extent_size: u64,
    max_index_bits: u32,
) -> Result<(), CacheError> {
    if size == 0 {
        return Ok(());
    }
    let end = pos.checked_add(size).ok_or(CacheError::JobPrepare)?;
    let last_index = (end - 1) / extent_size;
    if max_index_bits < 64 && last_index >> max_index_bits != 0 {
        return Err(CacheError::JobPrepare);
    }

    let mut foff = pos - pos % extent_size;
    while foff < end {
        let start = pos.max(foff);
        let stop = end.min(foff + extent_size);
        slots.push(CommSlot {
            foff,
            buf_off: start - foff,
            len: stop - start,
            ext: None,
            ready: false,
            rref: 0,
            wref: 0,
        });
        foff += extent_size;
    }
    Ok(())
}

/// Which pipeline list a request is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipeList {
    None,
    Prepare,
    BufComp,
    Comp,
}

#[derive(Debug, Clone, Copy, Default)]
struct ReqLink {
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
struct ListHead {
    head: Option<u32>,
    tail: Option<u32>,
}

/// Pipeline list state, guarded by the request-list lock.
#[derive(Debug)]
pub(crate) struct ReqLists {
    free: VecDeque<u32>,
    links: Box<[ReqLink]>,
    on: Box<[PipeList]>,
    read_out: Box<[bool]>,
    prepare: ListHead,
    bufcomp: ListHead,
    comp: ListHead,
}

impl ReqLists {
    fn head_mut(&mut self, which: PipeList) -> &mut ListHead {
        match which {
            PipeList::Prepare => &mut self.prepare,
            PipeList::BufComp => &mut self.bufcomp,
            PipeList::Comp => &mut self.comp,
            PipeList::None => unreachable!(),
        }
    }

    pub(crate) fn push_tail(&mut self, which: PipeList, id: u32) {
        debug_assert_eq!(self.on[id as usize], PipeList::None);
        let old_tail = self.head_mut(which).tail;
        match old_tail {
            Some(t) => self.links[t as usize].next = Some(id),
            None => self.head_mut(which).head = Some(id),
        }
        self.head_mut(which).tail = Some(id);
        self.links[id as usize] = ReqLink {
            prev: old_tail,
            next: None,
        };
        self.on[id as usize] = which;
    }

    pub(crate) fn remove(&mut self, id: u32) {
        let which = self.on[id as usize];
        if which == PipeList::None {
            return;
        }
        let ReqLink { prev, next } = self.links[id as usize];
        match prev {
            Some(p) => self.links[p as usize].next = next,
            None => self.head_mut(which).head = next,
        }
        match next {
            Some(n) => self.links[n as usize].prev = prev,
            None => self.head_mut(which).tail = prev,
        }
        self.links[id as usize] = ReqLink::default();
        self.on[id as usize] = PipeList::None;
    }

    pub(crate) fn on_list(&self, id: u32) -> PipeList {
        self.on[id as usize]
    }

    /// Claim the first prepare-list request not already read out by another
    /// driver. The claim marker lets a scanner work an entry without taking
    /// it off the list.
    pub(crate) fn claim_next_prepared(&mut self) -> Option<u32> {
        let mut cur = self.prepare.head;
        while let Some(id) = cur {
            if !self.read_out[id as usize] {
                self.read_out[id as usize] = true;
                return Some(id);
            }
            cur = self.links[id as usize].next;
        }
        None
    }

    pub(crate) fn unclaim(&mut self, id: u32) {
        self.read_out[id as usize] = false;
    }
}

/// Fixed-size request pool: slot bodies behind per-slot locks, list state
/// behind the request-list lock.
#[derive(Debug)]
pub(crate) struct RequestPool {
    slots: Box<[Mutex<CacheRequest>]>,
    pub(crate) lists: Mutex<ReqLists>,
}

impl RequestPool {
    pub(crate) fn new(count: usize) -> Self {
        let slots = (0..count)
            .map(|i| Mutex::new(CacheRequest::unused(i as u32)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        RequestPool {
            slots,
            lists: Mutex::new(ReqLists {
                free: (0..count as u32).collect(),
                links: vec![ReqLink::default(); count].into_boxed_slice(),
                on: vec![PipeList::None; count].into_boxed_slice(),
                read_out: vec![false; count].into_boxed_slice(),
                prepare: ListHead::default(),
                bufcomp: ListHead::default(),
                comp: ListHead::default(),
            }),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Take a request id off the free list, or report pool exhaustion.
    pub(crate) fn alloc(&self) -> Result<u32, CacheError> {
        let mut lists = self.lists.lock();
        let id = lists.free.pop_front().ok_or(CacheError::NoRequest)?;
        lists.read_out[id as usize] = false;
        Ok(id)
    }

    /// Return a request id to the free list. The body must already be
    /// recycled and off every pipeline list.
    pub(crate) fn free(&self, id: u32) {
        let mut lists = self.lists.lock();
        debug_assert_eq!(lists.on[id as usize], PipeList::None);
        lists.free.push_back(id);
    }

    pub(crate) fn slot(&self, id: u32) -> &Mutex<CacheRequest> {
        &self.slots[id as usize]
    }

    pub(crate) fn valid(&self, h: RequestHandle) -> bool {
        (h.0 as usize) < self.slots.len()
    }
}
