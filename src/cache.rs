//! The cache runtime.
//!
//! All cache state hangs off one [`Cache`] value built at init: the buffer
//! slab, the extent pool behind the cache-stack lock, the inode table, the
//! request pool, and the storage engine the cache drains to. The public
//! entry points are the post/test/done triple plus sync, demote, query and
//! an explicit progress driver.

use std::fmt;
use std::ptr;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::CacheError;
use crate::inode::InodeTable;
use crate::job;
use crate::request::{CacheRequest, OpKind, PipeList, ReqStatus, RequestHandle, RequestPool};
use crate::slab::BufferSlab;
use crate::stack::CacheStack;
use crate::storage::StorageEngine;
use crate::{
    CacheConfig, CacheDescriptor, CacheInfo, CacheReply, CollectionId, CommBuffer, ObjectHandle,
    SyncDescriptor, SyncPolicy,
};

/// Outcome of posting a request.
#[derive(Debug)]
pub struct Post {
    /// Handle for `test`/`done`.
    pub handle: RequestHandle,
    /// Whether the request already reached buffer-complete.
    pub complete: bool,
    /// Communication-buffer vector; flags show per-slot readiness.
    pub reply: CacheReply,
}

/// The non-blocking extent cache.
pub struct Cache {
    pub(crate) extent_size: u64,
    pub(crate) ext_log2: u32,
    pub(crate) max_index_bits: u32,
    pub(crate) sync_policy: SyncPolicy,
    pub(crate) slab: BufferSlab,
    pub(crate) stack: Mutex<CacheStack>,
    pub(crate) inodes: InodeTable,
    pub(crate) requests: RequestPool,
    pub(crate) storage: Arc<dyn StorageEngine>,
}

impl Cache {
    /// Validate the configuration, pre-allocate the slab, the extent pool
    /// and the request pool, and return the runtime.
    pub fn new(config: CacheConfig, storage: Arc<dyn StorageEngine>) -> Result<Cache, CacheError> {
        if !config.extent_size.is_power_of_two() {
            return Err(CacheError::Config("extent size must be a power of two"));
        }
        if config.cache_size == 0 || config.cache_size % config.extent_size != 0 {
            return Err(CacheError::Config(
                "cache size must be a non-zero multiple of the extent size",
            ));
        }
        if !config.inode_buckets.is_power_of_two() {
            return Err(CacheError::Config("inode bucket count must be a power of two"));
        }
        if config.max_request_count == 0 {
            return Err(CacheError::Config("request pool must not be empty"));
        }
        if config.max_index_bits == 0 || config.max_index_bits > 48 {
            return Err(CacheError::Config("index bits out of range"));
        }

        let slab = BufferSlab::new(config.cache_size, config.extent_size)?;
        let extent_count = slab.extent_count();
        debug!(
            "cache init: {} extents of {} bytes, {} requests",
            extent_count, config.extent_size, config.max_request_count
        );

        Ok(Cache {
            extent_size: config.extent_size as u64,
            ext_log2: config.extent_size.trailing_zeros(),
            max_index_bits: config.max_index_bits,
            sync_policy: config.sync_policy,
            slab,
            stack: Mutex::new(CacheStack::new(extent_count)),
            inodes: InodeTable::new(config.inode_buckets, config.max_index_bits),
            requests: RequestPool::new(config.max_request_count),
            storage,
        })
    }

    /// Extent size in bytes.
    pub fn extent_size(&self) -> u64 {
        self.extent_size
    }

    /// Submit a read. A descriptor with a bounce buffer runs in buffered
    /// mode: the cache copies the bytes out and completes the request
    /// itself.
    pub fn read_post(&self, desc: &CacheDescriptor) -> Result<Post, CacheError> {
        let optype = if desc.buffer.is_some() {
            OpKind::BufRead
        } else {
            OpKind::Read
        };
        let id = self.build_rw_request(desc, optype)?;
        self.submit(id)
    }

    /// Submit a write; symmetric to [`Cache::read_post`].
    pub fn write_post(&self, desc: &CacheDescriptor) -> Result<Post, CacheError> {
        let optype = if desc.buffer.is_some() {
            OpKind::BufWrite
        } else {
            OpKind::Write
        };
        let id = self.build_rw_request(desc, optype)?;
        self.submit(id)
    }

    /// Request write-back of one object's dirty extents, or of everything.
    pub fn sync_post(&self, desc: &SyncDescriptor) -> Result<RequestHandle, CacheError> {
        let id = self.requests.alloc()?;
        {
            let mut req = self.requests.slot(id).lock();
            req.optype = OpKind::Sync;
            req.status = ReqStatus::Submitted;
            match desc.target {
                Some((collection, handle)) => {
                    req.collection = collection;
                    req.handle = handle;
                    req.inode = self.inodes.find(collection, handle);
                    req.sync_all = false;
                }
                None => req.sync_all = true,
            }
        }
        self.enqueue_and_run(id)?;
        Ok(RequestHandle(id))
    }

    /// Age an object's idle clean extents toward eviction.
    pub fn demote_post(
        &self,
        collection: CollectionId,
        handle: ObjectHandle,
    ) -> Result<RequestHandle, CacheError> {
        let id = self.requests.alloc()?;
        {
            let mut req = self.requests.slot(id).lock();
            req.optype = OpKind::Demote;
            req.status = ReqStatus::Submitted;
            req.collection = collection;
            req.handle = handle;
            req.inode = self.inodes.find(collection, handle);
        }
        self.enqueue_and_run(id)?;
        Ok(RequestHandle(id))
    }

    /// Counter snapshot, taken through the regular job pipeline.
    pub fn query_info(&self) -> Result<CacheInfo, CacheError> {
        let id = self.requests.alloc()?;
        {
            let mut req = self.requests.slot(id).lock();
            req.optype = OpKind::Query;
            req.status = ReqStatus::Submitted;
        }
        self.enqueue_and_run(id)?;
        let info = {
            let mut req = self.requests.slot(id).lock();
            req.info.take()
        };
        self.done(RequestHandle(id))?;
        info.ok_or(CacheError::JobDo)
    }

    /// Test whether a request reached buffer-complete, re-entering the
    /// engine to re-probe non-ready slots first.
    pub fn test(&self, handle: RequestHandle) -> Result<(bool, CacheReply), CacheError> {
        if !self.requests.valid(handle) {
            return Err(CacheError::ReqStatus);
        }
        {
            let req = self.requests.slot(handle.0).lock();
            match req.status {
                ReqStatus::Unused => {
                    warn!("test on request {} not in use", handle.0);
                    return Err(CacheError::ReqStatus);
                }
                ReqStatus::Error => return Err(req.error.unwrap_or(CacheError::JobDo)),
                ReqStatus::BufferComplete | ReqStatus::Complete => {
                    let reply = self.build_reply(&req);
                    return Ok((true, reply));
                }
                _ => {}
            }
        }

        job::do_a_job(self, handle.0)?;

        let req = self.requests.slot(handle.0).lock();
        let flag = matches!(
            req.status,
            ReqStatus::BufferComplete | ReqStatus::Complete
        );
        let reply = self.build_reply(&req);
        Ok((flag, reply))
    }

    /// Release every reference a request holds and return it to the pool.
    /// Safe at any point after submission, including on an errored request:
    /// only slots that were granted carry references.
    pub fn done(&self, handle: RequestHandle) -> Result<(), CacheError> {
        self.release(handle, true)
    }

    /// Failure-path variant of [`Cache::done`]: references are released but
    /// the communication is treated as not having happened. Extents whose
    /// buffers already held backed content stay cached; extents granted to a
    /// write that never filled them are dropped.
    pub fn abort(&self, handle: RequestHandle) -> Result<(), CacheError> {
        self.release(handle, false)
    }

    fn release(&self, handle: RequestHandle, success: bool) -> Result<(), CacheError> {
        if !self.requests.valid(handle) {
            return Err(CacheError::ReqStatus);
        }
        let release = {
            let mut req = self.requests.slot(handle.0).lock();
            if req.status == ReqStatus::Unused {
                return Err(CacheError::ReqStatus);
            }
            let release = job::extent_done_access(self, &mut req, success);
            req.recycle();
            release
        };
        self.requests.lists.lock().remove(handle.0);
        self.requests.free(handle.0);
        release
    }

    /// Claim one unprocessed request from the prepare list and advance it.
    /// Returns whether any request was claimed. Drivers that poll instead of
    /// testing individual handles call this.
    pub fn progress(&self) -> Result<bool, CacheError> {
        Ok(job::do_jobs(self)?.is_some())
    }

    fn build_rw_request(
        &self,
        desc: &CacheDescriptor,
        optype: OpKind,
    ) -> Result<u32, CacheError> {
        let id = self.requests.alloc()?;
        let mut req = self.requests.slot(id).lock();
        req.optype = optype;
        req.collection = desc.collection;
        req.handle = desc.handle;
        req.context = desc.context;
        req.policy = desc.hints.policy;
        req.inode = Some(self.inodes.get(desc.collection, desc.handle, desc.context));
        req.usrbuf = desc.buffer;

        if desc.regions.len() == 1 {
            req.pos = desc.regions[0].offset;
            req.size = desc.regions[0].len;
        } else {
            req.segments = desc.regions.clone();
        }

        if let Err(e) = req.prepare_slots(self.extent_size, self.max_index_bits) {
            req.recycle();
            drop(req);
            self.requests.free(id);
            return Err(e);
        }
        req.status = ReqStatus::Submitted;
        Ok(id)
    }

    /// Publish the request on the prepare list and make first progress. A
    /// processing failure at post time drains the request internally, so an
    /// error return leaves nothing for the caller to release.
    fn enqueue_and_run(&self, id: u32) -> Result<(), CacheError> {
        self.requests
            .lists
            .lock()
            .push_tail(PipeList::Prepare, id);
        if let Err(e) = job::do_a_job(self, id) {
            let _ = self.done(RequestHandle(id));
            return Err(e);
        }
        Ok(())
    }

    fn submit(&self, id: u32) -> Result<Post, CacheError> {
        self.enqueue_and_run(id)?;
        let req = self.requests.slot(id).lock();
        let complete = matches!(
            req.status,
            ReqStatus::BufferComplete | ReqStatus::Complete
        );
        let reply = self.build_reply(&req);
        Ok(Post {
            handle: RequestHandle(id),
            complete,
            reply,
        })
    }

    /// Snapshot the communication-buffer vector. Filled once the request has
    /// made any progress; buffer addresses resolve as slots find their
    /// extents.
    fn build_reply(&self, req: &CacheRequest) -> CacheReply {
        match req.status {
            ReqStatus::Submitted | ReqStatus::PartialProcess | ReqStatus::BufferComplete => {}
            _ => return CacheReply::default(),
        }
        let buffers = req
            .slots
            .iter()
            .map(|s| CommBuffer {
                addr: match s.ext {
                    Some(id) => unsafe {
                        self.slab
                            .extent_addr(id.idx())
                            .as_ptr()
                            .add(s.buf_off as usize)
                    },
                    None => ptr::null_mut(),
                },
                len: s.len,
                ready: s.ready,
            })
            .collect();
        CacheReply { buffers }
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("extent_size", &self.extent_size)
            .field("slab", &self.slab)
            .field("requests", &self.requests.len())
            .finish()
    }
}
