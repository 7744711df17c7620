//! In-memory storage and network test doubles.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::Duration;

use ncac::{
    BufferKind, CollectionId, CommBuffer, ContextId, IoStatus, MemRegion, MessageTag,
    NetworkCallback, NetworkEngine, NetworkError, NetworkOpId, NetworkPost, ObjectHandle, OpId,
    PeerAddr, StorageEngine, StorageError, StreamRegion,
};

type Key = (u32, u64);

/// Asynchronous in-memory object store. Data moves at submission; an
/// operation reports completion after a configurable number of probes
/// (zero = the first probe completes it).
pub struct MemStorage {
    objects: Mutex<HashMap<Key, Vec<u8>>>,
    // op id -> probes still returning Pending
    ops: Mutex<HashMap<u64, u32>>,
    next_op: AtomicU64,
    latency: u32,
    reads: AtomicU64,
    list_writes: AtomicU64,
    error_mode: AtomicI32,
    list_offsets: Mutex<Vec<u64>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::with_latency(0)
    }

    pub fn with_latency(latency: u32) -> Self {
        MemStorage {
            objects: Mutex::new(HashMap::new()),
            ops: Mutex::new(HashMap::new()),
            next_op: AtomicU64::new(1),
            latency,
            reads: AtomicU64::new(0),
            list_writes: AtomicU64::new(0),
            error_mode: AtomicI32::new(0),
            list_offsets: Mutex::new(Vec::new()),
        }
    }

    pub fn preload(&self, collection: CollectionId, handle: ObjectHandle, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert((collection.0, handle.0), data.to_vec());
    }

    pub fn object(&self, collection: CollectionId, handle: ObjectHandle) -> Vec<u8> {
        self.objects
            .lock()
            .unwrap()
            .get(&(collection.0, handle.0))
            .cloned()
            .unwrap_or_default()
    }

    /// Read-at submissions so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// List-write submissions so far.
    pub fn list_write_count(&self) -> u64 {
        self.list_writes.load(Ordering::SeqCst)
    }

    /// Stream offsets of every list-write region, in submission order.
    pub fn list_write_offsets(&self) -> Vec<u64> {
        self.list_offsets.lock().unwrap().clone()
    }

    /// Make every probe fail with the given code (0 restores normality).
    pub fn set_error(&self, code: i32) {
        self.error_mode.store(code, Ordering::SeqCst);
    }

    fn new_op(&self) -> OpId {
        let id = self.next_op.fetch_add(1, Ordering::SeqCst);
        self.ops.lock().unwrap().insert(id, self.latency);
        OpId(id)
    }
}

impl StorageEngine for MemStorage {
    fn submit_write_list(
        &self,
        collection: CollectionId,
        handle: ObjectHandle,
        _context: ContextId,
        mem: &[MemRegion],
        stream: &[StreamRegion],
        _flags: u32,
    ) -> Result<OpId, StorageError> {
        assert_eq!(mem.len(), stream.len());
        self.list_writes.fetch_add(1, Ordering::SeqCst);
        self.list_offsets
            .lock()
            .unwrap()
            .extend(stream.iter().map(|s| s.offset));

        let mut objects = self.objects.lock().unwrap();
        let obj = objects.entry((collection.0, handle.0)).or_default();
        for (m, s) in mem.iter().zip(stream) {
            assert_eq!(m.len, s.len);
            let end = s.offset as usize + s.len as usize;
            if obj.len() < end {
                obj.resize(end, 0);
            }
            let bytes =
                unsafe { std::slice::from_raw_parts(m.addr.as_ptr() as *const u8, m.len as usize) };
            obj[s.offset as usize..end].copy_from_slice(bytes);
        }
        drop(objects);
        Ok(self.new_op())
    }

    fn submit_read_at(
        &self,
        collection: CollectionId,
        handle: ObjectHandle,
        _context: ContextId,
        buf: MemRegion,
        offset: u64,
        _flags: u32,
    ) -> Result<OpId, StorageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock().unwrap();
        let obj = objects
            .get(&(collection.0, handle.0))
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let out =
            unsafe { std::slice::from_raw_parts_mut(buf.addr.as_ptr(), buf.len as usize) };
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = obj.get(offset as usize + i).copied().unwrap_or(0);
        }
        drop(objects);
        Ok(self.new_op())
    }

    fn test(&self, op: OpId, _timeout: Duration) -> IoStatus {
        let code = self.error_mode.load(Ordering::SeqCst);
        if code != 0 {
            return IoStatus::Error(code);
        }
        let mut ops = self.ops.lock().unwrap();
        match ops.get_mut(&op.0) {
            Some(polls_left) if *polls_left > 0 => {
                *polls_left -= 1;
                IoStatus::Pending
            }
            Some(_) => IoStatus::Complete,
            None => IoStatus::Error(-22),
        }
    }
}

enum NetKind {
    Send,
    Recv,
}

struct PendingNet {
    kind: NetKind,
    bufs: Vec<(usize, usize)>,
    total: u64,
    callback: NetworkCallback,
}

/// Loopback network double. In immediate mode posts finish inside the call;
/// in manual mode completions are delivered one by one with
/// [`TestNet::deliver_next`].
pub struct TestNet {
    immediate: bool,
    fill: u8,
    pending: Mutex<VecDeque<PendingNet>>,
    sent: Mutex<Vec<Vec<u8>>>,
    fail_code: AtomicI32,
    next_op: AtomicU64,
}

impl TestNet {
    pub fn immediate() -> Self {
        Self::build(true)
    }

    pub fn manual() -> Self {
        Self::build(false)
    }

    fn build(immediate: bool) -> Self {
        TestNet {
            immediate,
            fill: 0xA5,
            pending: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            fail_code: AtomicI32::new(0),
            next_op: AtomicU64::new(1),
        }
    }

    /// Payloads of completed sends, in completion order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Byte written into receive buffers.
    pub fn fill_byte(&self) -> u8 {
        self.fill
    }

    /// Fail the next delivered completion with the given code.
    pub fn fail_next(&self, code: i32) {
        self.fail_code.store(code, Ordering::SeqCst);
    }

    /// Deliver the oldest pending completion. Returns false when none is
    /// queued.
    pub fn deliver_next(&self) -> bool {
        let Some(op) = self.pending.lock().unwrap().pop_front() else {
            return false;
        };
        let code = self.fail_code.swap(0, Ordering::SeqCst);
        if code != 0 {
            (op.callback)(0, code);
            return true;
        }
        self.perform(&op);
        let total = op.total;
        (op.callback)(total, 0);
        true
    }

    fn perform(&self, op: &PendingNet) {
        match op.kind {
            NetKind::Send => {
                let mut payload = Vec::with_capacity(op.total as usize);
                for &(addr, len) in &op.bufs {
                    payload.extend_from_slice(unsafe {
                        std::slice::from_raw_parts(addr as *const u8, len)
                    });
                }
                self.sent.lock().unwrap().push(payload);
            }
            NetKind::Recv => {
                for &(addr, len) in &op.bufs {
                    let out = unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, len) };
                    out.fill(self.fill);
                }
            }
        }
    }

    fn post(
        &self,
        kind: NetKind,
        bufs: &[CommBuffer],
        total: u64,
        callback: NetworkCallback,
    ) -> Result<NetworkPost, NetworkError> {
        assert!(bufs.iter().all(|b| b.ready), "posted vector must be ready");
        let op = PendingNet {
            kind,
            bufs: bufs
                .iter()
                .map(|b| (b.addr as usize, b.len as usize))
                .collect(),
            total,
            callback,
        };
        if self.immediate {
            self.perform(&op);
            Ok(NetworkPost::Immediate(total))
        } else {
            self.pending.lock().unwrap().push_back(op);
            Ok(NetworkPost::Pending(NetworkOpId(
                self.next_op.fetch_add(1, Ordering::SeqCst),
            )))
        }
    }
}

impl NetworkEngine for TestNet {
    fn post_send_list(
        &self,
        _peer: PeerAddr,
        bufs: &[CommBuffer],
        total_size: u64,
        _kind: BufferKind,
        _tag: MessageTag,
        callback: NetworkCallback,
    ) -> Result<NetworkPost, NetworkError> {
        self.post(NetKind::Send, bufs, total_size, callback)
    }

    fn post_recv_list(
        &self,
        _peer: PeerAddr,
        bufs: &[CommBuffer],
        total_size: u64,
        _kind: BufferKind,
        _tag: MessageTag,
        callback: NetworkCallback,
    ) -> Result<NetworkPost, NetworkError> {
        self.post(NetKind::Recv, bufs, total_size, callback)
    }
}

/// Scatter `data` across a reply's communication vector.
pub fn fill_reply(reply: &ncac::CacheReply, data: &[u8]) {
    let mut copied = 0usize;
    for buf in &reply.buffers {
        assert!(buf.ready);
        let n = (buf.len as usize).min(data.len() - copied);
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr().add(copied), buf.addr, n) };
        copied += n;
        if copied == data.len() {
            break;
        }
    }
    assert_eq!(copied, data.len());
}

/// Gather a reply's communication vector into one byte string.
pub fn read_reply(reply: &ncac::CacheReply) -> Vec<u8> {
    let mut out = Vec::new();
    for buf in &reply.buffers {
        assert!(buf.ready);
        out.extend_from_slice(unsafe {
            std::slice::from_raw_parts(buf.addr as *const u8, buf.len as usize)
        });
    }
    out
}
