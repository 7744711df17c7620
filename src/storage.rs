//! Object-storage engine interface.
//!
//! The cache never blocks on storage: it submits asynchronous operations and
//! probes them for completion with a caller-supplied timeout. The engine
//! behind this trait owns durability; the cache only tracks outstanding
//! operation ids.

use std::fmt;
use std::ptr::NonNull;
use std::time::Duration;

use crate::{CollectionId, ContextId, ObjectHandle};

/// Opaque id of one outstanding storage operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(pub u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Result of probing an outstanding operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// The operation has completed.
    Complete,
    /// The operation is still in flight.
    Pending,
    /// The operation failed with an engine error code.
    Error(i32),
}

/// A raw memory region handed to the engine. Addresses point into the cache
/// slab (or a caller buffer) and stay valid until the operation completes.
#[derive(Debug, Clone, Copy)]
pub struct MemRegion {
    /// Start of the region.
    pub addr: NonNull<u8>,
    /// Region length in bytes.
    pub len: u64,
}

// Regions reference the pool slab, which outlives every submitted operation;
// the extent state machine serialises writers over each slice.
unsafe impl Send for MemRegion {}
unsafe impl Sync for MemRegion {}

/// A byte range within the object's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRegion {
    /// Offset within the object.
    pub offset: u64,
    /// Range length in bytes.
    pub len: u64,
}

/// Engine-side failure on submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageError(pub i32);

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage submission failed ({})", self.0)
    }
}

impl std::error::Error for StorageError {}

/// Asynchronous byte-stream interface of the object-storage engine.
///
/// Submissions return an opaque [`OpId`]; `test` reports completion without
/// blocking beyond the given timeout. One operation may cover several
/// extents (list I/O); the cache chains those extents to the single id.
pub trait StorageEngine: Send + Sync {
    /// Submit a list write of `mem[i] -> stream[i]` pairs.
    fn submit_write_list(
        &self,
        collection: CollectionId,
        handle: ObjectHandle,
        context: ContextId,
        mem: &[MemRegion],
        stream: &[StreamRegion],
        flags: u32,
    ) -> Result<OpId, StorageError>;

    /// Submit a read of `buf.len` bytes at `offset` into `buf`.
    fn submit_read_at(
        &self,
        collection: CollectionId,
        handle: ObjectHandle,
        context: ContextId,
        buf: MemRegion,
        offset: u64,
        flags: u32,
    ) -> Result<OpId, StorageError>;

    /// Probe an operation for completion.
    fn test(&self, op: OpId, timeout: Duration) -> IoStatus;
}

/// Default probe timeout used by internal completion checks.
pub(crate) const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_millis(10);
