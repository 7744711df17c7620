//! List-I/O batching.
//!
//! In many places it pays to batch an operation against multiple extents
//! into one storage submission. An aiovec is the multi-extent container used
//! for that; each inode embeds one as scratch space for its write-back.

use smallvec::SmallVec;

use crate::extent::ExtentId;
use crate::storage::{MemRegion, StreamRegion};

/// Batch capacity of one list-I/O submission.
pub(crate) const AIOVEC_SIZE: usize = 6;

#[derive(Debug, Clone, Copy)]
pub(crate) struct AioEntry {
    pub(crate) ext: ExtentId,
    pub(crate) stream: StreamRegion,
    pub(crate) mem: MemRegion,
}

/// A small batch of (extent, stream range, memory range) tuples accumulated
/// for a single list-I/O submission.
#[derive(Debug, Default)]
pub(crate) struct Aiovec {
    entries: SmallVec<[AioEntry; AIOVEC_SIZE]>,
}

impl Aiovec {
    pub(crate) fn new() -> Self {
        Aiovec {
            entries: SmallVec::new(),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn space(&self) -> usize {
        AIOVEC_SIZE - self.entries.len()
    }

    pub(crate) fn reinit(&mut self) {
        self.entries.clear();
    }

    /// Add an extent to the batch. Returns the number of slots still
    /// available.
    pub(crate) fn add(&mut self, ext: ExtentId, stream: StreamRegion, mem: MemRegion) -> usize {
        debug_assert!(self.space() > 0);
        self.entries.push(AioEntry { ext, stream, mem });
        self.space()
    }

    pub(crate) fn entries(&self) -> &[AioEntry] {
        &self.entries
    }

    /// Split the batch into the parallel vectors the storage engine takes.
    pub(crate) fn io_vectors(&self) -> (SmallVec<[MemRegion; AIOVEC_SIZE]>, SmallVec<[StreamRegion; AIOVEC_SIZE]>) {
        let mem = self.entries.iter().map(|e| e.mem).collect();
        let stream = self.entries.iter().map(|e| e.stream).collect();
        (mem, stream)
    }
}
