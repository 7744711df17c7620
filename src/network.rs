//! Network engine interface.
//!
//! A message-oriented byte transport with list-vector posts, consumed by the
//! flow pipeline. Posting either completes immediately (the engine reports
//! the transferred size in the return value and never runs the callback) or
//! stays pending, in which case the engine invokes the callback exactly once
//! from its own completion context.

use std::fmt;

use crate::CommBuffer;

/// Opaque network peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serializable", derive(serde::Serialize, serde::Deserialize))]
pub struct PeerAddr(pub u64);

/// Message tag matching sends to receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serializable", derive(serde::Serialize, serde::Deserialize))]
pub struct MessageTag(pub u64);

/// Opaque id of one pending network operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkOpId(pub u64);

/// How the posted buffers were allocated, for engines that distinguish
/// pre-registered memory from ephemeral memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Buffers from a region registered with the engine up front (the cache
    /// slab).
    PreRegistered,
    /// Buffers owned by the caller for this operation only.
    Ephemeral,
}

/// Engine-side failure on post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkError(pub i32);

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "network post failed ({})", self.0)
    }
}

impl std::error::Error for NetworkError {}

/// Outcome of posting a list operation.
#[derive(Debug)]
pub enum NetworkPost {
    /// The transfer finished inside the post call; the callback was not and
    /// will not be invoked.
    Immediate(u64),
    /// The transfer is in flight; the callback fires on completion.
    Pending(NetworkOpId),
}

/// Completion callback: `(actual_size, error_code)`, error 0 for success.
pub type NetworkCallback = Box<dyn FnOnce(u64, i32) + Send>;

/// Message-oriented transport with scatter/gather posts.
pub trait NetworkEngine: Send + Sync {
    /// Post a vectored send of `bufs` to `peer`.
    fn post_send_list(
        &self,
        peer: PeerAddr,
        bufs: &[CommBuffer],
        total_size: u64,
        kind: BufferKind,
        tag: MessageTag,
        callback: NetworkCallback,
    ) -> Result<NetworkPost, NetworkError>;

    /// Post a vectored receive from `peer` into `bufs`.
    fn post_recv_list(
        &self,
        peer: PeerAddr,
        bufs: &[CommBuffer],
        total_size: u64,
        kind: BufferKind,
        tag: MessageTag,
        callback: NetworkCallback,
    ) -> Result<NetworkPost, NetworkError>;
}
