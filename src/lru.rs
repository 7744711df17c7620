//! LRU cache policy.
//!
//! Fresh extents enter at the head of the active list; shrink scans from the
//! tail, probing outstanding storage ops and discarding clean, unreferenced
//! extents into the free pool. The inactive list receives demoted extents
//! and read-touching one promotes it back to the active head.

use log::{error, trace};

use crate::error::CacheError;
use crate::extent::{ExtentFlags, ExtentId};
use crate::stack::CacheStack;
use crate::state;
use crate::storage::StorageEngine;

fn unlink(stack: &mut CacheStack, id: ExtentId) {
    let e = stack.ext(id);
    let (prev, next) = (e.lru_prev, e.lru_next);
    let active = e.flags.contains(ExtentFlags::ACTIVE);
    match prev {
        Some(p) => stack.ext_mut(p).lru_next = next,
        None => {
            if active {
                stack.active.head = next;
            } else {
                stack.inactive.head = next;
            }
        }
    }
    match next {
        Some(n) => stack.ext_mut(n).lru_prev = prev,
        None => {
            if active {
                stack.active.tail = prev;
            } else {
                stack.inactive.tail = prev;
            }
        }
    }
    if active {
        stack.active.len -= 1;
    } else {
        stack.inactive.len -= 1;
    }
    let e = stack.ext_mut(id);
    e.lru_prev = None;
    e.lru_next = None;
}

fn push_active_head(stack: &mut CacheStack, id: ExtentId) {
    let old = stack.active.head;
    stack.active.head = Some(id);
    match old {
        Some(o) => stack.ext_mut(o).lru_prev = Some(id),
        None => stack.active.tail = Some(id),
    }
    let e = stack.ext_mut(id);
    e.lru_prev = None;
    e.lru_next = old;
    e.flags.insert(ExtentFlags::LRU | ExtentFlags::ACTIVE);
    stack.active.len += 1;
}

fn push_inactive_tail(stack: &mut CacheStack, id: ExtentId) {
    let old = stack.inactive.tail;
    stack.inactive.tail = Some(id);
    match old {
        Some(o) => stack.ext_mut(o).lru_next = Some(id),
        None => stack.inactive.head = Some(id),
    }
    let e = stack.ext_mut(id);
    e.lru_next = None;
    e.lru_prev = old;
    e.flags.insert(ExtentFlags::LRU);
    e.flags.remove(ExtentFlags::ACTIVE);
    stack.inactive.len += 1;
}

/// Insert a freshly published extent at the active head.
pub(crate) fn add_cache_item(stack: &mut CacheStack, id: ExtentId) {
    push_active_head(stack, id);
}

/// Take an extent off whichever LRU list holds it.
pub(crate) fn remove_cache_item(stack: &mut CacheStack, id: ExtentId) {
    unlink(stack, id);
    let e = stack.ext_mut(id);
    e.flags
        .remove(ExtentFlags::LRU | ExtentFlags::ACTIVE | ExtentFlags::REFERENCED);
}

/// Cache hit: reposition at the active head.
pub(crate) fn hit_cache_item(stack: &mut CacheStack, id: ExtentId) {
    unlink(stack, id);
    push_active_head(stack, id);
}

/// Promote an inactive extent on read-touch.
pub(crate) fn move_inactive_to_active(stack: &mut CacheStack, id: ExtentId) {
    debug_assert!(!stack.ext(id).flags.contains(ExtentFlags::ACTIVE));
    unlink(stack, id);
    push_active_head(stack, id);
}

/// Age an extent to the inactive tail (demotion hint).
pub(crate) fn demote_cache_item(stack: &mut CacheStack, id: ExtentId) {
    unlink(stack, id);
    push_inactive_tail(stack, id);
}

/// Shrink the cache by discarding up to `expected` extents from the active
/// tail. Pending storage ops are probed, never waited on. Returns the number
/// of extents actually freed.
pub(crate) fn shrink(
    stack: &mut CacheStack,
    storage: &dyn StorageEngine,
    expected: u32,
) -> Result<u32, CacheError> {
    let mut shrinked = 0;
    let mut cursor = stack.active.tail;

    while shrinked < expected {
        let Some(victim) = cursor else { break };
        if !stack.ext(victim).flags.contains(ExtentFlags::LRU) {
            error!("shrink: extent {:?} on the active list without LRU flag", victim);
            return Err(CacheError::InvalFlags);
        }
        cursor = stack.ext(victim).lru_prev;

        if stack
            .ext(victim)
            .flags
            .intersects(ExtentFlags::READ_PENDING | ExtentFlags::WRITE_PENDING)
        {
            state::probe_io(stack, storage, victim)?;
        }

        if stack.is_discardable(victim) {
            trace!("shrink: discarding extent {:?} index {}", victim, stack.ext(victim).index);
            remove_cache_item(stack, victim);
            stack.release(victim);
            shrinked += 1;
        }
    }
    Ok(shrinked)
}
