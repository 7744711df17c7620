//! Flow pipeline.
//!
//! A flow is one logical transfer between a network endpoint and a cached
//! object. The descriptor's regions are chopped into pipelined work items of
//! at most [`MAX_REGIONS`] regions and [`ITEM_BYTES`] bytes; each item runs
//! one cache request, and once its buffers are ready the item's vector is
//! posted to the network. Items enter the network strictly in decomposition
//! order, one in flight per flow.
//!
//! The cache offers no completion callbacks, so network completions drive a
//! bounded `test` poll on the next item; a stalled flow can be pumped with
//! [`Flow::progress`].

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::cache::Cache;
use crate::error::CacheError;
use crate::network::{BufferKind, MessageTag, NetworkEngine, NetworkPost, PeerAddr};
use crate::request::RequestHandle;
use crate::{CacheDescriptor, CacheHints, CacheReply, CollectionId, ContextId, FileRegion, ObjectHandle};

/// Regions per work item.
pub const MAX_REGIONS: usize = 16;
/// Byte budget per work item.
pub const ITEM_BYTES: u64 = 256 * 1024;

/// Rounds of front-item polling per progress entry.
const POLL_ROUNDS: usize = 64;

/// One side of a flow.
#[derive(Debug, Clone, Copy)]
pub enum FlowEndpoint {
    /// The network peer.
    Network(PeerAddr),
    /// A cached storage object.
    Cache {
        /// Collection of the object.
        collection: CollectionId,
        /// The object.
        handle: ObjectHandle,
        /// Storage context.
        context: ContextId,
    },
}

/// Describes one flow: endpoints, the file layout to transfer, and bounds.
#[derive(Debug, Clone)]
pub struct FlowDescriptor {
    /// Data source.
    pub source: FlowEndpoint,
    /// Data destination.
    pub dest: FlowEndpoint,
    /// File regions making up the transfer, in order.
    pub regions: Vec<FileRegion>,
    /// Bytes of the region stream to skip before transferring.
    pub file_req_offset: u64,
    /// Transfer size cap; the full region stream when `None`.
    pub aggregate_size: Option<u64>,
    /// Network message tag.
    pub tag: MessageTag,
    /// Cache hints applied to every item.
    pub hints: CacheHints,
}

/// Externally visible flow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Items are still moving.
    Transmitting,
    /// Every item passed through network completion.
    Complete,
    /// The flow aborted; outstanding references were released.
    Error(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    CacheToNet,
    NetToCache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemState {
    Processing,
    Complete,
}

#[derive(Debug)]
struct WorkItem {
    regions: SmallVec<[FileRegion; MAX_REGIONS]>,
    handle: Option<RequestHandle>,
    reply: CacheReply,
    state: ItemState,
}

#[derive(Debug)]
struct FlowData {
    direction: Direction,
    peer: PeerAddr,
    tag: MessageTag,
    items: Vec<Option<WorkItem>>,
    /// Items decomposed but not yet buffer-ready, in order.
    pint_list: VecDeque<usize>,
    /// Buffer-ready items whose network step is in progress.
    done_list: VecDeque<usize>,
    net_in_flight: bool,
    total_transferred: u64,
    state: FlowState,
}

/// A posted flow.
pub struct Flow {
    cache: Arc<Cache>,
    network: Arc<dyn NetworkEngine>,
    me: Weak<Flow>,
    inner: Mutex<FlowData>,
}

impl Flow {
    /// Decompose the descriptor into work items, submit a cache request per
    /// item, and start driving. The flow advances further from network
    /// completions; [`Flow::progress`] pumps it by hand.
    pub fn post(
        desc: &FlowDescriptor,
        cache: Arc<Cache>,
        network: Arc<dyn NetworkEngine>,
    ) -> Result<Arc<Flow>, CacheError> {
        let (direction, peer, collection, handle, context) = match (desc.source, desc.dest) {
            (
                FlowEndpoint::Cache {
                    collection,
                    handle,
                    context,
                },
                FlowEndpoint::Network(peer),
            ) => (Direction::CacheToNet, peer, collection, handle, context),
            (
                FlowEndpoint::Network(peer),
                FlowEndpoint::Cache {
                    collection,
                    handle,
                    context,
                },
            ) => (Direction::NetToCache, peer, collection, handle, context),
            _ => return Err(CacheError::Config("flow endpoints must pair network and cache")),
        };

        let batches = decompose(desc);
        debug!(
            "flow post: {} item(s), tag {}, {:?}",
            batches.len(),
            desc.tag.0,
            direction
        );

        let flow = Arc::new_cyclic(|me| Flow {
            cache,
            network,
            me: me.clone(),
            inner: Mutex::new(FlowData {
                direction,
                peer,
                tag: desc.tag,
                items: Vec::with_capacity(batches.len()),
                pint_list: VecDeque::new(),
                done_list: VecDeque::new(),
                net_in_flight: false,
                total_transferred: 0,
                state: FlowState::Transmitting,
            }),
        });

        {
            let mut data = flow.inner.lock();
            for regions in batches {
                let cache_desc = CacheDescriptor {
                    collection,
                    handle,
                    context,
                    regions: regions.to_vec(),
                    buffer: None,
                    hints: desc.hints,
                };
                let posted = match direction {
                    Direction::CacheToNet => flow.cache.read_post(&cache_desc),
                    Direction::NetToCache => flow.cache.write_post(&cache_desc),
                };
                let posted = match posted {
                    Ok(p) => p,
                    Err(e) => {
                        drop(data);
                        flow.abort(abort_code(e));
                        return Err(e);
                    }
                };
                let idx = data.items.len();
                data.items.push(Some(WorkItem {
                    regions,
                    handle: Some(posted.handle),
                    state: if posted.complete {
                        ItemState::Complete
                    } else {
                        ItemState::Processing
                    },
                    reply: posted.reply,
                }));
                data.pint_list.push_back(idx);
            }
            if data.items.is_empty() {
                data.state = FlowState::Complete;
            }
        }

        flow.progress()?;
        Ok(flow)
    }

    /// Flow state snapshot.
    pub fn state(&self) -> FlowState {
        self.inner.lock().state
    }

    /// Bytes confirmed by the network so far.
    pub fn total_transferred(&self) -> u64 {
        self.inner.lock().total_transferred
    }

    /// Whether every item completed.
    pub fn is_complete(&self) -> bool {
        self.state() == FlowState::Complete
    }

    /// Drive the pipeline: re-test the front work item against the cache
    /// and, once its buffers are ready, post its vector to the network.
    /// Bounded; never waits on storage or the network.
    pub fn progress(&self) -> Result<(), CacheError> {
        for _ in 0..POLL_ROUNDS {
            // decide under the lock, post outside it
            let post = {
                let mut data = self.inner.lock();
                if data.state != FlowState::Transmitting || data.net_in_flight {
                    return Ok(());
                }
                let Some(&front) = data.pint_list.front() else {
                    return Ok(());
                };
                let item = data.items[front]
                    .as_mut()
                    .expect("listed work item must exist");

                if item.state == ItemState::Processing {
                    let handle = item.handle.expect("processing item keeps its handle");
                    match self.cache.test(handle) {
                        Ok((true, reply)) => {
                            item.state = ItemState::Complete;
                            item.reply = reply;
                        }
                        Ok((false, _)) => {}
                        Err(e) => {
                            drop(data);
                            self.abort(abort_code(e));
                            return Err(e);
                        }
                    }
                }

                let item = data.items[front]
                    .as_ref()
                    .expect("listed work item must exist");
                if item.state != ItemState::Complete {
                    // front not buffer-ready; stay in submission order
                    continue;
                }

                data.pint_list.pop_front();
                data.done_list.push_back(front);
                data.net_in_flight = true;
                let item = data.items[front].as_ref().unwrap();
                (
                    front,
                    item.reply.buffers.clone(),
                    item.reply.total_len(),
                    data.peer,
                    data.tag,
                    data.direction,
                )
            };

            let (idx, bufs, total, peer, tag, direction) = post;
            let flow = self.me.upgrade().expect("flow alive during progress");
            let callback: crate::network::NetworkCallback = Box::new(move |actual, err| {
                flow.network_done(idx, actual, err);
            });
            trace!("flow item {}: posting {} byte(s) to the network", idx, total);
            let outcome = match direction {
                Direction::CacheToNet => self.network.post_send_list(
                    peer,
                    &bufs,
                    total,
                    BufferKind::PreRegistered,
                    tag,
                    callback,
                ),
                Direction::NetToCache => self.network.post_recv_list(
                    peer,
                    &bufs,
                    total,
                    BufferKind::PreRegistered,
                    tag,
                    callback,
                ),
            };
            match outcome {
                Ok(NetworkPost::Pending(_)) => return Ok(()),
                Ok(NetworkPost::Immediate(actual)) => {
                    // completion folded into this loop; no callback fires
                    self.complete_item(idx, actual, 0)?;
                }
                Err(e) => {
                    self.abort(e.0);
                    return Err(CacheError::Network(e.0));
                }
            }
        }
        Ok(())
    }

    /// Network completion for one item: account the bytes, release the
    /// cache references, and poll the next item forward.
    fn network_done(&self, idx: usize, actual: u64, err: i32) {
        if let Err(e) = self.complete_item(idx, actual, err) {
            warn!("flow item {}: completion failed: {}", idx, e);
            return;
        }
        if let Err(e) = self.progress() {
            warn!("flow progress failed: {}", e);
        }
    }

    fn complete_item(&self, idx: usize, actual: u64, err: i32) -> Result<(), CacheError> {
        let handle = {
            let mut data = self.inner.lock();
            data.net_in_flight = false;
            if err != 0 {
                drop(data);
                error!("flow item {}: network error {}", idx, err);
                self.abort(err);
                return Ok(());
            }
            data.total_transferred += actual;
            data.done_list.retain(|&i| i != idx);
            if let Some(item) = data.items[idx].as_ref() {
                trace!(
                    "flow item {} done: {} region(s), {} byte(s)",
                    idx,
                    item.regions.len(),
                    actual
                );
            }
            let handle = data.items[idx].as_mut().and_then(|i| i.handle.take());
            data.items[idx] = None;
            if data.pint_list.is_empty() && data.done_list.is_empty() {
                data.state = FlowState::Complete;
                debug!(
                    "flow complete: {} byte(s) transferred",
                    data.total_transferred
                );
            }
            handle
        };
        if let Some(h) = handle {
            self.cache.done(h)?;
        }
        Ok(())
    }

    /// Abort the flow: release references on every work item still
    /// outstanding, without the communication-completed transitions. Cached
    /// extents with valid content stay cached.
    fn abort(&self, code: i32) {
        let handles: Vec<RequestHandle> = {
            let mut data = self.inner.lock();
            if matches!(data.state, FlowState::Error(_)) {
                return;
            }
            data.state = FlowState::Error(code);
            data.pint_list.clear();
            data.done_list.clear();
            data.items
                .iter_mut()
                .filter_map(|slot| slot.as_mut().and_then(|i| i.handle.take()))
                .collect()
        };
        for h in handles {
            if let Err(e) = self.cache.abort(h) {
                warn!("abort: releasing request failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.inner.lock();
        f.debug_struct("Flow")
            .field("state", &data.state)
            .field("total_transferred", &data.total_transferred)
            .field("items", &data.items.len())
            .finish()
    }
}

fn abort_code(e: CacheError) -> i32 {
    match e {
        CacheError::Cache(code) | CacheError::Network(code) => code,
        _ => -1,
    }
}

/// Chop the descriptor's region stream into work-item batches of at most
/// [`MAX_REGIONS`] regions and [`ITEM_BYTES`] bytes, after skipping the
/// request offset and clipping to the aggregate size.
fn decompose(desc: &FlowDescriptor) -> Vec<SmallVec<[FileRegion; MAX_REGIONS]>> {
    let mut skip = desc.file_req_offset;
    let mut budget = desc
        .aggregate_size
        .unwrap_or_else(|| desc.regions.iter().map(|r| r.len).sum());

    let mut batches = Vec::new();
    let mut batch: SmallVec<[FileRegion; MAX_REGIONS]> = SmallVec::new();
    let mut batch_bytes = 0u64;

    for region in &desc.regions {
        let mut region = *region;
        // skip ahead to the flow's file offset
        if skip > 0 {
            if skip >= region.len {
                skip -= region.len;
                continue;
            }
            region.offset += skip;
            region.len -= skip;
            skip = 0;
        }
        if budget == 0 {
            break;
        }
        region.len = region.len.min(budget);
        budget -= region.len;

        // split the region across item byte budgets
        while region.len > 0 {
            if batch.len() == MAX_REGIONS || batch_bytes == ITEM_BYTES {
                batches.push(std::mem::take(&mut batch));
                batch_bytes = 0;
            }
            let take = region.len.min(ITEM_BYTES - batch_bytes);
            batch.push(FileRegion {
                offset: region.offset,
                len: take,
            });
            batch_bytes += take;
            region.offset += take;
            region.len -= take;
        }
    }
    if !batch.is_empty() {
        batches.push(batch);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regions_of(batches: &[SmallVec<[FileRegion; MAX_REGIONS]>]) -> Vec<Vec<(u64, u64)>> {
        batches
            .iter()
            .map(|b| b.iter().map(|r| (r.offset, r.len)).collect())
            .collect()
    }

    fn desc(regions: Vec<FileRegion>, off: u64, agg: Option<u64>) -> FlowDescriptor {
        FlowDescriptor {
            source: FlowEndpoint::Network(PeerAddr(1)),
            dest: FlowEndpoint::Cache {
                collection: CollectionId(1),
                handle: ObjectHandle(1),
                context: ContextId(0),
            },
            regions,
            file_req_offset: off,
            aggregate_size: agg,
            tag: MessageTag(7),
            hints: CacheHints::default(),
        }
    }

    #[test]
    fn contiguous_transfer_splits_by_item_bytes() {
        let d = desc(
            vec![FileRegion {
                offset: 0,
                len: 2 * 1024 * 1024,
            }],
            0,
            None,
        );
        let batches = decompose(&d);
        assert_eq!(batches.len(), 8);
        for (i, b) in batches.iter().enumerate() {
            assert_eq!(b.len(), 1);
            assert_eq!(b[0].offset, i as u64 * ITEM_BYTES);
            assert_eq!(b[0].len, ITEM_BYTES);
        }
    }

    #[test]
    fn offset_and_aggregate_clip_the_stream() {
        let d = desc(
            vec![
                FileRegion { offset: 0, len: 100 },
                FileRegion {
                    offset: 1000,
                    len: 200,
                },
            ],
            150,
            Some(100),
        );
        let batches = decompose(&d);
        assert_eq!(regions_of(&batches), vec![vec![(1050, 100)]]);
    }

    #[test]
    fn region_count_bounds_a_batch() {
        let many: Vec<FileRegion> = (0..20)
            .map(|i| FileRegion {
                offset: i * 4096,
                len: 16,
            })
            .collect();
        let batches = decompose(&desc(many, 0, None));
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), MAX_REGIONS);
        assert_eq!(batches[1].len(), 4);
    }
}
