//! Sharded flow table
//!
//! Flows are grouped into shards by the set of layers their id carries, so
//! all flows in a shard share a key layout. Each shard keeps a hash index
//! for lookup and an insertion-ordered list the worker walks. A single
//! mutex per shard covers both, plus the counters of every flow in it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};

use super::counters::{CounterRegistry, FlowStats};
use super::flowid::{FlowDirection, FlowIdBuilder, FlowIdFlags, FlowIdView, FlowKey};

/// One tracked flow
#[derive(Debug, Clone)]
pub struct Flow {
    key: FlowKey,
    /// First packet seen
    pub created: DateTime<Utc>,
    /// Last packet seen
    pub last_seen: DateTime<Utc>,
    alive: bool,
    /// Index 0 counts packets in the creating direction
    stats: [FlowStats; 2],
}

impl Flow {
    fn new(key: FlowKey, now: DateTime<Utc>, sizes: (usize, usize, usize)) -> Self {
        Self {
            key,
            created: now,
            last_seen: now,
            alive: true,
            stats: [FlowStats::with_sizes(sizes), FlowStats::with_sizes(sizes)],
        }
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Counters for packets sent by the flow's initiator
    pub fn source_stats(&self) -> &FlowStats {
        &self.stats[0]
    }

    /// Counters for packets sent towards the initiator
    pub fn dest_stats(&self) -> &FlowStats {
        &self.stats[1]
    }

    pub(crate) fn kill(&mut self) {
        self.alive = false;
    }
}

/// Mutable view of a flow's counters for one direction
///
/// Only obtainable through a locked shard, which is what makes counter
/// updates safe against the worker.
pub struct FlowRef<'a> {
    flow: &'a mut Flow,
    reversed: bool,
}

impl<'a> FlowRef<'a> {
    pub fn flow(&self) -> &Flow {
        self.flow
    }

    pub fn is_reversed(&self) -> bool {
        self.reversed
    }

    pub fn stats_mut(&mut self) -> &mut FlowStats {
        &mut self.flow.stats[usize::from(self.reversed)]
    }
}

/// What the scan callback wants done with a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAction {
    Keep,
    Remove,
}

struct Slot {
    flow: Flow,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly linked list over a slot arena
///
/// Unlinked slots go on a free list and are overwritten on reuse.
#[derive(Default)]
struct FlowList {
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl FlowList {
    fn push_back(&mut self, flow: Flow) -> usize {
        let slot = Slot {
            flow,
            prev: self.tail,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };
        match self.tail {
            Some(tail) => self.slots[tail].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
        idx
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.slots[idx].prev = None;
        self.slots[idx].next = None;
        self.free.push(idx);
        self.len -= 1;
    }

    fn is_live(&self, idx: usize) -> bool {
        self.slots.get(idx).is_some_and(|s| s.flow.alive)
    }
}

#[derive(Default)]
struct ShardInner {
    index: HashMap<Box<[u8]>, usize>,
    list: FlowList,
}

/// Flows sharing one layer combination
pub struct FlowShard {
    flags: FlowIdFlags,
    inner: Mutex<ShardInner>,
    counters: Arc<CounterRegistry>,
}

impl FlowShard {
    fn new(flags: FlowIdFlags, counters: Arc<CounterRegistry>) -> Self {
        Self {
            flags,
            inner: Mutex::new(ShardInner::default()),
            counters,
        }
    }

    pub fn flags(&self) -> FlowIdFlags {
        self.flags
    }

    pub fn lock(&self) -> ShardGuard<'_> {
        ShardGuard {
            inner: self.inner.lock(),
            counters: &self.counters,
        }
    }
}

/// Exclusive access to a shard
pub struct ShardGuard<'a> {
    inner: MutexGuard<'a, ShardInner>,
    counters: &'a CounterRegistry,
}

impl<'a> ShardGuard<'a> {
    /// Find the flow for `id`, creating it when absent or dead
    ///
    /// The returned view points at the stat block matching the packet's
    /// direction relative to the packet that created the flow.
    pub fn get_or_create(&mut self, id: &FlowIdBuilder, now: DateTime<Utc>) -> FlowRef<'_> {
        let inner = &mut *self.inner;

        let live = inner
            .index
            .get(id.bytes())
            .copied()
            .filter(|&idx| inner.list.is_live(idx));

        let idx = match live {
            Some(idx) => idx,
            None => {
                if let Some(stale) = inner.index.remove(id.bytes()) {
                    inner.list.unlink(stale);
                }
                let flow = Flow::new(id.to_key(), now, self.counters.sizes());
                let idx = inner.list.push_back(flow);
                inner.index.insert(id.bytes().into(), idx);
                idx
            }
        };

        let flow = &mut inner.list.slots[idx].flow;
        flow.last_seen = now;
        let reversed = id.direction() != flow.key.direction()
            && id.direction() != FlowDirection::Unset
            && flow.key.direction() != FlowDirection::Unset;
        FlowRef { flow, reversed }
    }

    /// Walk all flows oldest first; flows the callback marks for removal
    /// are killed, unlinked and dropped from the index.
    pub fn scan<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut Flow) -> ScanAction,
    {
        let inner = &mut *self.inner;
        let mut cursor = inner.list.head;
        while let Some(idx) = cursor {
            cursor = inner.list.slots[idx].next;
            if f(&mut inner.list.slots[idx].flow) == ScanAction::Remove {
                let flow = &mut inner.list.slots[idx].flow;
                flow.kill();
                inner.index.remove(flow.key.bytes());
                inner.list.unlink(idx);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.list.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All shards, keyed by layer flags
pub struct FlowTable {
    shards: DashMap<FlowIdFlags, Arc<FlowShard>>,
    counters: Arc<CounterRegistry>,
}

impl FlowTable {
    pub fn new(counters: Arc<CounterRegistry>) -> Self {
        Self {
            shards: DashMap::new(),
            counters,
        }
    }

    pub fn counters(&self) -> &Arc<CounterRegistry> {
        &self.counters
    }

    /// Shard for the layer combination of `id`, created on first use
    pub fn shard(&self, id: &FlowIdBuilder) -> Arc<FlowShard> {
        let flags = id.flags();
        if let Some(shard) = self.shards.get(&flags) {
            return Arc::clone(shard.value());
        }
        let entry = self
            .shards
            .entry(flags)
            .or_insert_with(|| Arc::new(FlowShard::new(flags, Arc::clone(&self.counters))));
        Arc::clone(entry.value())
    }

    /// Point-in-time list of shards; new shards created afterwards are
    /// picked up by the next call.
    pub fn shards(&self) -> Vec<Arc<FlowShard>> {
        self.shards.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Number of live flows across all shards
    pub fn len(&self) -> usize {
        self.shards().iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
