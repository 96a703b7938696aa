use std::{collections::VecDeque, fmt, sync::Arc};

use braid_oplog_types::{Checkpoint, OplogMessage};
use braid_primitives::{Clock, IndexHead, WriterKey};
use braid_transport::Oplog;
use bytes::Bytes;
use tracing::trace;

use crate::{Node, Result};

/// Answers whether a given writer position is already part of the
/// committed prefix. Implemented by the system view; used to prune clocks
/// and consume already-indexed dependencies during resolution.
pub trait IndexedLookup: Send + Sync {
    fn is_indexed(&self, key: &WriterKey, length: u64) -> bool;
}

/// Decoded block whose dependencies are not yet satisfied. Partial
/// resolution progress survives across advance ticks.
#[derive(Debug)]
struct PendingNode {
    message: OplogMessage,
    length: u64,
    /// Heads still awaiting resolution; satisfied entries are swap-removed.
    remaining: Vec<IndexHead>,
    dependencies: Vec<Arc<Node>>,
    clock: Clock,
}

/// Cached state of one writer's log: the unindexed tail of nodes, the
/// loaded length, and the candidate `next` node.
pub struct Writer {
    core: Arc<dyn Oplog>,
    key: WriterKey,
    /// Highest writer length absorbed into `nodes`.
    length: u64,
    /// Last linearized length.
    indexed: u64,
    /// Lengths `<= offset` have been dropped from the cache.
    offset: u64,
    nodes: VecDeque<Arc<Node>>,
    next: Option<Arc<Node>>,
    next_cache: Option<PendingNode>,
}

impl Writer {
    pub fn new(core: Arc<dyn Oplog>, indexed: u64) -> Self {
        let key = core.key();
        Self {
            core,
            key,
            length: indexed,
            indexed,
            offset: indexed,
            nodes: VecDeque::new(),
            next: None,
            next_cache: None,
        }
    }

    pub fn key(&self) -> WriterKey {
        self.key
    }

    pub fn core(&self) -> &Arc<dyn Oplog> {
        &self.core
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn indexed(&self) -> u64 {
        self.indexed
    }

    /// Newest cached node.
    pub fn head(&self) -> Option<&Arc<Node>> {
        self.nodes.back()
    }

    /// Drops and returns the oldest cached node.
    pub fn shift(&mut self) -> Option<Arc<Node>> {
        let node = self.nodes.pop_front()?;
        self.offset += 1;
        Some(node)
    }

    /// Node at absolute length `seq`, if still cached.
    pub fn get_cached(&self, seq: u64) -> Option<&Arc<Node>> {
        if seq <= self.offset || seq > self.length {
            return None;
        }
        self.nodes.get((seq - self.offset - 1) as usize)
    }

    /// Truncates the cache back to `len` after a restart from the system
    /// digest and drops any pending candidate.
    pub fn reset(&mut self, len: u64) {
        if len < self.offset {
            self.nodes.clear();
            self.offset = len;
        } else {
            self.nodes.truncate((len - self.offset) as usize);
        }
        self.length = len;
        self.next = None;
        self.next_cache = None;
    }

    /// Records that `node` has been committed.
    pub fn on_indexed(&mut self, node: &Node) {
        if node.length() > self.indexed {
            self.indexed = node.length();
        }
    }

    /// Drops cached nodes up to `upto`. Callers bound this by the indexed
    /// prefix (and, for the local writer, by the persisted length so
    /// unflushed blocks stay encodable).
    pub fn prune_cached(&mut self, upto: u64) {
        while self
            .nodes
            .front()
            .is_some_and(|front| front.length() <= upto.min(self.indexed))
        {
            self.shift();
        }
    }

    /// Builds and caches a new local node on top of the given head nodes.
    ///
    /// Only the local writer appends. The node's clock is the union of the
    /// head clocks plus the heads themselves, pruned of positions the
    /// system already committed, stamped with the new self entry last.
    pub fn append(
        &mut self,
        value: Option<Bytes>,
        heads: &[Arc<Node>],
        batch: u32,
        lookup: &dyn IndexedLookup,
    ) -> Arc<Node> {
        let length = self.length + 1;

        let mut clock = Clock::new();
        let mut head_ids = Vec::with_capacity(heads.len());
        let mut dependencies = Vec::new();
        for head in heads {
            if let Some(head_clock) = head.clock_snapshot() {
                clock.merge(&head_clock);
            }
            clock.observe(head.writer(), head.length());
            head_ids.push(head.id());
            if !head.is_indexed() {
                dependencies.push(head.clone());
            }
        }
        clock.prune(|key, len| lookup.is_indexed(key, len));
        clock.observe(self.key, length);

        let node = Node::build(self.key, length, value, head_ids, batch, dependencies, clock);
        self.nodes.push_back(node.clone());
        self.length = length;
        node
    }

    /// Moves a resolved `next` candidate into the cache.
    pub fn advance_next(&mut self) -> Option<Arc<Node>> {
        let node = self.next.take()?;
        self.nodes.push_back(node.clone());
        self.length = node.length();
        Some(node)
    }

    /// Reads the best checkpoint reachable from the log tail by following
    /// the `checkpointer` back-pointer.
    pub async fn get_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let length = self.core.length().await;
        if length == 0 {
            return Ok(None);
        }

        let Some(block) = self.core.get(length - 1).await? else {
            return Ok(None);
        };
        let tail = OplogMessage::decode(&block)?;
        if tail.checkpointer == 0 {
            return Ok(tail.checkpoint);
        }

        let carrier_seq = (length - 1).saturating_sub(u64::from(tail.checkpointer));
        let Some(block) = self.core.get(carrier_seq).await? else {
            return Ok(None);
        };
        Ok(OplogMessage::decode(&block)?.checkpoint)
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("key", &self.key)
            .field("length", &self.length)
            .field("indexed", &self.indexed)
            .field("offset", &self.offset)
            .field("cached", &self.nodes.len())
            .finish()
    }
}

/// The set of writers currently participating, addressable by key.
#[derive(Debug, Default)]
pub struct WriterSet {
    writers: Vec<Writer>,
    local: Option<WriterKey>,
}

impl WriterSet {
    pub fn new(local: Option<WriterKey>) -> Self {
        Self {
            writers: Vec::new(),
            local,
        }
    }

    pub fn insert(&mut self, writer: Writer) {
        debug_assert!(self.get(&writer.key()).is_none());
        self.writers.push(writer);
    }

    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    pub fn get(&self, key: &WriterKey) -> Option<&Writer> {
        self.writers.iter().find(|w| w.key() == *key)
    }

    pub fn get_mut(&mut self, key: &WriterKey) -> Option<&mut Writer> {
        self.writers.iter_mut().find(|w| w.key() == *key)
    }

    pub fn at(&self, idx: usize) -> Option<&Writer> {
        self.writers.get(idx)
    }

    pub fn at_mut(&mut self, idx: usize) -> Option<&mut Writer> {
        self.writers.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Writer> {
        self.writers.iter()
    }

    pub fn keys(&self) -> Vec<WriterKey> {
        self.writers.iter().map(|w| w.key()).collect()
    }

    pub fn local_key(&self) -> Option<WriterKey> {
        self.local
    }

    pub fn local(&self) -> Option<&Writer> {
        let key = self.local?;
        self.get(&key)
    }

    pub fn local_mut(&mut self) -> Option<&mut Writer> {
        let key = self.local?;
        self.get_mut(&key)
    }

    /// Tears the set down, handing the writers back for draining.
    pub fn take_writers(&mut self) -> Vec<Writer> {
        self.local = None;
        std::mem::take(&mut self.writers)
    }

    /// Attempts to advance writer `idx` by one node.
    ///
    /// Idempotent and resumable: a decoded-but-unresolved candidate is
    /// cached and retried on later ticks. Returns the resolved candidate
    /// without consuming it; callers push it to the linearizer and then
    /// call [`Writer::advance_next`].
    pub async fn ensure_next(
        &mut self,
        idx: usize,
        lookup: &dyn IndexedLookup,
    ) -> Result<Option<Arc<Node>>> {
        if let Some(next) = self.writers[idx].next.as_ref() {
            return Ok(Some(next.clone()));
        }

        let (core, loaded, key) = {
            let w = &self.writers[idx];
            (w.core.clone(), w.length, w.key)
        };
        let core_length = core.length().await;
        if core_length == 0 || loaded >= core_length {
            return Ok(None);
        }

        if self.writers[idx].next_cache.is_none() {
            if !core.has(loaded).await {
                // sparse log; block not downloaded yet
                return Ok(None);
            }
            let Some(block) = core.get(loaded).await? else {
                return Ok(None);
            };
            let message = OplogMessage::decode(&block)?;
            self.writers[idx].next_cache = Some(PendingNode {
                remaining: message.heads.clone(),
                dependencies: Vec::new(),
                clock: Clock::new(),
                length: loaded + 1,
                message,
            });
        }

        // Take the candidate out so dependency lookups on sibling writers
        // do not alias the mutable borrow.
        let Some(mut pending) = self.writers[idx].next_cache.take() else {
            return Ok(None);
        };

        let mut stalled = false;
        let mut i = 0;
        while i < pending.remaining.len() {
            let head = pending.remaining[i];
            if lookup.is_indexed(&head.key, head.length) {
                pending.remaining.swap_remove(i);
                continue;
            }

            let Some(other) = self.get(&head.key) else {
                // writer not (yet) registered; wait for membership
                trace!(writer = %key, dep = ?head, "dependency writer unknown, deferring");
                stalled = true;
                break;
            };
            if other.indexed() >= head.length {
                // dependency already consumed by the committed prefix
                pending.remaining.swap_remove(i);
                continue;
            }
            let Some(dep) = other.get_cached(head.length) else {
                trace!(writer = %key, dep = ?head, "dependency not loaded, deferring");
                stalled = true;
                break;
            };

            if let Some(dep_clock) = dep.clock_snapshot() {
                pending.clock.merge(&dep_clock);
            }
            pending.clock.observe(head.key, head.length);
            pending.dependencies.push(dep.clone());
            pending.remaining.swap_remove(i);
        }

        if stalled {
            self.writers[idx].next_cache = Some(pending);
            return Ok(None);
        }

        pending.clock.prune(|k, l| lookup.is_indexed(k, l));
        let mut clock = pending.clock;
        clock.observe(key, pending.length);

        let node = Node::build(
            key,
            pending.length,
            pending.message.value.map(Bytes::from),
            pending.message.heads,
            pending.message.batch,
            pending.dependencies,
            clock,
        );
        self.writers[idx].next = Some(node.clone());
        Ok(Some(node))
    }
}
