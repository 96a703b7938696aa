use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use braid_primitives::WriterKey;
use tracing::{debug, warn};

use crate::Node;

/// Result of one linearizer tick.
///
/// `indexed` extends the committed prefix; `tip` is the provisional order
/// above it and may change on later ticks. `shared` counts the leading
/// entries equal to the previously returned sequence (already applied by
/// the caller); `popped` counts previously returned tip entries that must
/// be undone before anything new is applied.
#[derive(Debug)]
pub struct OrderUpdate {
    pub indexed: Vec<Arc<Node>>,
    pub tip: Vec<Arc<Node>>,
    pub shared: u64,
    pub popped: u64,
}

impl OrderUpdate {
    /// Total number of entries above the previously committed prefix.
    pub fn length(&self) -> u64 {
        (self.indexed.len() + self.tip.len()) as u64
    }

    /// Entry at position `at` of the new sequence (indexed then tip).
    pub fn node(&self, at: u64) -> &Arc<Node> {
        let at = at as usize;
        if at < self.indexed.len() {
            &self.indexed[at]
        } else {
            &self.tip[at - self.indexed.len()]
        }
    }
}

/// Collapses the causal DAG of pushed head nodes into a deterministic
/// total order and decides the committed prefix.
///
/// The order is the unique linear extension that respects causal
/// precedence (clock containment) and breaks ties by writer key. A prefix
/// commits once every indexer's current head causally dominates it: any
/// future node of a writer is causally above that writer's head, so a
/// fully dominated prefix can never be reordered. An indexer with no head
/// blocks commitment entirely (heartbeats exist to unblock).
pub struct Linearizer {
    /// Indexer keys, sorted; the authoritative set per the system view.
    indexers: Vec<WriterKey>,
    /// Latest pushed head per writer.
    heads: BTreeMap<WriterKey, Arc<Node>>,
    /// Unindexed nodes per writer, in length order.
    pending: BTreeMap<WriterKey, VecDeque<Arc<Node>>>,
    /// Committed length per writer.
    base: BTreeMap<WriterKey, u64>,
    /// Previously returned provisional order.
    tip: Vec<Arc<Node>>,
    /// Total entries committed so far.
    indexed_length: u64,
    changed: bool,
}

impl Linearizer {
    pub fn new(mut indexers: Vec<WriterKey>, base: BTreeMap<WriterKey, u64>) -> Self {
        indexers.sort();
        indexers.dedup();
        Self {
            indexers,
            heads: BTreeMap::new(),
            pending: BTreeMap::new(),
            base,
            tip: Vec::new(),
            indexed_length: 0,
            changed: false,
        }
    }

    pub fn indexers(&self) -> &[WriterKey] {
        &self.indexers
    }

    pub fn indexed_length(&self) -> u64 {
        self.indexed_length
    }

    /// Current head set, key-ordered. Used to stamp new local nodes.
    pub fn heads(&self) -> Vec<Arc<Node>> {
        self.heads.values().cloned().collect()
    }

    /// Seeds a head without scheduling it for ordering; used on restart
    /// with minimal nodes standing in for the digest's committed tips.
    pub fn seed_head(&mut self, node: Arc<Node>) {
        self.heads.insert(node.writer(), node);
    }

    /// Pushes a candidate node: it becomes its writer's head and joins the
    /// ordering queue.
    pub fn add_head(&mut self, node: Arc<Node>) {
        let writer = node.writer();
        let queue = self.pending.entry(writer).or_default();
        debug_assert_eq!(
            node.length(),
            queue
                .back()
                .map(|n| n.length())
                .unwrap_or_else(|| self.base.get(&writer).copied().unwrap_or(0))
                + 1,
            "writer lengths must be contiguous"
        );
        queue.push_back(node.clone());
        self.heads.insert(writer, node);
        self.changed = true;
    }

    /// Recomputes the order if anything changed since the last call.
    ///
    /// The committed prefix reported in `indexed` is a decision, not yet
    /// an absorption: the caller confirms it (possibly partially, stopping
    /// at a membership change) via [`Linearizer::commit`] once the
    /// corresponding applies and flushes have landed.
    pub fn update(&mut self) -> Option<OrderUpdate> {
        if !self.changed {
            return None;
        }
        self.changed = false;

        let order = self.linearize();
        let committed = self.committed_prefix(&order);

        let shared = self
            .tip
            .iter()
            .zip(order.iter())
            .take_while(|(a, b)| Arc::ptr_eq(a, b))
            .count();
        let popped = self.tip.len() - shared;

        if committed == 0 && popped == 0 && order.len() == self.tip.len() {
            return None;
        }

        debug!(
            committed,
            total = order.len(),
            shared,
            popped,
            "linearizer update"
        );

        let indexed = order[..committed].to_vec();
        let tip = order[committed..].to_vec();
        // the full sequence is the comparison point for the next tick
        self.tip = order;

        Some(OrderUpdate {
            indexed,
            tip,
            shared: shared as u64,
            popped: popped as u64,
        })
    }

    /// Absorbs the first `count` entries of the last returned order into
    /// the committed prefix: they are marked indexed, their clocks drop,
    /// and they leave the ordering queues.
    pub fn commit(&mut self, count: u64) {
        for _ in 0..count {
            if self.tip.is_empty() {
                return;
            }
            let node = self.tip.remove(0);
            node.mark_indexed();
            self.base.insert(node.writer(), node.length());
            let consumed = self
                .pending
                .get_mut(&node.writer())
                .and_then(|queue| queue.pop_front());
            debug_assert!(consumed.is_some_and(|front| Arc::ptr_eq(&front, &node)));
            self.indexed_length += 1;
        }
        self.pending.retain(|_, queue| !queue.is_empty());
    }

    /// Greedy linear extension: repeatedly yield the smallest-keyed writer
    /// whose next pending node has its causal frontier satisfied.
    fn linearize(&self) -> Vec<Arc<Node>> {
        let total: usize = self.pending.values().map(|q| q.len()).sum();
        let mut order = Vec::with_capacity(total);
        let mut cursors: BTreeMap<WriterKey, usize> =
            self.pending.keys().map(|k| (*k, 0)).collect();
        let mut yielded = self.base.clone();

        'fill: while order.len() < total {
            // pending iterates in key order, so the first satisfied
            // candidate is the tie-break winner
            for (key, queue) in &self.pending {
                let cursor = cursors[key];
                let Some(node) = queue.get(cursor) else {
                    continue;
                };
                let ready = node.clock_satisfied_by(|w, l| {
                    *w == node.writer() || yielded.get(w).copied().unwrap_or(0) >= l
                });
                if !ready {
                    continue;
                }

                order.push(node.clone());
                yielded.insert(*key, node.length());
                cursors.insert(*key, cursor + 1);
                continue 'fill;
            }

            // every remaining node waits on an entry that was never pushed;
            // leave them for a later tick
            warn!(
                ordered = order.len(),
                pending = total,
                "causal frontier incomplete, deferring remainder"
            );
            break;
        }

        order
    }

    /// Longest prefix of `order` dominated by every indexer's head.
    fn committed_prefix(&self, order: &[Arc<Node>]) -> usize {
        let mut heads = Vec::with_capacity(self.indexers.len());
        for key in &self.indexers {
            match self.heads.get(key) {
                Some(head) => heads.push(head.clone()),
                // an indexer that has never published blocks commitment
                None => return 0,
            }
        }

        let mut committed = order
            .iter()
            .take_while(|node| heads.iter().all(|head| head.dominates(node)))
            .count();
        // never split an atomic group across the commit line; intermediate
        // members wait for their boundary
        while committed > 0 && !order[committed - 1].is_batch_boundary() {
            committed -= 1;
        }
        committed
    }
}

impl std::fmt::Debug for Linearizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linearizer")
            .field("indexers", &self.indexers.len())
            .field("heads", &self.heads.len())
            .field("tip", &self.tip.len())
            .field("indexed_length", &self.indexed_length)
            .finish()
    }
}
