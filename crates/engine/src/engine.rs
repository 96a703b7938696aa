use std::{
    cmp,
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::Arc,
};

use braid_linearizer::{Linearizer, LinearizerError, Node, OrderUpdate, Writer, WriterSet};
use braid_oplog_types::{Checkpoint, OplogMessage};
use braid_primitives::{IndexHead, WriterKey};
use braid_transport::{LogStore, Oplog, UpdateOptions};
use braid_views::{ApplyGate, SystemView, ViewCore, ViewStore};
use bytes::Bytes;
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{ApplyContext, ApplyEntry, ApplyHandler, EngineError};

/// Reserved name of the system view's underlying log.
const SYSTEM_VIEW: &str = "_system";

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Initial writer set; defaults to just the local writer. Sorted so
    /// every participant agrees on the primary bootstrap.
    pub bootstraps: Vec<WriterKey>,
    /// Leave remote blocks undownloaded until needed.
    pub sparse: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            bootstraps: Vec::new(),
            sparse: true,
        }
    }
}

/// Bookkeeping for one apply invocation, kept until the covered entries
/// are either confirmed (flushed) or popped (undone).
#[derive(Debug)]
struct UpdateRecord {
    /// Entries covered by the apply call.
    batch: u64,
    /// Membership changes it staged.
    system: u64,
    /// Blocks it appended, per view.
    user: Vec<(String, u64)>,
    /// Highest covered length per writer; the digest advances to exactly
    /// the confirmed coverage, never past it.
    tails: BTreeMap<WriterKey, u64>,
}

/// The orchestrator state machine.
///
/// All mutation happens on one logical task; the advance loop is the only
/// driver. [`crate::EngineBuilder`] wraps an engine in a debounced task
/// with a command handle, but the engine can also be driven directly.
pub struct Engine<H: ApplyHandler> {
    store: Arc<dyn LogStore>,
    handler: Arc<H>,
    options: EngineOptions,
    gate: Arc<ApplyGate>,
    system: SystemView,
    views: ViewStore,
    user_view: H::View,
    writers: WriterSet,
    linearizer: Linearizer,
    /// Local append groups not yet published as nodes.
    queued: VecDeque<Vec<Option<Bytes>>>,
    /// Records for applied-but-unconfirmed entries, FIFO.
    records: VecDeque<UpdateRecord>,
    /// Last ordering result, kept when a tick aborts before consuming it.
    pending_update: Option<OrderUpdate>,
    /// Entries applied above the committed prefix.
    applied: u64,
    /// Local writer length already written to its log.
    local_persisted: u64,
    /// System-core length of the last embedded checkpoint.
    last_embedded: Option<u64>,
    /// Hop distance of the next local block to its checkpoint carrier.
    since_carrier: u32,
    /// Freshest flushed checkpoint.
    checkpoint: Option<Checkpoint>,
    /// Writers removed from membership, draining before close.
    removed: Vec<Writer>,
    watchers: Vec<JoinHandle<()>>,
    wake: Arc<Notify>,
    closed: bool,
}

fn spawn_watcher(core: &Arc<dyn Oplog>, wake: &Arc<Notify>) -> JoinHandle<()> {
    let mut lengths = core.watch_length();
    let wake = wake.clone();
    tokio::spawn(async move {
        while lengths.changed().await.is_ok() {
            wake.notify_one();
        }
    })
}

impl<H: ApplyHandler> Engine<H> {
    /// Opens the orchestrator: rehydrates (or bootstraps) the system view,
    /// opens the user view and every member writer, and seeds the
    /// linearizer from the committed digest.
    pub async fn open(
        store: Arc<dyn LogStore>,
        handler: H,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        let gate = ApplyGate::new();
        let handler = Arc::new(handler);

        let mut bootstraps = options.bootstraps.clone();
        if bootstraps.is_empty() {
            if let Some(local) = store.local_key() {
                bootstraps.push(local);
            }
        }
        bootstraps.sort();
        bootstraps.dedup();

        let system_core = store.open_view(SYSTEM_VIEW).await?;
        let system = SystemView::open(system_core, gate.clone(), &bootstraps).await?;

        let mut views = ViewStore::new(gate.clone());
        let user_view = handler.open(&mut views).await?;
        views.ready_pending(&store).await?;

        let wake = Arc::new(Notify::new());
        let local_key = store.local_key().filter(|key| system.is_member(key));
        let mut writers = WriterSet::new(local_key);
        let mut watchers = Vec::new();
        let mut base = BTreeMap::new();
        for (key, indexed) in system.writers().collect::<Vec<_>>() {
            let core = store.open_writer(&key).await?;
            watchers.push(spawn_watcher(&core, &wake));
            writers.insert(Writer::new(core, indexed));
            base.insert(key, indexed);
        }

        let mut linearizer = Linearizer::new(writers.keys(), base);
        for head in system.heads() {
            linearizer.seed_head(Node::seed(head.key, head.length));
        }

        let local_persisted = match writers.local() {
            Some(local) => local.core().length().await,
            None => 0,
        };
        let checkpoint = system.checkpoint().cloned();

        info!(
            writers = writers.len(),
            writable = writers.local_key().is_some(),
            "engine opened"
        );

        Ok(Self {
            store,
            handler,
            options,
            gate,
            system,
            views,
            user_view,
            writers,
            linearizer,
            queued: VecDeque::new(),
            records: VecDeque::new(),
            pending_update: None,
            applied: 0,
            local_persisted,
            last_embedded: None,
            since_carrier: 0,
            checkpoint,
            removed: Vec::new(),
            watchers,
            wake,
            closed: false,
        })
    }

    /// Whether a local writer is registered.
    pub fn writable(&self) -> bool {
        self.writers.local_key().is_some()
    }

    /// Wake handle shared with the transport watchers; the task loop waits
    /// on it.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Current linearizer heads.
    pub fn heads(&self) -> Vec<IndexHead> {
        self.linearizer.heads().iter().map(|n| n.id()).collect()
    }

    /// Session on a named view core (creates it lazily; readied on the
    /// next advance tick).
    pub fn view(&mut self, name: &str) -> Arc<ViewCore> {
        self.views.get(name)
    }

    /// Read access to the system view.
    pub fn system(&self) -> &SystemView {
        &self.system
    }

    /// Appends one value to the local writer's log.
    pub async fn append(&mut self, value: Bytes) -> Result<(), EngineError> {
        self.append_batch(vec![value]).await
    }

    /// Appends a group of values as one atomic batch.
    pub async fn append_batch(&mut self, values: Vec<Bytes>) -> Result<(), EngineError> {
        self.ensure_open()?;
        if !self.writable() {
            return Err(EngineError::NotWritable);
        }
        if values.is_empty() {
            return Ok(());
        }
        self.queued
            .push_back(values.into_iter().map(Some).collect());
        self.advance().await
    }

    /// Publishes a heartbeat entry that advances heads without carrying a
    /// value; this is what unblocks commitment after membership grows.
    pub async fn ack(&mut self) -> Result<(), EngineError> {
        self.ensure_open()?;
        if !self.writable() {
            return Err(EngineError::NotWritable);
        }
        self.queued.push_back(vec![None]);
        self.advance().await
    }

    /// Pulls remote writer state and absorbs whatever arrived. With
    /// `sparse` off, missing blocks are downloaded eagerly.
    pub async fn update(&mut self, opts: UpdateOptions) -> Result<(), EngineError> {
        self.ensure_open()?;
        for idx in 0..self.writers.len() {
            let Some(core) = self.writers.at(idx).map(|w| w.core().clone()) else {
                continue;
            };
            core.update(opts).await?;
            if !self.options.sparse {
                let length = core.length().await;
                core.download(0..length).await?;
            }
        }
        self.advance().await
    }

    /// Best checkpoint available across all open writer logs (greatest
    /// embedded length wins), including writers still draining.
    pub async fn checkpoint(&self) -> Result<Option<Checkpoint>, EngineError> {
        let mut best: Option<Checkpoint> = None;
        for writer in self.writers.iter().chain(self.removed.iter()) {
            let Some(candidate) = writer.get_checkpoint().await? else {
                continue;
            };
            if best.as_ref().map_or(true, |b| candidate.length > b.length) {
                best = Some(candidate);
            }
        }
        Ok(best)
    }

    /// Shuts the orchestrator down. In-flight work has already completed
    /// (the advance loop never yields mid-tick to callers).
    pub async fn close(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
        self.store.close().await?;
        info!("engine closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    /// One advance tick: publish local appends, absorb remote progress,
    /// linearize and apply, flush local blocks, restart on membership
    /// change, clean up.
    pub async fn advance(&mut self) -> Result<(), EngineError> {
        self.ensure_open()?;
        loop {
            self.publish_local()?;
            self.absorb_remote().await?;
            let restart = self.linearize_and_apply().await?;
            self.flush_local().await?;
            if restart {
                self.restart().await?;
                continue;
            }
            self.cleanup().await?;
            return Ok(());
        }
    }

    /// Drains queued local values into writer nodes, snapshotting the
    /// linearizer heads per node so entries within a group chain onto
    /// each other.
    fn publish_local(&mut self) -> Result<(), EngineError> {
        while let Some(group) = self.queued.pop_front() {
            let size = group.len();
            for (at, value) in group.into_iter().enumerate() {
                let heads = self.linearizer.heads();
                let batch = (size - at) as u32;
                let node = {
                    let Some(local) = self.writers.local_mut() else {
                        return Err(EngineError::NotWritable);
                    };
                    local.append(value, &heads, batch, &self.system)
                };
                self.linearizer.add_head(node);
            }
        }
        Ok(())
    }

    /// Loops `ensure_next` across all writers until no writer advances.
    /// Decode failures halt that writer's progress but not the tick.
    async fn absorb_remote(&mut self) -> Result<(), EngineError> {
        loop {
            let mut progressed = false;
            for idx in 0..self.writers.len() {
                let node = match self.writers.ensure_next(idx, &self.system).await {
                    Ok(Some(node)) => node,
                    Ok(None) => continue,
                    Err(LinearizerError::Decode(decode_error)) => {
                        let key = self.writers.at(idx).map(|w| w.key());
                        error!(writer = ?key, error = %decode_error, "block failed to decode; writer halted");
                        continue;
                    }
                    Err(other) => return Err(other.into()),
                };
                if let Some(writer) = self.writers.at_mut(idx) {
                    writer.advance_next();
                }
                self.linearizer.add_head(node);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        Ok(())
    }

    /// Runs the linearizer and reconciles its result: undo popped
    /// entries, apply new batches, confirm and flush the committed
    /// prefix. Returns whether a committed membership change demands a
    /// restart.
    async fn linearize_and_apply(&mut self) -> Result<bool, EngineError> {
        // a fresh result supersedes a cached one; a cached one survives
        // from a tick that aborted mid-apply and is retried here
        if let Some(update) = self.linearizer.update() {
            self.pending_update = Some(update);
        }
        let Some(update) = self.pending_update.take() else {
            return Ok(false);
        };
        debug!(
            indexed = update.indexed.len(),
            tip = update.tip.len(),
            shared = update.shared,
            popped = update.popped,
            "order update"
        );

        // undo records beyond the surviving shared prefix (whole records:
        // a straddled batch is undone and reapplied deterministically)
        let target = cmp::min(update.shared, self.applied);
        while self.applied > target {
            let Some(record) = self.records.pop_back() else {
                return Err(EngineError::Invariant("applied entries without update records"));
            };
            self.undo_record(&record);
            self.applied -= record.batch;
        }

        // apply everything above the applied prefix, one atomic group at
        // a time; a trailing incomplete group waits for its boundary
        let committed = update.indexed.len() as u64;
        let length = update.length();
        let mut batch_nodes: Vec<Arc<Node>> = Vec::new();
        let mut batch_entries: Vec<ApplyEntry> = Vec::new();
        let mut position = self.applied;
        while position < length {
            let node = update.node(position).clone();
            batch_entries.push(ApplyEntry {
                indexed: position < committed,
                from: node.writer(),
                length: node.length(),
                value: node.value().cloned(),
                heads: node.heads().to_vec(),
            });
            batch_nodes.push(node);
            position += 1;
            if batch_nodes.last().map_or(false, |n| n.is_batch_boundary()) {
                if let Err(apply_error) = self.apply_batch(&batch_nodes, &batch_entries).await {
                    // keep the result so the next tick retries this batch
                    self.pending_update = Some(update);
                    return Err(apply_error);
                }
                batch_nodes.clear();
                batch_entries.clear();
            }
        }

        // confirm records covered by the committed prefix; a membership
        // change stops confirmation at its record so everything after it
        // is re-evaluated under the new writer set
        let mut restart = false;
        if committed > 0 {
            let mut covered = 0u64;
            let mut confirmed = 0usize;
            for record in &self.records {
                if covered >= committed {
                    break;
                }
                covered += record.batch;
                confirmed += 1;
                if record.system > 0 {
                    restart = true;
                    break;
                }
            }
            if !restart && covered != committed {
                return Err(EngineError::Invariant(
                    "committed prefix does not align with apply batches",
                ));
            }
            if confirmed > 0 {
                if let Err(flush_error) = self.flush_confirmed(confirmed).await {
                    self.pending_update = Some(update);
                    return Err(flush_error);
                }

                // absorb the confirmed coverage: linearizer base advances,
                // writers learn their committed prefixes, remote caches
                // prune (the local cache waits for flush_local)
                self.linearizer.commit(covered);
                let local_key = self.writers.local_key();
                for at in 0..covered {
                    let node = update.node(at);
                    if let Some(writer) = self.writers.get_mut(&node.writer()) {
                        writer.on_indexed(node);
                        if local_key != Some(node.writer()) {
                            writer.prune_cached(node.length());
                        }
                    }
                }

                for _ in 0..confirmed {
                    self.records.pop_front();
                }
                self.applied -= covered;
            }
        }

        Ok(restart)
    }

    /// Invokes the user apply handler over one atomic group and records
    /// its effects. A handler failure discards the call's speculative
    /// output and aborts the tick.
    async fn apply_batch(
        &mut self,
        nodes: &[Arc<Node>],
        entries: &[ApplyEntry],
    ) -> Result<(), EngineError> {
        let handler = self.handler.clone();
        self.gate.enter();
        if self.system.is_bootstrapping() {
            self.system.mark_bootstrapped();
        }
        let result = {
            let mut ctx = ApplyContext::new(&mut self.system, &mut self.views);
            handler.apply(entries, &mut self.user_view, &mut ctx).await
        };
        self.gate.exit();

        match result {
            Ok(()) => {
                let mut tails = BTreeMap::new();
                for node in nodes {
                    let tail = tails.entry(node.writer()).or_insert(0);
                    *tail = cmp::max(*tail, node.length());
                }
                let record = UpdateRecord {
                    batch: nodes.len() as u64,
                    system: self.system.take_staged(),
                    user: self.views.collect_appending(),
                    tails,
                };
                debug!(batch = record.batch, system = record.system, "batch applied");
                self.applied += record.batch;
                self.records.push_back(record);
                Ok(())
            }
            Err(handler_error) => {
                warn!(error = %handler_error, "apply handler failed; discarding speculative output");
                self.views.discard_appending();
                self.system.undo_staged();
                Err(EngineError::Apply(handler_error))
            }
        }
    }

    /// Reverses one update record: view tips truncate, staged membership
    /// changes pop.
    fn undo_record(&mut self, record: &UpdateRecord) {
        for (name, count) in record.user.iter().rev() {
            if let Some(core) = self.views.core(name) {
                core.on_undo(*count);
            }
        }
        self.system.pop(record.system);
        debug!(batch = record.batch, "update record undone");
    }

    /// Persists the output of the first `confirmed` records: view blocks
    /// first, then the system digest that references them, then the
    /// refreshed checkpoint.
    async fn flush_confirmed(&mut self, confirmed: usize) -> Result<(), EngineError> {
        // cores created this very tick may not have logs yet
        self.views.ready_pending(&self.store).await?;

        let mut per_view: BTreeMap<String, u64> = BTreeMap::new();
        let mut system_changes = 0u64;
        let mut writer_lengths: BTreeMap<WriterKey, u64> = BTreeMap::new();
        for record in self.records.iter().take(confirmed) {
            system_changes += record.system;
            for (name, count) in &record.user {
                *per_view.entry(name.clone()).or_insert(0) += count;
            }
            for (writer, tail) in &record.tails {
                let length = writer_lengths.entry(*writer).or_insert(0);
                *length = cmp::max(*length, *tail);
            }
        }

        for (name, count) in &per_view {
            let Some(core) = self.views.core(name) else {
                return Err(EngineError::Invariant("update record names unknown view"));
            };
            let blocks = core.indexing_blocks(*count);
            let Some(log) = core.log() else {
                return Err(EngineError::Invariant("flushing view has no underlying log"));
            };
            log.append(blocks).await?;
            core.on_index(*count);
        }

        let checkpoint = self.system.flush(system_changes, &writer_lengths).await?;
        self.checkpoint = Some(checkpoint);
        debug!(views = per_view.len(), system_changes, "confirmed prefix flushed");
        Ok(())
    }

    /// Writes newly produced local nodes to the local log, embedding the
    /// freshest checkpoint in the first block after it appeared and
    /// back-pointing from the rest.
    async fn flush_local(&mut self) -> Result<(), EngineError> {
        let Some(local) = self.writers.local() else {
            return Ok(());
        };
        let length = local.length();
        if length <= self.local_persisted {
            return Ok(());
        }

        let checkpoint = self.checkpoint.clone();
        let mut last_embedded = self.last_embedded;
        let mut since_carrier = self.since_carrier;
        let mut blocks = Vec::with_capacity((length - self.local_persisted) as usize);
        for seq in (self.local_persisted + 1)..=length {
            let Some(node) = local.get_cached(seq) else {
                return Err(EngineError::Invariant("unpersisted local node not cached"));
            };
            let (checkpointer, embedded) = match &checkpoint {
                Some(cp) if last_embedded != Some(cp.length) => {
                    last_embedded = Some(cp.length);
                    since_carrier = 0;
                    (0, Some(cp.clone()))
                }
                _ => {
                    since_carrier += 1;
                    (since_carrier, None)
                }
            };
            let message = OplogMessage {
                value: node.value().map(|b| b.to_vec()),
                heads: node.heads().to_vec(),
                batch: node.batch(),
                checkpointer,
                checkpoint: embedded,
            };
            blocks.push(Bytes::from(message.encode()?));
        }

        let core = local.core().clone();
        let new_length = core.append(blocks).await?;
        self.local_persisted = new_length;
        self.last_embedded = last_embedded;
        self.since_carrier = since_carrier;

        if let Some(local) = self.writers.local_mut() {
            let bound = cmp::min(local.indexed(), new_length);
            local.prune_cached(bound);
        }
        debug!(persisted = new_length, "local blocks flushed");
        Ok(())
    }

    /// Tears down and rebuilds the writer set and linearizer after a
    /// committed membership change: undo all speculative state, rebuild
    /// membership from the digest, reseed heads, and let the next loop
    /// iteration re-ingest.
    async fn restart(&mut self) -> Result<(), EngineError> {
        info!("committed membership changed; restarting");

        while let Some(record) = self.records.pop_back() {
            self.undo_record(&record);
        }
        self.applied = 0;
        self.pending_update = None;

        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
        let mut parked: BTreeMap<WriterKey, Writer> = self
            .writers
            .take_writers()
            .into_iter()
            .map(|w| (w.key(), w))
            .collect();

        let membership: Vec<(WriterKey, u64)> = self.system.writers().collect();
        let local_key = self.store.local_key().filter(|key| self.system.is_member(key));
        let mut writers = WriterSet::new(local_key);
        let mut base = BTreeMap::new();
        for (key, indexed) in &membership {
            let core = match parked.remove(key) {
                Some(old) => old.core().clone(),
                None => self.store.open_writer(key).await?,
            };
            self.watchers.push(spawn_watcher(&core, &self.wake));
            writers.insert(Writer::new(core, *indexed));
            base.insert(*key, *indexed);
        }
        self.writers = writers;

        for (key, writer) in parked {
            info!(writer = %key, "writer removed from membership; draining");
            // references to entries this writer already published resolve
            // as consumed rather than stalling forever
            self.system.note_retired(key, writer.length());
            self.removed.push(writer);
        }

        self.linearizer = Linearizer::new(self.writers.keys(), base);
        for head in self.system.heads() {
            self.linearizer.seed_head(Node::seed(head.key, head.length));
        }

        self.local_persisted = match self.writers.local() {
            Some(local) => local.core().length().await,
            None => 0,
        };
        Ok(())
    }

    /// End-of-tick housekeeping: ready freshly created view cores and
    /// close writers that finished draining.
    async fn cleanup(&mut self) -> Result<(), EngineError> {
        self.views.ready_pending(&self.store).await?;
        for writer in self.removed.drain(..) {
            if let Err(close_error) = writer.core().close().await {
                warn!(writer = %writer.key(), error = %close_error, "closing removed writer failed");
            }
        }
        Ok(())
    }
}

impl<H: ApplyHandler> fmt::Debug for Engine<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("writers", &self.writers.len())
            .field("applied", &self.applied)
            .field("records", &self.records.len())
            .field("local_persisted", &self.local_persisted)
            .field("closed", &self.closed)
            .finish()
    }
}
