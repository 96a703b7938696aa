use std::{collections::BTreeMap, fmt, sync::Arc};

use braid_linearizer::IndexedLookup;
use braid_oplog_types::{Checkpoint, SystemDigest};
use braid_primitives::{IndexHead, WriterKey};
use braid_transport::{Oplog, TransportError};
use bytes::Bytes;
use tracing::{debug, info};

use crate::{ApplyGate, ViewError};

/// A speculative membership operation, undone if the entry that caused it
/// is popped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemChange {
    Add(WriterKey),
    Remove(WriterKey),
}

/// The distinguished view recording authoritative membership.
///
/// Committed state (the writer set with indexed lengths, and the heads in
/// force at the last flush) changes only when a confirmed prefix is
/// flushed; apply-driven membership operations stage as speculative
/// changes until then. The digest persisted at the tail of the system log
/// is the source of truth on startup.
pub struct SystemView {
    core: Arc<dyn Oplog>,
    gate: Arc<ApplyGate>,
    /// Committed membership: writer key to indexed length.
    writers: BTreeMap<WriterKey, u64>,
    /// Committed heads at the last flush.
    heads: Vec<IndexHead>,
    /// Final indexed lengths of removed writers, kept so late entries
    /// referencing their consumed heads still resolve.
    retired: BTreeMap<WriterKey, u64>,
    /// Speculative membership changes above the committed digest.
    changes: Vec<SystemChange>,
    /// Changes made by the in-flight apply call.
    staged: usize,
    bootstrapping: bool,
    checkpoint: Option<Checkpoint>,
}

impl SystemView {
    /// Opens the system view over its log: rehydrates from the tail
    /// digest, or bootstraps one from the given keys when the log is
    /// empty.
    pub async fn open(
        core: Arc<dyn Oplog>,
        gate: Arc<ApplyGate>,
        bootstraps: &[WriterKey],
    ) -> Result<Self, ViewError> {
        let length = core.length().await;

        if length == 0 {
            let mut keys: Vec<WriterKey> = bootstraps.to_vec();
            keys.sort();
            keys.dedup();
            let mut system = Self {
                core,
                gate,
                writers: keys.into_iter().map(|k| (k, 0)).collect(),
                heads: Vec::new(),
                retired: BTreeMap::new(),
                changes: Vec::new(),
                staged: 0,
                bootstrapping: true,
                checkpoint: None,
            };
            system.write_digest().await?;
            info!(writers = system.writers.len(), "system view bootstrapped");
            return Ok(system);
        }

        let Some(block) = core.get(length - 1).await? else {
            return Err(ViewError::Transport(TransportError::io(
                "system digest block unavailable",
            )));
        };
        let digest = SystemDigest::decode(&block)?;
        debug!(
            writers = digest.writers.len(),
            heads = digest.heads.len(),
            "system view rehydrated"
        );
        Ok(Self {
            core,
            gate,
            writers: digest.writers.iter().map(|w| (w.key, w.length)).collect(),
            heads: digest.heads,
            retired: BTreeMap::new(),
            changes: Vec::new(),
            staged: 0,
            bootstrapping: false,
            checkpoint: Some(Checkpoint::new(length, block.to_vec())),
        })
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.bootstrapping
    }

    /// First-apply hook: the writer set configured at bootstrap becomes
    /// definitive membership.
    pub fn mark_bootstrapped(&mut self) {
        if self.bootstrapping {
            debug!("system bootstrap complete");
            self.bootstrapping = false;
        }
    }

    /// Committed membership, key-ordered.
    pub fn writers(&self) -> impl Iterator<Item = (WriterKey, u64)> + '_ {
        self.writers.iter().map(|(k, l)| (*k, *l))
    }

    pub fn writer_length(&self, key: &WriterKey) -> Option<u64> {
        self.writers.get(key).copied()
    }

    pub fn is_member(&self, key: &WriterKey) -> bool {
        self.writers.contains_key(key)
    }

    /// Committed heads at the last flush.
    pub fn heads(&self) -> &[IndexHead] {
        &self.heads
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    /// The committed digest.
    pub fn digest(&self) -> SystemDigest {
        SystemDigest {
            writers: self
                .writers
                .iter()
                .map(|(k, l)| IndexHead::new(*k, *l))
                .collect(),
            heads: self.heads.clone(),
            checkpoint: self.checkpoint.clone(),
        }
    }

    /// Stages a writer addition. Valid only inside an apply call.
    pub fn add_writer(&mut self, key: WriterKey) -> Result<(), ViewError> {
        if !self.gate.is_active() {
            return Err(ViewError::OutsideApply("system".to_owned()));
        }
        info!(writer = %key, "staging writer addition");
        self.changes.push(SystemChange::Add(key));
        self.staged += 1;
        Ok(())
    }

    /// Stages a writer removal. Valid only inside an apply call.
    pub fn remove_writer(&mut self, key: WriterKey) -> Result<(), ViewError> {
        if !self.gate.is_active() {
            return Err(ViewError::OutsideApply("system".to_owned()));
        }
        info!(writer = %key, "staging writer removal");
        self.changes.push(SystemChange::Remove(key));
        self.staged += 1;
        Ok(())
    }

    /// Hands the in-flight apply's change count to its update record.
    pub fn take_staged(&mut self) -> u64 {
        std::mem::take(&mut self.staged) as u64
    }

    /// Drops the in-flight apply's changes after a handler failure.
    pub fn undo_staged(&mut self) {
        let keep = self.changes.len() - self.staged;
        self.changes.truncate(keep);
        self.staged = 0;
    }

    /// Records the consumed length of a writer that left the set, so late
    /// entries referencing its heads still resolve.
    pub fn note_retired(&mut self, key: WriterKey, length: u64) {
        let entry = self.retired.entry(key).or_insert(length);
        if *entry < length {
            *entry = length;
        }
    }

    /// Undoes the newest `count` speculative changes (popped entries).
    pub fn pop(&mut self, count: u64) {
        debug_assert!(self.staged == 0, "pop during an apply");
        let keep = self.changes.len().saturating_sub(count as usize);
        self.changes.truncate(keep);
    }

    /// Commits the oldest `count` speculative changes plus the current
    /// writer lengths, appends the new digest, and returns the checkpoint
    /// describing it.
    pub async fn flush(
        &mut self,
        count: u64,
        writer_lengths: &BTreeMap<WriterKey, u64>,
    ) -> Result<Checkpoint, ViewError> {
        // lengths first, so a writer removed in the same flush retires at
        // its final covered length
        for (key, length) in writer_lengths {
            if let Some(current) = self.writers.get_mut(key) {
                if *length > *current {
                    *current = *length;
                }
            }
        }

        for change in self.changes.drain(..count as usize).collect::<Vec<_>>() {
            match change {
                SystemChange::Add(key) => {
                    self.writers.entry(key).or_insert(0);
                    info!(writer = %key, "writer added");
                }
                SystemChange::Remove(key) => {
                    if let Some(length) = self.writers.remove(&key) {
                        self.note_retired(key, length);
                        info!(writer = %key, length, "writer removed");
                    }
                }
            }
        }

        self.heads = self
            .writers
            .iter()
            .filter(|(_, length)| **length > 0)
            .map(|(key, length)| IndexHead::new(*key, *length))
            .collect();

        self.bootstrapping = false;
        self.write_digest().await
    }

    async fn write_digest(&mut self) -> Result<Checkpoint, ViewError> {
        let previous_length = self.core.length().await;
        let digest = SystemDigest {
            writers: self
                .writers
                .iter()
                .map(|(k, l)| IndexHead::new(*k, *l))
                .collect(),
            heads: self.heads.clone(),
            // position superseded by this digest; empty before any flush
            checkpoint: (previous_length > 0)
                .then(|| Checkpoint::new(previous_length, Vec::new())),
        };
        let bytes = digest.encode()?;
        let new_length = self.core.append(vec![Bytes::from(bytes.clone())]).await?;
        let checkpoint = Checkpoint::new(new_length, bytes);
        self.checkpoint = Some(checkpoint.clone());
        debug!(length = new_length, "system digest flushed");
        Ok(checkpoint)
    }
}

impl IndexedLookup for SystemView {
    fn is_indexed(&self, key: &WriterKey, length: u64) -> bool {
        self.writers
            .get(key)
            .or_else(|| self.retired.get(key))
            .is_some_and(|committed| length <= *committed)
    }
}

impl fmt::Debug for SystemView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemView")
            .field("writers", &self.writers.len())
            .field("changes", &self.changes.len())
            .field("bootstrapping", &self.bootstrapping)
            .finish()
    }
}
