use std::{fmt, sync::Arc};

use braid_transport::Oplog;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::{ApplyGate, ViewError};

struct CoreState {
    /// Underlying log; `None` until the store readies the core at the end
    /// of the advance tick that created it.
    log: Option<Arc<dyn Oplog>>,
    /// Length of the persisted prefix.
    indexed_length: u64,
    /// Speculative blocks above the persisted prefix.
    tip: Vec<Bytes>,
    /// Blocks appended by the in-flight apply call, promoted into the tip
    /// proper when the call completes.
    appending: u64,
    /// Blocks currently being moved from tip to the underlying log.
    indexing: u64,
}

/// A named materialized log with three length regions: the persisted
/// `indexed` prefix, the speculative `tip`, and the in-flight `appending`
/// count.
///
/// Handles are shared with the apply handler; mutation is gated on an
/// active apply.
pub struct ViewCore {
    name: String,
    gate: Arc<ApplyGate>,
    state: Mutex<CoreState>,
}

impl ViewCore {
    /// Creates a core whose underlying log is opened later.
    pub fn new(name: impl Into<String>, gate: Arc<ApplyGate>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            gate,
            state: Mutex::new(CoreState {
                log: None,
                indexed_length: 0,
                tip: Vec::new(),
                appending: 0,
                indexing: 0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().log.is_some()
    }

    /// Attaches the underlying log; its current length becomes the
    /// persisted prefix.
    pub fn ready(&self, log: Arc<dyn Oplog>, persisted_length: u64) {
        let mut state = self.state.lock();
        debug_assert!(state.log.is_none());
        state.log = Some(log);
        state.indexed_length = persisted_length;
    }

    pub fn log(&self) -> Option<Arc<dyn Oplog>> {
        self.state.lock().log.clone()
    }

    /// Total visible length: persisted prefix plus tip.
    pub fn length(&self) -> u64 {
        let state = self.state.lock();
        state.indexed_length + state.tip.len() as u64
    }

    pub fn indexed_length(&self) -> u64 {
        self.state.lock().indexed_length
    }

    pub fn tip_length(&self) -> u64 {
        self.state.lock().tip.len() as u64
    }

    /// Appends blocks from the apply handler.
    pub fn append(&self, blocks: Vec<Bytes>) -> Result<(), ViewError> {
        if !self.gate.is_active() {
            return Err(ViewError::OutsideApply(self.name.clone()));
        }
        let mut state = self.state.lock();
        state.appending += blocks.len() as u64;
        state.tip.extend(blocks);
        trace!(view = %self.name, appending = state.appending, "view append");
        Ok(())
    }

    /// Promotes the in-flight appends into the tip proper, returning how
    /// many blocks the completed apply contributed.
    pub fn take_appending(&self) -> u64 {
        let mut state = self.state.lock();
        std::mem::take(&mut state.appending)
    }

    /// Discards the in-flight appends of a failed apply call.
    pub fn undo_appending(&self) -> u64 {
        let mut state = self.state.lock();
        let count = std::mem::take(&mut state.appending);
        let keep = state.tip.len() - count as usize;
        state.tip.truncate(keep);
        count
    }

    /// Truncates the tip by `count` blocks after the linearizer popped the
    /// corresponding entries.
    pub fn on_undo(&self, count: u64) {
        if count == 0 {
            return;
        }
        let mut state = self.state.lock();
        debug_assert!(state.appending == 0, "undo during an apply");
        let keep = state.tip.len().saturating_sub(count as usize);
        state.tip.truncate(keep);
        trace!(view = %self.name, count, tip = state.tip.len(), "view undo");
    }

    /// Snapshot of the oldest `count` tip blocks, about to be persisted.
    /// The region stays visible in the tip until [`ViewCore::on_index`]
    /// confirms the write.
    pub fn indexing_blocks(&self, count: u64) -> Vec<Bytes> {
        let mut state = self.state.lock();
        state.indexing = count;
        state.tip.iter().take(count as usize).cloned().collect()
    }

    /// Moves `count` blocks from the tip into the persisted prefix after
    /// their log append succeeded.
    pub fn on_index(&self, count: u64) {
        if count == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.tip.drain(..count as usize);
        state.indexed_length += count;
        state.indexing = 0;
        trace!(view = %self.name, indexed = state.indexed_length, "view indexed");
    }

    /// Block at `seq`, reading the persisted prefix or the tip.
    pub async fn get(&self, seq: u64) -> Result<Option<Bytes>, ViewError> {
        let log = {
            let state = self.state.lock();
            if seq >= state.indexed_length {
                let at = (seq - state.indexed_length) as usize;
                return Ok(state.tip.get(at).cloned());
            }
            state.log.clone()
        };
        match log {
            Some(log) => Ok(log.get(seq).await?),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for ViewCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ViewCore")
            .field("name", &self.name)
            .field("indexed_length", &state.indexed_length)
            .field("tip", &state.tip.len())
            .field("appending", &state.appending)
            .finish()
    }
}
