use std::{collections::BTreeMap, sync::Arc};

use braid_transport::LogStore;
use tracing::debug;

use crate::{ApplyGate, ViewCore, ViewError};

/// Named view cores, created lazily.
///
/// A core requested for the first time (at open or from inside an apply)
/// starts without an underlying log; pending cores are readied at the end
/// of the advance tick so the apply handler never suspends on a log open.
#[derive(Debug)]
pub struct ViewStore {
    gate: Arc<ApplyGate>,
    cores: BTreeMap<String, Arc<ViewCore>>,
    pending: Vec<Arc<ViewCore>>,
}

impl ViewStore {
    pub fn new(gate: Arc<ApplyGate>) -> Self {
        Self {
            gate,
            cores: BTreeMap::new(),
            pending: Vec::new(),
        }
    }

    /// Session on the named core, creating it lazily.
    pub fn get(&mut self, name: &str) -> Arc<ViewCore> {
        if let Some(core) = self.cores.get(name) {
            return core.clone();
        }
        let core = ViewCore::new(name, self.gate.clone());
        self.cores.insert(name.to_owned(), core.clone());
        self.pending.push(core.clone());
        debug!(view = name, "view core created");
        core
    }

    pub fn core(&self, name: &str) -> Option<&Arc<ViewCore>> {
        self.cores.get(name)
    }

    pub fn cores(&self) -> impl Iterator<Item = &Arc<ViewCore>> {
        self.cores.values()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Opens underlying logs for cores created since the last tick.
    pub async fn ready_pending(&mut self, store: &Arc<dyn LogStore>) -> Result<(), ViewError> {
        for core in std::mem::take(&mut self.pending) {
            let log = store.open_view(core.name()).await?;
            let length = log.length().await;
            core.ready(log, length);
            debug!(view = core.name(), length, "view core ready");
        }
        Ok(())
    }

    /// Promotes every core's in-flight appends, returning the per-view
    /// block counts of the completed apply call.
    pub fn collect_appending(&self) -> Vec<(String, u64)> {
        self.cores
            .iter()
            .filter_map(|(name, core)| {
                let count = core.take_appending();
                (count > 0).then(|| (name.clone(), count))
            })
            .collect()
    }

    /// Discards every core's in-flight appends after a failed apply.
    pub fn discard_appending(&self) {
        for core in self.cores.values() {
            core.undo_appending();
        }
    }
}
