use std::sync::Arc;

use async_trait::async_trait;
use braid_primitives::{IndexHead, WriterKey};
use braid_views::{SystemView, ViewCore, ViewError, ViewStore};
use bytes::Bytes;

/// Error type produced by user apply handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// One totally-ordered entry handed to the apply handler.
///
/// `value` is `None` for heartbeat entries (`ack`); handlers typically
/// skip those. `indexed` reports whether the entry is already part of the
/// committed prefix or still speculative.
#[derive(Debug, Clone)]
pub struct ApplyEntry {
    pub indexed: bool,
    pub from: WriterKey,
    pub length: u64,
    pub value: Option<Bytes>,
    pub heads: Vec<IndexHead>,
}

/// Capabilities available to the apply handler while a call is active:
/// view sessions and membership changes.
#[derive(Debug)]
pub struct ApplyContext<'a> {
    system: &'a mut SystemView,
    views: &'a mut ViewStore,
}

impl<'a> ApplyContext<'a> {
    pub(crate) fn new(system: &'a mut SystemView, views: &'a mut ViewStore) -> Self {
        Self { system, views }
    }

    /// Session on the named view core, created lazily.
    pub fn view(&mut self, name: &str) -> Arc<ViewCore> {
        self.views.get(name)
    }

    /// Stages the addition of a writer to the authoritative set. Takes
    /// effect (and forces a restart) once the current entry is indexed.
    pub fn add_writer(&mut self, key: WriterKey) -> Result<(), ViewError> {
        self.system.add_writer(key)
    }

    /// Stages the removal of a writer from the authoritative set.
    pub fn remove_writer(&mut self, key: WriterKey) -> Result<(), ViewError> {
        self.system.remove_writer(key)
    }

    /// Read access to the committed membership state.
    pub fn system(&self) -> &SystemView {
        self.system
    }
}

/// User-supplied view semantics.
///
/// `open` runs once at startup and builds the handler's view object from
/// view-store sessions; `apply` runs once per atomic batch of the
/// linearized sequence and is the only place view appends and membership
/// changes are permitted.
#[async_trait]
pub trait ApplyHandler: Send + Sync + 'static {
    type View: Send + 'static;

    async fn open(&self, store: &mut ViewStore) -> Result<Self::View, ViewError>;

    async fn apply(
        &self,
        batch: &[ApplyEntry],
        view: &mut Self::View,
        ctx: &mut ApplyContext<'_>,
    ) -> Result<(), HandlerError>;
}
