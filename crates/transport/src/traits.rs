use std::{ops::Range, sync::Arc};

use async_trait::async_trait;
use braid_primitives::WriterKey;
use bytes::Bytes;
use tokio::sync::watch;

use crate::TransportError;

/// Options for pulling remote state on [`Oplog::update`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Block until the remote side has been consulted at least once.
    pub wait: bool,
}

/// One append-only log, identified by its writer's public key.
///
/// Readers may race the replication layer freely; `length` only ever
/// grows. `append` is valid only on the locally-owned log.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait Oplog: Send + Sync {
    fn key(&self) -> WriterKey;

    fn writable(&self) -> bool;

    async fn length(&self) -> u64;

    /// Whether the block at `seq` is locally available (sparse logs may
    /// know a length without holding every block).
    async fn has(&self, seq: u64) -> bool;

    /// Block at `seq`, or `None` when it is not locally available yet.
    async fn get(&self, seq: u64) -> Result<Option<Bytes>, TransportError>;

    /// Appends blocks to the local log, returning the new length.
    async fn append(&self, blocks: Vec<Bytes>) -> Result<u64, TransportError>;

    /// Pulls remote progress. Returns whether the known length changed.
    async fn update(&self, opts: UpdateOptions) -> Result<bool, TransportError>;

    /// Requests local availability of a block range.
    async fn download(&self, range: Range<u64>) -> Result<(), TransportError>;

    /// Notification channel carrying the log length; fires on every append
    /// (local or replicated).
    fn watch_length(&self) -> watch::Receiver<u64>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Factory for the logs a participant works with: remote writer logs by
/// key, the locally-owned writer log, and named view logs
/// (`view/<name>`).
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Key of the locally-owned writer log, if this participant has one.
    fn local_key(&self) -> Option<WriterKey>;

    async fn open_writer(&self, key: &WriterKey) -> Result<Arc<dyn Oplog>, TransportError>;

    async fn open_local(&self) -> Result<Option<Arc<dyn Oplog>>, TransportError>;

    /// Opens the participant-local materialized log for a named view.
    async fn open_view(&self, name: &str) -> Result<Arc<dyn Oplog>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
