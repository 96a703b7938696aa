//! In-memory transport used by tests and single-process embedders.
//!
//! Writer logs live in a [`MemoryRegistry`] shared between stores, so two
//! stores built on the same registry see each other's appends immediately —
//! a stand-in for the replication layer. View logs are materializations
//! owned by one participant and are private to each store.

use std::{
    collections::HashMap,
    ops::Range,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use braid_primitives::WriterKey;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::trace;

use crate::{LogStore, Oplog, TransportError, UpdateOptions};

#[derive(Debug)]
struct LogShared {
    key: WriterKey,
    blocks: RwLock<Vec<Bytes>>,
    length_tx: watch::Sender<u64>,
}

impl LogShared {
    fn new(key: WriterKey) -> Arc<Self> {
        let (length_tx, _) = watch::channel(0);
        Arc::new(Self {
            key,
            blocks: RwLock::new(Vec::new()),
            length_tx,
        })
    }
}

/// Handle on one in-memory log. Cheap to clone via the store; handles onto
/// the same underlying log share blocks and length notifications.
#[derive(Debug)]
pub struct MemoryLog {
    shared: Arc<LogShared>,
    writable: bool,
    closed: AtomicBool,
}

impl MemoryLog {
    fn new(shared: Arc<LogShared>, writable: bool) -> Self {
        Self {
            shared,
            writable,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Oplog for MemoryLog {
    fn key(&self) -> WriterKey {
        self.shared.key
    }

    fn writable(&self) -> bool {
        self.writable && !self.closed.load(Ordering::Acquire)
    }

    async fn length(&self) -> u64 {
        self.shared.blocks.read().len() as u64
    }

    async fn has(&self, seq: u64) -> bool {
        (seq as usize) < self.shared.blocks.read().len()
    }

    async fn get(&self, seq: u64) -> Result<Option<Bytes>, TransportError> {
        self.ensure_open()?;
        Ok(self.shared.blocks.read().get(seq as usize).cloned())
    }

    async fn append(&self, blocks: Vec<Bytes>) -> Result<u64, TransportError> {
        self.ensure_open()?;
        if !self.writable {
            return Err(TransportError::NotWritable);
        }

        let mut guard = self.shared.blocks.write();
        guard.extend(blocks);
        let length = guard.len() as u64;
        drop(guard);

        trace!(key = %self.shared.key, length, "memory log appended");
        self.shared.length_tx.send_replace(length);
        Ok(length)
    }

    async fn update(&self, _opts: UpdateOptions) -> Result<bool, TransportError> {
        // the registry is always current; nothing to pull
        self.ensure_open()?;
        Ok(false)
    }

    async fn download(&self, _range: Range<u64>) -> Result<(), TransportError> {
        self.ensure_open()?;
        Ok(())
    }

    fn watch_length(&self) -> watch::Receiver<u64> {
        self.shared.length_tx.subscribe()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Shared home of writer logs. Stores built on the same registry emulate a
/// fully-connected swarm.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    logs: Mutex<HashMap<WriterKey, Arc<LogShared>>>,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn open(&self, key: WriterKey) -> Arc<LogShared> {
        self.logs
            .lock()
            .entry(key)
            .or_insert_with(|| LogShared::new(key))
            .clone()
    }
}

/// Per-participant store over a shared registry.
#[derive(Debug)]
pub struct MemoryStore {
    registry: Arc<MemoryRegistry>,
    local: Option<WriterKey>,
    views: Mutex<HashMap<String, Arc<LogShared>>>,
}

impl MemoryStore {
    pub fn new(registry: Arc<MemoryRegistry>, local: Option<WriterKey>) -> Self {
        Self {
            registry,
            local,
            views: Mutex::new(HashMap::new()),
        }
    }

    /// Standalone store with its own registry (single-participant use).
    pub fn standalone(local: Option<WriterKey>) -> Self {
        Self::new(MemoryRegistry::new(), local)
    }

    fn view_key(name: &str) -> WriterKey {
        let mut bytes = [0u8; 32];
        for (slot, b) in bytes.iter_mut().zip(name.as_bytes()) {
            *slot = *b;
        }
        WriterKey::new(bytes)
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    fn local_key(&self) -> Option<WriterKey> {
        self.local
    }

    async fn open_writer(&self, key: &WriterKey) -> Result<Arc<dyn Oplog>, TransportError> {
        let writable = self.local == Some(*key);
        let shared = self.registry.open(*key);
        Ok(Arc::new(MemoryLog::new(shared, writable)))
    }

    async fn open_local(&self) -> Result<Option<Arc<dyn Oplog>>, TransportError> {
        match self.local {
            Some(key) => Ok(Some(self.open_writer(&key).await?)),
            None => Ok(None),
        }
    }

    async fn open_view(&self, name: &str) -> Result<Arc<dyn Oplog>, TransportError> {
        let address = format!("view/{name}");
        let shared = self
            .views
            .lock()
            .entry(address)
            .or_insert_with(|| LogShared::new(Self::view_key(name)))
            .clone();
        Ok(Arc::new(MemoryLog::new(shared, true)))
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(first: u8) -> WriterKey {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        WriterKey::new(bytes)
    }

    #[tokio::test]
    async fn test_append_and_get() {
        let store = MemoryStore::standalone(Some(key(1)));
        let log = store.open_local().await.unwrap().unwrap();

        let len = log
            .append(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")])
            .await
            .unwrap();
        assert_eq!(len, 2);
        assert_eq!(log.length().await, 2);
        assert_eq!(log.get(0).await.unwrap().unwrap(), Bytes::from_static(b"a"));
        assert!(log.get(2).await.unwrap().is_none());
        assert!(log.has(1).await);
        assert!(!log.has(2).await);
    }

    #[tokio::test]
    async fn test_remote_handle_is_read_only() {
        let registry = MemoryRegistry::new();
        let writer = MemoryStore::new(registry.clone(), Some(key(1)));
        let reader = MemoryStore::new(registry, Some(key(2)));

        let local = writer.open_local().await.unwrap().unwrap();
        local.append(vec![Bytes::from_static(b"x")]).await.unwrap();

        let remote = reader.open_writer(&key(1)).await.unwrap();
        assert!(!remote.writable());
        assert_eq!(remote.length().await, 1);
        assert!(matches!(
            remote.append(vec![Bytes::from_static(b"y")]).await,
            Err(TransportError::NotWritable)
        ));
    }

    #[tokio::test]
    async fn test_length_watch_fires_across_stores() {
        let registry = MemoryRegistry::new();
        let writer = MemoryStore::new(registry.clone(), Some(key(1)));
        let reader = MemoryStore::new(registry, None);

        let remote = reader.open_writer(&key(1)).await.unwrap();
        let mut lengths = remote.watch_length();
        assert_eq!(*lengths.borrow(), 0);

        let local = writer.open_local().await.unwrap().unwrap();
        local.append(vec![Bytes::from_static(b"x")]).await.unwrap();

        lengths.changed().await.unwrap();
        assert_eq!(*lengths.borrow_and_update(), 1);
    }

    #[tokio::test]
    async fn test_view_logs_are_per_store() {
        let registry = MemoryRegistry::new();
        let a = MemoryStore::new(registry.clone(), None);
        let b = MemoryStore::new(registry, None);

        let view_a = a.open_view("default").await.unwrap();
        view_a.append(vec![Bytes::from_static(b"1")]).await.unwrap();

        let view_b = b.open_view("default").await.unwrap();
        assert_eq!(view_b.length().await, 0);

        // reopening on the same store sees the same log
        let view_a2 = a.open_view("default").await.unwrap();
        assert_eq!(view_a2.length().await, 1);
    }

    #[tokio::test]
    async fn test_closed_handle_rejects_io() {
        let store = MemoryStore::standalone(Some(key(1)));
        let log = store.open_local().await.unwrap().unwrap();
        log.close().await.unwrap();

        assert!(matches!(log.get(0).await, Err(TransportError::Closed)));
        assert!(!log.writable());
    }
}
