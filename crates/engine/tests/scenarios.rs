//! End-to-end orchestrator scenarios over the in-memory transport.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use braid_engine::{
    ApplyContext, ApplyEntry, ApplyHandler, Engine, EngineBuilder, EngineError, EngineOptions,
    HandlerError,
};
use braid_oplog_types::OplogMessage;
use braid_primitives::{IndexHead, WriterKey};
use braid_transport::{LogStore, MemoryRegistry, MemoryStore, Oplog, UpdateOptions};
use braid_views::{ViewCore, ViewError, ViewStore};
use bytes::Bytes;

fn key(first: u8) -> WriterKey {
    let mut bytes = [0u8; 32];
    bytes[0] = first;
    WriterKey::new(bytes)
}

fn store_for(registry: &Arc<MemoryRegistry>, local: Option<WriterKey>) -> Arc<dyn LogStore> {
    Arc::new(MemoryStore::new(registry.clone(), local))
}

async fn view_values(core: &Arc<ViewCore>) -> Vec<Bytes> {
    let mut values = Vec::new();
    for seq in 0..core.length() {
        values.push(core.get(seq).await.unwrap().unwrap());
    }
    values
}

/// Appends every non-heartbeat value to the "default" view and counts
/// apply invocations.
struct ListHandler {
    calls: Arc<AtomicUsize>,
}

impl ListHandler {
    fn new() -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (Self { calls: calls.clone() }, calls)
    }
}

#[async_trait]
impl ApplyHandler for ListHandler {
    type View = Arc<ViewCore>;

    async fn open(&self, store: &mut ViewStore) -> Result<Self::View, ViewError> {
        Ok(store.get("default"))
    }

    async fn apply(
        &self,
        batch: &[ApplyEntry],
        view: &mut Self::View,
        _ctx: &mut ApplyContext<'_>,
    ) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for entry in batch {
            if let Some(value) = &entry.value {
                view.append(vec![value.clone()])?;
            }
        }
        Ok(())
    }
}

/// Value convention for membership tests: a tag byte, then either a
/// 32-byte writer key (add/remove) or a raw payload (data).
const OP_DATA: u8 = 0;
const OP_ADD: u8 = 1;
const OP_REMOVE: u8 = 2;

fn data(payload: &[u8]) -> Bytes {
    let mut bytes = vec![OP_DATA];
    bytes.extend_from_slice(payload);
    Bytes::from(bytes)
}

fn add_writer_op(key: WriterKey) -> Bytes {
    let mut bytes = vec![OP_ADD];
    bytes.extend_from_slice(key.as_bytes());
    Bytes::from(bytes)
}

fn remove_writer_op(key: WriterKey) -> Bytes {
    let mut bytes = vec![OP_REMOVE];
    bytes.extend_from_slice(key.as_bytes());
    Bytes::from(bytes)
}

struct OpsHandler;

#[async_trait]
impl ApplyHandler for OpsHandler {
    type View = Arc<ViewCore>;

    async fn open(&self, store: &mut ViewStore) -> Result<Self::View, ViewError> {
        Ok(store.get("default"))
    }

    async fn apply(
        &self,
        batch: &[ApplyEntry],
        view: &mut Self::View,
        ctx: &mut ApplyContext<'_>,
    ) -> Result<(), HandlerError> {
        for entry in batch {
            let Some(value) = &entry.value else { continue };
            match value[0] {
                OP_ADD => {
                    let writer = WriterKey::from_slice(&value[1..33]).ok_or("bad key")?;
                    ctx.add_writer(writer)?;
                }
                OP_REMOVE => {
                    let writer = WriterKey::from_slice(&value[1..33]).ok_or("bad key")?;
                    ctx.remove_writer(writer)?;
                }
                _ => view.append(vec![value.slice(1..)])?,
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn single_writer_bootstrap() {
    let local = key(1);
    let registry = MemoryRegistry::new();
    let store = store_for(&registry, Some(local));
    let (handler, calls) = ListHandler::new();
    let mut engine = Engine::open(store.clone(), handler, EngineOptions::default())
        .await
        .unwrap();
    assert!(engine.writable());

    engine
        .append_batch(vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
        ])
        .await
        .unwrap();

    // the local log holds three entries, each chaining onto the previous
    let log = store.open_writer(&local).await.unwrap();
    assert_eq!(log.length().await, 3);
    let decode = |bytes: Bytes| OplogMessage::decode(&bytes).unwrap();
    let first = decode(log.get(0).await.unwrap().unwrap());
    let second = decode(log.get(1).await.unwrap().unwrap());
    let third = decode(log.get(2).await.unwrap().unwrap());
    assert_eq!(
        (first.batch, second.batch, third.batch),
        (3, 2, 1),
        "batch counts down to the group boundary"
    );
    assert!(first.heads.is_empty());
    assert_eq!(second.heads, vec![IndexHead::new(local, 1)]);
    assert_eq!(third.heads, vec![IndexHead::new(local, 2)]);

    // the system bootstrapped with the local writer
    assert_eq!(
        engine.system().writers().collect::<Vec<_>>(),
        vec![(local, 3)]
    );

    // one apply call covered the whole batch; the view is fully indexed
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let view = engine.view("default");
    assert_eq!(view.indexed_length(), 3);
    assert_eq!(
        view_values(&view).await,
        vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
        ]
    );
}

#[tokio::test]
async fn advance_without_work_is_idempotent() {
    let local = key(1);
    let registry = MemoryRegistry::new();
    let store = store_for(&registry, Some(local));
    let (handler, calls) = ListHandler::new();
    let mut engine = Engine::open(store.clone(), handler, EngineOptions::default())
        .await
        .unwrap();

    engine.append(Bytes::from_static(b"a")).await.unwrap();
    let applied = calls.load(Ordering::SeqCst);

    engine.advance().await.unwrap();
    engine.advance().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), applied);
    let log = store.open_writer(&local).await.unwrap();
    assert_eq!(log.length().await, 1);
}

#[tokio::test]
async fn two_writers_disjoint_then_merging() {
    let registry = MemoryRegistry::new();
    let bootstraps = vec![key(1), key(2)];
    let options = EngineOptions {
        bootstraps: bootstraps.clone(),
        sparse: true,
    };

    let (handler_a, _) = ListHandler::new();
    let (handler_b, _) = ListHandler::new();
    let mut a = Engine::open(store_for(&registry, Some(key(1))), handler_a, options.clone())
        .await
        .unwrap();
    let mut b = Engine::open(store_for(&registry, Some(key(2))), handler_b, options)
        .await
        .unwrap();

    // disjoint writes
    a.append(data(b"x")).await.unwrap();
    b.append(data(b"y")).await.unwrap();

    // each learns the other's head, then appends an entry observing both
    a.advance().await.unwrap();
    b.advance().await.unwrap();
    a.append(data(b"za")).await.unwrap();
    b.advance().await.unwrap();
    b.append(data(b"zb")).await.unwrap();
    a.advance().await.unwrap();
    b.advance().await.unwrap();
    a.advance().await.unwrap();

    // both participants agree: x before y (key order), then the z entries
    let view_a = a.view("default");
    let view_b = b.view("default");
    let values_a = view_values(&view_a).await;
    let values_b = view_values(&view_b).await;
    assert_eq!(values_a[..2], [data(b"x"), data(b"y")]);
    assert_eq!(values_a, values_b);
    assert_eq!(view_a.indexed_length(), view_b.indexed_length());
    assert!(view_a.indexed_length() >= 2);
}

#[tokio::test]
async fn undo_on_reorder() {
    // writer keys chosen so the late writer sorts first
    let late = key(1);
    let mid = key(2);
    let high = key(3);
    let registry = MemoryRegistry::new();
    let bootstraps = vec![late, mid, high];
    let options = EngineOptions {
        bootstraps: bootstraps.clone(),
        sparse: true,
    };

    let (observer_handler, calls) = ListHandler::new();
    let mut observer = Engine::open(store_for(&registry, None), observer_handler, options.clone())
        .await
        .unwrap();
    assert!(!observer.writable());

    let (h1, _) = ListHandler::new();
    let (h2, _) = ListHandler::new();
    let (h3, _) = ListHandler::new();
    let mut writer_mid = Engine::open(store_for(&registry, Some(mid)), h2, options.clone())
        .await
        .unwrap();
    let mut writer_high = Engine::open(store_for(&registry, Some(high)), h3, options.clone())
        .await
        .unwrap();
    let mut writer_late = Engine::open(store_for(&registry, Some(late)), h1, options)
        .await
        .unwrap();

    writer_mid.append(data(b"p")).await.unwrap();
    writer_high.append(data(b"q")).await.unwrap();

    // the observer applies [p, q] speculatively
    observer.advance().await.unwrap();
    let view = observer.view("default");
    assert_eq!(view_values(&view).await, vec![data(b"p"), data(b"q")]);
    assert_eq!(view.indexed_length(), 0);
    let before = calls.load(Ordering::SeqCst);
    assert_eq!(before, 2);

    // a concurrent entry from the smallest key arrives late and must sort
    // first: both speculative entries are undone and reapplied after it
    writer_late.append(data(b"r")).await.unwrap();
    observer.advance().await.unwrap();

    assert_eq!(
        view_values(&view).await,
        vec![data(b"r"), data(b"p"), data(b"q")]
    );
    assert_eq!(view.indexed_length(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), before + 3);
}

#[tokio::test]
async fn membership_change_triggers_restart() {
    let registry = MemoryRegistry::new();
    let founder = key(1);
    let joiner = key(7);
    let options = EngineOptions {
        bootstraps: vec![founder],
        sparse: true,
    };

    let mut a = Engine::open(store_for(&registry, Some(founder)), OpsHandler, options.clone())
        .await
        .unwrap();

    a.append(data(b"x")).await.unwrap();
    let view_a = a.view("default");
    assert_eq!(view_a.indexed_length(), 1);

    // the add-writer entry commits, the digest changes, the engine
    // restarts on the new membership
    a.append(add_writer_op(joiner)).await.unwrap();
    assert!(a.system().is_member(&joiner));

    // no view block was written twice and nothing indexed was truncated
    assert_eq!(view_a.indexed_length(), 1);
    assert_eq!(view_values(&view_a).await, vec![Bytes::from_static(b"x")]);

    // with the joiner registered but silent, further entries stay
    // speculative
    a.append(data(b"d")).await.unwrap();
    assert_eq!(view_a.indexed_length(), 1);
    assert_eq!(view_a.tip_length(), 1);

    // the joiner catches up through the shared oplogs, becomes writable
    // after its own restart, and its heartbeat unblocks commitment
    let mut k = Engine::open(store_for(&registry, Some(joiner)), OpsHandler, options)
        .await
        .unwrap();
    assert!(!k.writable());
    k.advance().await.unwrap();
    assert!(k.system().is_member(&joiner));
    assert!(k.writable());
    k.ack().await.unwrap();

    a.advance().await.unwrap();
    assert_eq!(view_a.indexed_length(), 2);
    assert_eq!(
        view_values(&view_a).await,
        vec![Bytes::from_static(b"x"), Bytes::from_static(b"d")]
    );
}

#[tokio::test]
async fn checkpoint_recovery() {
    let local = key(1);
    let registry = MemoryRegistry::new();
    let store = store_for(&registry, Some(local));

    {
        let (handler, _) = ListHandler::new();
        let mut engine = Engine::open(store.clone(), handler, EngineOptions::default())
            .await
            .unwrap();
        engine
            .append_batch(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")])
            .await
            .unwrap();
        engine.append(Bytes::from_static(b"c")).await.unwrap();
        engine.close().await.unwrap();
    }

    // the latest local block points back to a checkpoint carrier
    let log = store.open_writer(&local).await.unwrap();
    let tail = OplogMessage::decode(&log.get(log.length().await - 1).await.unwrap().unwrap()).unwrap();
    assert!(tail.checkpointer > 0 || tail.checkpoint.is_some());

    let (handler, _) = ListHandler::new();
    let mut reopened = Engine::open(store.clone(), handler, EngineOptions::default())
        .await
        .unwrap();

    // the digest rehydrated the writer set
    assert_eq!(
        reopened.system().writers().collect::<Vec<_>>(),
        vec![(local, 3)]
    );

    // the best embedded checkpoint is readable and names a flushed digest
    let checkpoint = reopened.checkpoint().await.unwrap().unwrap();
    assert!(checkpoint.length >= 2);

    // the view resumes from its persisted prefix and keeps extending
    let view = reopened.view("default");
    assert_eq!(view.indexed_length(), 3);
    reopened.append(Bytes::from_static(b"d")).await.unwrap();
    assert_eq!(view.indexed_length(), 4);
}

#[tokio::test]
async fn removed_writer_drains_and_closes() {
    let registry = MemoryRegistry::new();
    let keeper = key(1);
    let leaver = key(2);
    let options = EngineOptions {
        bootstraps: vec![keeper, leaver],
        sparse: true,
    };

    let mut a = Engine::open(store_for(&registry, Some(keeper)), OpsHandler, options.clone())
        .await
        .unwrap();
    let mut b = Engine::open(store_for(&registry, Some(leaver)), OpsHandler, options)
        .await
        .unwrap();

    // settle a committed prefix with both writers active
    a.append(data(b"x")).await.unwrap();
    b.advance().await.unwrap();
    b.ack().await.unwrap();
    a.advance().await.unwrap();
    let view_a = a.view("default");
    assert_eq!(view_a.indexed_length(), 1);

    // a removes b; the entry commits once b acknowledges it
    a.append(remove_writer_op(leaver)).await.unwrap();
    assert!(a.system().is_member(&leaver));
    b.advance().await.unwrap();
    b.ack().await.unwrap();
    a.advance().await.unwrap();

    assert!(!a.system().is_member(&leaver));
    assert_eq!(a.heads().len(), 1);

    // entries b publishes after its removal never reach a's views
    let values_before = view_values(&view_a).await;
    let store_b = store_for(&registry, Some(leaver));
    let raw_b = store_b.open_local().await.unwrap().unwrap();
    let straggler = OplogMessage {
        value: Some(b"straggler".to_vec()),
        heads: vec![],
        batch: 1,
        checkpointer: 1,
        checkpoint: None,
    };
    raw_b
        .append(vec![Bytes::from(straggler.encode().unwrap())])
        .await
        .unwrap();

    a.update(UpdateOptions::default()).await.unwrap();
    assert_eq!(view_values(&view_a).await, values_before);
}

/// Fails its first apply call after producing speculative output; used to
/// pin the abort-and-retry semantics.
struct FailOnce {
    failed: Arc<AtomicBool>,
}

#[async_trait]
impl ApplyHandler for FailOnce {
    type View = Arc<ViewCore>;

    async fn open(&self, store: &mut ViewStore) -> Result<Self::View, ViewError> {
        Ok(store.get("default"))
    }

    async fn apply(
        &self,
        batch: &[ApplyEntry],
        view: &mut Self::View,
        _ctx: &mut ApplyContext<'_>,
    ) -> Result<(), HandlerError> {
        for entry in batch {
            if let Some(value) = &entry.value {
                view.append(vec![value.clone()])?;
            }
        }
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err("handler failure after partial output".into());
        }
        Ok(())
    }
}

#[tokio::test]
async fn apply_failure_rolls_back_tick() {
    let local = key(1);
    let registry = MemoryRegistry::new();
    let store = store_for(&registry, Some(local));
    let failed = Arc::new(AtomicBool::new(false));
    let handler = FailOnce { failed: failed.clone() };
    let mut engine = Engine::open(store.clone(), handler, EngineOptions::default())
        .await
        .unwrap();

    let result = engine.append(Bytes::from_static(b"a")).await;
    assert!(matches!(result, Err(EngineError::Apply(_))));

    // the failed call's speculative output was discarded
    let view = engine.view("default");
    assert_eq!(view.length(), 0);

    // the next tick retries the same batch and succeeds
    engine.advance().await.unwrap();
    assert_eq!(view.indexed_length(), 1);
    assert_eq!(view_values(&view).await, vec![Bytes::from_static(b"a")]);
}

#[tokio::test]
async fn not_writable_without_local_writer() {
    let registry = MemoryRegistry::new();
    let (handler, _) = ListHandler::new();
    let mut observer = Engine::open(
        store_for(&registry, None),
        handler,
        EngineOptions {
            bootstraps: vec![key(1)],
            sparse: true,
        },
    )
    .await
    .unwrap();

    assert!(!observer.writable());
    assert!(matches!(
        observer.append(Bytes::from_static(b"x")).await,
        Err(EngineError::NotWritable)
    ));
    assert!(matches!(observer.ack().await, Err(EngineError::NotWritable)));
}

#[tokio::test]
async fn task_handle_replicates_between_participants() {
    let registry = MemoryRegistry::new();
    let bootstraps = vec![key(1), key(2)];

    let (writer_handler, _) = ListHandler::new();
    let (a, a_task) = EngineBuilder::new(store_for(&registry, Some(key(1))), writer_handler)
        .with_bootstraps(bootstraps.clone())
        .build()
        .await
        .unwrap();
    let (reader_handler, _) = ListHandler::new();
    let reader_store = Arc::new(MemoryStore::new(registry.clone(), Some(key(2))));
    let (b, b_task) = EngineBuilder::new(reader_store.clone() as Arc<dyn LogStore>, reader_handler)
        .with_bootstraps(bootstraps)
        .build()
        .await
        .unwrap();
    tokio::spawn(a_task);
    tokio::spawn(b_task);

    assert!(a.writable());
    a.append(data(b"hello")).await.unwrap();

    // b's debounced advance absorbs the entry; its heartbeats publish the
    // freshest heads until the entry commits into b's materialization
    let view_log = reader_store.open_view("default").await.unwrap();
    let mut settled = false;
    for _ in 0..100 {
        b.ack().await.unwrap();
        if view_log.length().await >= 1 {
            settled = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(settled, "replicated entry never materialized");
    assert_eq!(
        view_log.get(0).await.unwrap().unwrap(),
        data(b"hello")
    );

    a.close().await.unwrap();
    b.close().await.unwrap();
}
