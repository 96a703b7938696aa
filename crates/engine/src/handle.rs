use std::{future::Future, sync::Arc};

use braid_oplog_types::Checkpoint;
use braid_primitives::WriterKey;
use braid_transport::{LogStore, UpdateOptions};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::{
    task::{engine_task, Command},
    ApplyHandler, Engine, EngineError, EngineOptions,
};

/// Handle onto a spawned engine task.
#[derive(Debug, Clone)]
pub struct Autobase {
    commands: mpsc::UnboundedSender<Command>,
    writable: bool,
}

impl Autobase {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| EngineError::Closed)?;
        response.await.map_err(|_| EngineError::Closed)?
    }

    /// Appends one value to the local writer's log.
    pub async fn append(&self, value: Bytes) -> Result<(), EngineError> {
        self.append_batch(vec![value]).await
    }

    /// Appends a group of values as one atomic batch.
    pub async fn append_batch(&self, values: Vec<Bytes>) -> Result<(), EngineError> {
        self.request(|reply| Command::Append { values, reply }).await
    }

    /// Publishes a heartbeat that advances heads.
    pub async fn ack(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Ack { reply }).await
    }

    /// Pulls remote writer state.
    pub async fn update(&self, opts: UpdateOptions) -> Result<(), EngineError> {
        self.request(|reply| Command::Update { opts, reply }).await
    }

    /// Best checkpoint available across writers.
    pub async fn checkpoint(&self) -> Result<Option<Checkpoint>, EngineError> {
        self.request(|reply| Command::Checkpoint { reply }).await
    }

    /// Whether this participant has a local writer.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Stops the engine task, completing in-flight work first.
    pub async fn close(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Close { reply }).await
    }
}

/// Builds an engine and the task driving it.
pub struct EngineBuilder<H> {
    store: Arc<dyn LogStore>,
    handler: H,
    options: EngineOptions,
}

impl<H> std::fmt::Debug for EngineBuilder<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("options", &self.options)
            .finish()
    }
}

impl<H: ApplyHandler> EngineBuilder<H> {
    pub fn new(store: Arc<dyn LogStore>, handler: H) -> Self {
        Self {
            store,
            handler,
            options: EngineOptions::default(),
        }
    }

    /// Sets the initial writer set.
    pub fn with_bootstraps(mut self, bootstraps: Vec<WriterKey>) -> Self {
        self.options.bootstraps = bootstraps;
        self
    }

    /// Controls eager block downloading on `update`.
    pub fn with_sparse(mut self, sparse: bool) -> Self {
        self.options.sparse = sparse;
        self
    }

    /// Opens the engine and returns the command handle plus the task
    /// future; callers spawn the future on their runtime.
    pub async fn build(self) -> Result<(Autobase, impl Future<Output = ()>), EngineError> {
        let engine = Engine::open(self.store, self.handler, self.options).await?;
        let writable = engine.writable();
        let (commands, receiver) = mpsc::unbounded_channel();
        let handle = Autobase { commands, writable };
        let task = engine_task(engine, receiver);
        Ok((handle, task))
    }
}
