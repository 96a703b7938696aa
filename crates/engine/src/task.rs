use braid_oplog_types::Checkpoint;
use braid_transport::UpdateOptions;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{ApplyHandler, Engine, EngineError};

/// Requests routed onto the engine task.
#[derive(Debug)]
pub(crate) enum Command {
    Append {
        values: Vec<Bytes>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Ack {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Update {
        opts: UpdateOptions,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Checkpoint {
        reply: oneshot::Sender<Result<Option<Checkpoint>, EngineError>>,
    },
    Close {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

/// Drives the engine: commands run inline, transport append events wake
/// the debounced advance.
///
/// The wake channel holds a single permit, so any number of bumps during
/// an active advance collapse into exactly one re-run after it completes.
/// Advance failures are caught here (the safety net) and retried on the
/// next event rather than poisoning the loop.
pub(crate) async fn engine_task<H: ApplyHandler>(
    mut engine: Engine<H>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let wake = engine.waker();
    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    None => break,
                    Some(Command::Append { values, reply }) => {
                        let _ = reply.send(engine.append_batch(values).await);
                    }
                    Some(Command::Ack { reply }) => {
                        let _ = reply.send(engine.ack().await);
                    }
                    Some(Command::Update { opts, reply }) => {
                        let _ = reply.send(engine.update(opts).await);
                    }
                    Some(Command::Checkpoint { reply }) => {
                        let _ = reply.send(engine.checkpoint().await);
                    }
                    Some(Command::Close { reply }) => {
                        let _ = reply.send(engine.close().await);
                        break;
                    }
                }
            }
            _ = wake.notified() => {
                if let Err(advance_error) = engine.advance().await {
                    warn!(error = %advance_error, "advance failed; awaiting next event");
                }
            }
        }
    }

    if let Err(close_error) = engine.close().await {
        warn!(error = %close_error, "engine close failed");
    }
    debug!("engine task stopped");
}
