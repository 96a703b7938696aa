use braid_linearizer::LinearizerError;
use braid_oplog_types::CodecError;
use braid_transport::TransportError;
use braid_views::ViewError;
use thiserror::Error;

use crate::HandlerError;

/// Errors surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum EngineError {
    /// `append`/`ack` without a registered local writer.
    #[error("no local writer registered")]
    NotWritable,

    /// Underlying log failure (retryable on the next event).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Ingest or ordering failure.
    #[error("linearizer error: {0}")]
    Linearizer(#[from] LinearizerError),

    /// View or system-view failure; includes apply-context violations and
    /// the (fatal) corrupt-digest case.
    #[error("view error: {0}")]
    View(#[from] ViewError),

    /// Encoding a local block failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The user apply handler returned an error; the tick was aborted and
    /// its speculative output discarded.
    #[error("apply handler failed: {0}")]
    Apply(#[source] HandlerError),

    /// The orchestrator (or its task) has shut down.
    #[error("engine closed")]
    Closed,

    /// Internal bookkeeping violation.
    #[error("state invariant violated: {0}")]
    Invariant(&'static str),
}
