use braid_oplog_types::CodecError;
use braid_transport::TransportError;
use thiserror::Error;

/// Errors raised by view and system-view operations.
#[derive(Debug, Error)]
pub enum ViewError {
    /// A view or the system was mutated outside an active apply call.
    #[error("'{0}' mutated outside an active apply")]
    OutsideApply(String),

    /// Underlying log failure (retryable).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The system digest failed to decode. There is no recovery path.
    #[error("digest error: {0}")]
    Digest(#[from] CodecError),
}
