use braid_oplog_types::CodecError;
use braid_transport::TransportError;
use thiserror::Error;

/// Errors raised while ingesting or ordering log entries.
#[derive(Debug, Error)]
pub enum LinearizerError {
    /// Reading a block from the underlying log failed (retryable).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A fetched block did not decode under the oplog layout. Fatal for
    /// the producing writer's progress at that offset.
    #[error("decode error: {0}")]
    Decode(#[from] CodecError),
}

pub type Result<T> = std::result::Result<T, LinearizerError>;
