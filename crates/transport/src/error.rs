use thiserror::Error;

/// Errors surfaced by the log transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Append attempted on a log this participant cannot write.
    #[error("log is not writable")]
    NotWritable,

    /// The log (or its store) has been closed.
    #[error("log closed")]
    Closed,

    /// Underlying storage or network failure; retryable.
    #[error("transport io error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }
}
