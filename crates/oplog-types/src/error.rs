use thiserror::Error;

/// Errors raised while encoding or decoding wire records.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The byte payload did not parse as the expected record.
    #[error("malformed record: {0}")]
    Malformed(#[from] std::io::Error),

    /// The record parsed but violates a structural invariant.
    #[error("invalid record: {0}")]
    Invalid(&'static str),
}
