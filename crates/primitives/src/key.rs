use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};

/// Stable public-key identity of a writer.
///
/// Keys compare lexicographically; this ordering is the tie-break used by
/// the linearizer and the bootstrap-primary selection, so every participant
/// must agree on it.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize,
)]
pub struct WriterKey([u8; 32]);

impl WriterKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parses a key from a byte slice, rejecting anything but 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl From<[u8; 32]> for WriterKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for WriterKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for WriterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for WriterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form, enough to tell writers apart in logs
        write!(f, "WriterKey({}..)", hex::encode(&self.0[..4]))
    }
}
