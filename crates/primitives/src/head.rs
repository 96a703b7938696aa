use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::WriterKey;

/// Reference to the tip of a writer's log: the writer's key and the length
/// of the log at the referenced point (1-based, so `length >= 1` for any
/// real entry).
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct IndexHead {
    pub key: WriterKey,
    pub length: u64,
}

impl IndexHead {
    pub fn new(key: WriterKey, length: u64) -> Self {
        Self { key, length }
    }
}

impl fmt::Debug for IndexHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.key, self.length)
    }
}
